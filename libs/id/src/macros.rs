//! Macros for defining typed ID types.

/// Macro to define a typed ID with a specific prefix and body length.
///
/// This generates a newtype wrapper around `String` with:
/// - `PREFIX` and `BODY_LEN` constants
/// - `new()` to generate a fresh random ID
/// - `parse()` to parse from string
/// - `Display`, `FromStr` and `AsRef<str>` implementations
/// - `Serialize` and `Deserialize` implementations
///
/// # Example
///
/// ```ignore
/// define_id!(NamespaceId, "w", 24);
///
/// let namespace = NamespaceId::new();
/// let parsed: NamespaceId = "w0f8d2kq9x3m1c7h5s4b6n2ta".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal, $body_len:literal) => {
        /// A typed ID for this resource type.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Number of random characters after the prefix.
            pub const BODY_LEN: usize = $body_len;

            /// Creates a new random ID.
            #[must_use]
            pub fn new() -> Self {
                Self(format!("{}{}", Self::PREFIX, $crate::random_body(Self::BODY_LEN)))
            }

            /// Parses an ID from a string.
            ///
            /// The string must be `{prefix}` followed by exactly `BODY_LEN`
            /// lowercase alphanumeric characters.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let Some(body) = s.strip_prefix(Self::PREFIX) else {
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: s.chars().take(Self::PREFIX.len()).collect(),
                    });
                };

                $crate::validate_body(body, Self::BODY_LEN)?;
                Ok(Self(s.to_string()))
            }

            /// Returns the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
