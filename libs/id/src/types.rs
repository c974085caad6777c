//! Typed ID definitions for worker-managed resources.

use crate::define_id;

// =============================================================================
// Local Runtime
// =============================================================================

define_id!(ContainerId, "r", 25);

// =============================================================================
// Kubernetes
// =============================================================================

define_id!(WorkspaceId, "w", 24);
define_id!(NamespaceId, "w", 24);
define_id!(StorageId, "w", 24);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_container_id_roundtrip() {
        let id = ContainerId::new();
        let parsed: ContainerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_container_id_shape() {
        let id = ContainerId::new();
        assert!(id.as_str().starts_with('r'));
        assert_eq!(id.as_str().len(), 26);
    }

    #[test]
    fn test_workspace_id_shape() {
        let id = WorkspaceId::new();
        assert!(id.as_str().starts_with('w'));
        assert_eq!(id.as_str().len(), 25);
    }

    #[test]
    fn test_invalid_prefix() {
        let result: Result<NamespaceId, _> = "r0f8d2kq9x3m1c7h5s4b6n2ta".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_invalid_length() {
        let result: Result<StorageId, _> = "wabc".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidLength {
                expected: 24,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_uppercase_rejected() {
        let result: Result<WorkspaceId, _> = "w0F8d2kq9x3m1c7h5s4b6n2ta".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidCharacter('F')
        ));
    }

    #[test]
    fn test_empty() {
        let result: Result<ContainerId, _> = "".parse();
        assert!(result.unwrap_err().is_empty());
    }

    #[test]
    fn test_json_roundtrip() {
        let id = NamespaceId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let parsed: NamespaceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_json_rejects_malformed() {
        let result: Result<NamespaceId, _> = serde_json::from_str("\"default\"");
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn generated_ids_always_parse(_seed in 0u32..1000) {
            let id = ContainerId::new();
            prop_assert_eq!(ContainerId::parse(id.as_str()).unwrap(), id);
        }

        #[test]
        fn foreign_characters_never_parse(body in "[a-z0-9]{23}", bad in "[A-Z_.-]") {
            let candidate = format!("w{}{}", body, bad);
            prop_assert!(WorkspaceId::parse(&candidate).is_err());
        }
    }
}
