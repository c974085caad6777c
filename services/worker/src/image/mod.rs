//! Image references and the reference-counted image cache.

mod cache;

pub use cache::{CacheStats, ImageCache, ImageCacheConfig};

/// Append `:latest` when the reference carries no tag or digest.
///
/// A registry port (`host:5000/app`) is not a tag.
pub fn normalize_image(image: &str) -> String {
    let image = image.trim();
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') || last.contains('@') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

/// Split a normalized reference into repository and tag (or digest).
pub fn split_image(image: &str) -> (&str, &str) {
    if let Some((repo, digest)) = image.split_once('@') {
        return (repo, digest);
    }
    let slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[slash..].rfind(':') {
        Some(i) => (&image[..slash + i], &image[slash + i + 1..]),
        None => (image, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_image() {
        assert_eq!(normalize_image("nginx"), "nginx:latest");
        assert_eq!(normalize_image("nginx:1.27"), "nginx:1.27");
        assert_eq!(
            normalize_image("registry.local:5000/team/app"),
            "registry.local:5000/team/app:latest"
        );
        assert_eq!(normalize_image("app@sha256:abc"), "app@sha256:abc");
    }

    #[test]
    fn test_split_image() {
        assert_eq!(split_image("nginx:1.27"), ("nginx", "1.27"));
        assert_eq!(
            split_image("registry.local:5000/app:v1"),
            ("registry.local:5000/app", "v1")
        );
        assert_eq!(split_image("registry.local:5000/app"), ("registry.local:5000/app", "latest"));
        assert_eq!(split_image("app@sha256:abc"), ("app", "sha256:abc"));
    }
}
