use ferrite_support::error::{Error, Result};

/// A path must start with `/`; interior segments (between slashes) must be
/// non-empty.
pub fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidPath);
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(Error::InvalidPath);
    }
    if path[1..].split('/').any(|segment| segment.is_empty()) {
        return Err(Error::InvalidPath);
    }
    Ok(())
}

/// A name is one path segment: non-empty, and must not contain `/`.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(Error::InvalidName);
    }
    Ok(())
}

/// Joins a parent path and a child name into a child path, handling the
/// root path's trailing-slash special case.
pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_valid() {
        assert!(validate_path("/").is_ok());
    }

    #[test]
    fn rejects_missing_leading_slash() {
        assert!(matches!(validate_path("a/b"), Err(Error::InvalidPath)));
    }

    #[test]
    fn rejects_empty_interior_segment() {
        assert!(matches!(validate_path("/a//b"), Err(Error::InvalidPath)));
    }

    #[test]
    fn rejects_trailing_slash() {
        assert!(matches!(validate_path("/a/"), Err(Error::InvalidPath)));
    }

    #[test]
    fn rejects_name_with_slash() {
        assert!(matches!(validate_name("a/b"), Err(Error::InvalidName)));
    }

    #[test]
    fn rejects_empty_name() {
        assert!(matches!(validate_name(""), Err(Error::InvalidName)));
    }

    #[test]
    fn join_handles_root() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }
}
