//! Common types used throughout vaultferry.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// The `(container, path)` address of an object inside a backend.
///
/// `container` is a bucket, blob container or root directory name. `path`
/// is relative to the container and always uses `/` as separator,
/// whatever the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageLocation {
    container: String,
    path: String,
}

impl StorageLocation {
    /// Create a new location.
    ///
    /// # Preconditions
    /// - `container` and `path` must be non-empty
    /// - `path` must be relative and must not contain `..` segments
    ///
    /// # Errors
    /// - Returns `InvalidArgument` when a precondition is violated
    pub fn new(container: impl Into<String>, path: impl Into<String>) -> Result<Self> {
        let container = container.into();
        let path = path.into().replace('\\', "/");

        if container.trim().is_empty() {
            return Err(Error::InvalidArgument("container cannot be empty".to_string()));
        }
        validate_relative_path(&path)?;

        Ok(Self { container, path })
    }

    /// Bucket, share or root directory.
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Container-relative path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path segment.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Directory part of the path, without a trailing separator.
    pub fn parent(&self) -> Option<&str> {
        self.path.rfind('/').map(|idx| &self.path[..idx])
    }

    /// Same container, path with `suffix` appended (e.g. `.enc`).
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self {
            container: self.container.clone(),
            path: format!("{}{}", self.path, suffix),
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.path)
    }
}

fn validate_relative_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::InvalidArgument("path cannot be empty".to_string()));
    }
    if path.starts_with('/') {
        return Err(Error::InvalidArgument(format!(
            "path must be relative to its container: {}",
            path
        )));
    }
    if path.ends_with('/') {
        return Err(Error::InvalidArgument(format!(
            "path must name a file, not a directory: {}",
            path
        )));
    }
    if path.split('/').any(|segment| segment.is_empty() || segment == "..") {
        return Err(Error::InvalidArgument(format!(
            "path contains an empty or parent segment: {}",
            path
        )));
    }
    Ok(())
}

/// Listing filter built from an optional caller-supplied prefix.
///
/// - no prefix, `""` or `"*"` match everything
/// - a prefix containing `*` or `?` is a wildcard over the whole
///   container-relative path; wildcards never match `/`
/// - anything else is a plain string prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFilter {
    kind: FilterKind,
    base_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FilterKind {
    All,
    Prefix(String),
    Pattern(String),
}

impl ListFilter {
    /// Build a filter from an optional prefix.
    pub fn new(prefix: Option<&str>) -> Self {
        let prefix = prefix
            .map(|p| p.replace('\\', "/"))
            .map(|p| p.trim_start_matches('/').to_string())
            .unwrap_or_default();

        if prefix.is_empty() || prefix == "*" {
            return Self {
                kind: FilterKind::All,
                base_dir: String::new(),
            };
        }

        let literal_end = prefix.find(['*', '?']).unwrap_or(prefix.len());
        let base_dir = match prefix[..literal_end].rfind('/') {
            Some(idx) => prefix[..idx].to_string(),
            None => String::new(),
        };

        let kind = if literal_end < prefix.len() {
            FilterKind::Pattern(prefix)
        } else {
            FilterKind::Prefix(prefix)
        };

        Self { kind, base_dir }
    }

    /// Directory (without trailing `/`) below which every match lives.
    /// Empty means the container root.
    pub fn base_dir(&self) -> &str {
        &self.base_dir
    }

    /// Whether this filter accepts every path.
    pub fn matches_all(&self) -> bool {
        self.kind == FilterKind::All
    }

    /// Test a container-relative path.
    pub fn matches(&self, path: &str) -> bool {
        match &self.kind {
            FilterKind::All => true,
            FilterKind::Prefix(prefix) => path.starts_with(prefix.as_str()),
            FilterKind::Pattern(pattern) => wildcard_match(pattern.as_bytes(), path.as_bytes()),
        }
    }
}

/// `*` matches any run of non-separator bytes, `?` exactly one.
fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len()
            && (pattern[p] == text[t] || (pattern[p] == b'?' && text[t] != b'/'))
        {
            p += 1;
            t += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            // A star cannot swallow a separator.
            if text[star_t] == b'/' {
                return false;
            }
            p = star_p + 1;
            t = star_t + 1;
            backtrack = Some((star_p, t));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_location_creation() {
        let loc = StorageLocation::new("pgp", "Keys/publicKey.asc").unwrap();
        assert_eq!(loc.container(), "pgp");
        assert_eq!(loc.path(), "Keys/publicKey.asc");
        assert_eq!(loc.file_name(), "publicKey.asc");
        assert_eq!(loc.parent(), Some("Keys"));
        assert_eq!(loc.to_string(), "pgp/Keys/publicKey.asc");
    }

    #[test]
    fn test_location_rejects_bad_input() {
        assert!(StorageLocation::new("", "a.txt").is_err());
        assert!(StorageLocation::new("c", "").is_err());
        assert!(StorageLocation::new("c", "/etc/passwd").is_err());
        assert!(StorageLocation::new("c", "a/../../b").is_err());
        assert!(StorageLocation::new("c", "a//b").is_err());
        assert!(StorageLocation::new("c", "dir/").is_err());
    }

    #[test]
    fn test_location_normalises_backslashes() {
        let loc = StorageLocation::new("c", r"Content\file.pgp").unwrap();
        assert_eq!(loc.path(), "Content/file.pgp");
    }

    #[test]
    fn test_location_suffix() {
        let loc = StorageLocation::new("c", "input.txt").unwrap();
        let enc = loc.with_suffix(".enc");
        assert_eq!(enc.path(), "input.txt.enc");
        assert_eq!(enc.container(), loc.container());
    }

    #[test]
    fn test_filter_missing_prefix_matches_all() {
        for filter in [ListFilter::new(None), ListFilter::new(Some("")), ListFilter::new(Some("*"))] {
            assert!(filter.matches_all());
            assert!(filter.matches("a/x"));
            assert!(filter.matches("top.txt"));
            assert_eq!(filter.base_dir(), "");
        }
    }

    #[test]
    fn test_filter_plain_prefix() {
        let filter = ListFilter::new(Some("a/"));
        assert_eq!(filter.base_dir(), "a");
        assert!(filter.matches("a/x"));
        assert!(filter.matches("a/deeper/y"));
        assert!(!filter.matches("b/z"));
        assert!(!filter.matches("ab"));

        let filter = ListFilter::new(Some("Content/enc"));
        assert_eq!(filter.base_dir(), "Content");
        assert!(filter.matches("Content/encryptedContent.pgp"));
        assert!(!filter.matches("Content/plain.txt"));
    }

    #[test]
    fn test_filter_wildcards() {
        let filter = ListFilter::new(Some("*.txt"));
        assert_eq!(filter.base_dir(), "");
        assert!(filter.matches("input.txt"));
        assert!(!filter.matches("nested/input.txt"));
        assert!(!filter.matches("input.txt.enc"));

        let filter = ListFilter::new(Some("Keys/*Key.as?"));
        assert_eq!(filter.base_dir(), "Keys");
        assert!(filter.matches("Keys/publicKey.asc"));
        assert!(filter.matches("Keys/privateKey.asc"));
        assert!(!filter.matches("Keys/sub/publicKey.asc"));
    }

    proptest! {
        #[test]
        fn prop_literal_pattern_matches_itself(name in "[a-z0-9._-]{1,24}") {
            prop_assert!(wildcard_match(name.as_bytes(), name.as_bytes()));
        }

        #[test]
        fn prop_star_suffix_matches_any_file_name(stem in "[a-z]{1,8}", rest in "[a-z0-9.]{0,16}") {
            let pattern = format!("{}*", stem);
            let name = format!("{}{}", stem, rest);
            prop_assert!(wildcard_match(pattern.as_bytes(), name.as_bytes()));
            let nested = format!("{}/{}", name, rest);
            prop_assert!(!wildcard_match(pattern.as_bytes(), nested.as_bytes()));
        }
    }
}
