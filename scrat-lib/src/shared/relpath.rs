use std::fmt;
use std::path::{Component, Path, PathBuf};

use unicode_normalization::UnicodeNormalization;

/// A path relative to a source root or destination prefix, stored with
/// forward-slash separators regardless of host OS (§4.4, §8 property 9).
///
/// Construction always goes through [`RelPath::normalize`] or
/// [`RelPath::from_normalized`]; there is no way to build one that carries
/// `..` or an absolute prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelPath(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RelPathError {
    #[error("path escapes its root: {0}")]
    Escapes(String),
    #[error("path is absolute: {0}")]
    Absolute(String),
}

impl RelPath {
    /// Builds a [`RelPath`] from an OS path that is relative to some root,
    /// normalizing separators to `/` and rejecting `..`/absolute components.
    pub fn normalize(path: &Path) -> Result<Self, RelPathError> {
        let mut parts = Vec::new();

        for component in path.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(RelPathError::Escapes(path.to_string_lossy().into_owned()));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(RelPathError::Absolute(path.to_string_lossy().into_owned()));
                }
            }
        }

        Ok(RelPath(parts.join("/")))
    }

    /// Wraps an already-normalized forward-slash string without re-validating it.
    /// Used when reconstructing a [`RelPath`] from storage (manifest, metadata store).
    pub fn from_normalized(path: impl Into<String>) -> Self {
        RelPath(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rematerializes this path with OS-native separators, for writing to disk
    /// during restore (§8 property 9).
    pub fn to_os_path(&self) -> PathBuf {
        let mut buf = PathBuf::new();
        for part in self.0.split('/') {
            buf.push(part);
        }
        buf
    }

    /// NFC-normalized form, used for Unicode-aware comparisons (include/exclude
    /// matching against patterns that may use a different normalization form).
    pub fn to_nfc(&self) -> String {
        self.0.nfc().collect()
    }

    /// Lexicographic ordering key, used for stable scan order (§4.4) and for
    /// the `backup_id` tie-break (SPEC_FULL §14).
    pub fn sort_key(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RelPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_windows_style_components_to_forward_slash() {
        let path = RelPath::normalize(Path::new("a/b/c.txt")).unwrap();
        assert_eq!(path.as_str(), "a/b/c.txt");
    }

    #[test]
    fn rejects_parent_dir_escape() {
        assert!(matches!(
            RelPath::normalize(Path::new("../etc/passwd")),
            Err(RelPathError::Escapes(_))
        ));
    }

    #[test]
    fn rejects_absolute_path() {
        assert!(matches!(
            RelPath::normalize(Path::new("/etc/passwd")),
            Err(RelPathError::Absolute(_))
        ));
    }

    #[test]
    fn strips_current_dir_components() {
        let path = RelPath::normalize(Path::new("./a/./b.txt")).unwrap();
        assert_eq!(path.as_str(), "a/b.txt");
    }

    #[test]
    fn sort_order_is_lexicographic() {
        let mut paths = vec![
            RelPath::from_normalized("b.txt"),
            RelPath::from_normalized("a.txt"),
            RelPath::from_normalized("a/b.txt"),
        ];
        paths.sort();
        assert_eq!(paths[0].as_str(), "a.txt");
        assert_eq!(paths[1].as_str(), "a/b.txt");
        assert_eq!(paths[2].as_str(), "b.txt");
    }
}
