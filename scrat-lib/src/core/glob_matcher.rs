use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::shared::relpath::RelPath;

/// Builds include/exclude matchers from a set of glob patterns (§4.4, §6.2).
pub struct GlobMatcher {
    patterns: Vec<String>,
    globset: GlobSet,
}

impl GlobMatcher {
    pub fn new(patterns: &[String]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();

        for pattern in patterns {
            let glob = GlobBuilder::new(pattern).literal_separator(true).build()?;
            builder.add(glob);
        }

        let globset = builder.build()?;

        Ok(GlobMatcher {
            patterns: patterns.to_vec(),
            globset,
        })
    }

    pub fn include_matcher(&self) -> IncludeMatcher {
        IncludeMatcher {
            patterns: self.patterns.clone(),
            globset: self.globset.clone(),
        }
    }

    pub fn exclude_matcher(&self) -> ExcludeMatcher {
        ExcludeMatcher {
            globset: self.globset.clone(),
        }
    }
}

/// Matches a path against include patterns. A directory is "included" if
/// it is itself matched, or if it is a predecessor of a pattern (so the
/// walk descends into it looking for matches below).
pub struct IncludeMatcher {
    patterns: Vec<String>,
    globset: GlobSet,
}

impl IncludeMatcher {
    pub fn is_match(&self, path: &RelPath) -> bool {
        if self.globset.is_match(path.as_str()) {
            true
        } else {
            let nfc = path.to_nfc();
            self.patterns.iter().any(|pattern| pattern.starts_with(&nfc))
        }
    }
}

/// Matches a path against exclude patterns (§6.2's OS built-ins plus
/// per-source `exclude_patterns`).
pub struct ExcludeMatcher {
    globset: GlobSet,
}

impl ExcludeMatcher {
    pub fn is_match(&self, path: &RelPath) -> bool {
        self.globset.is_match(path.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_matcher_matches_glob_and_dir_prefix() {
        let matcher = GlobMatcher::new(&["*.tmp".to_string(), "node_modules/".to_string()])
            .unwrap()
            .exclude_matcher();

        assert!(matcher.is_match(&RelPath::from_normalized("a/b.tmp")));
        assert!(!matcher.is_match(&RelPath::from_normalized("a/b.txt")));
    }

    #[test]
    fn include_matcher_matches_predecessor_directories() {
        let matcher = GlobMatcher::new(&["docs/photos/*.jpg".to_string()])
            .unwrap()
            .include_matcher();

        assert!(matcher.is_match(&RelPath::from_normalized("docs")));
        assert!(matcher.is_match(&RelPath::from_normalized("docs/photos/a.jpg")));
        assert!(!matcher.is_match(&RelPath::from_normalized("other")));
    }
}
