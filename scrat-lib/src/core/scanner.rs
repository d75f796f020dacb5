use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use thiserror::Error;

use crate::core::glob_matcher::{ExcludeMatcher, GlobMatcher};
use crate::core::metadata_store::{FileFlag, MetadataStore};
use crate::shared::config::Source;
use crate::shared::relpath::RelPath;

#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid exclude pattern: {0}")]
    Glob(#[from] globset::Error),
}

/// What kind of filesystem entry a [`FileRecord`] describes. Regular files
/// and symlinks both travel through the archiver; symlinks carry their
/// target text as content (§4.4 boundary behaviors list symlinks
/// explicitly).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Symlink,
}

/// One scanned filesystem entry, produced in stable lexicographic order
/// (§4.4).
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub source_root: String,
    pub relative_path: RelPath,
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
    pub kind: EntryKind,
}

/// A path the base backup had as `present` but that no longer exists under
/// the source root (§3 `BackupFile.flag`).
#[derive(Debug, Clone)]
pub struct DeletedRecord {
    pub source_root: String,
    pub relative_path: RelPath,
}

#[derive(Debug, Clone)]
pub enum ScanEntry {
    Changed(FileRecord),
    Unchanged(FileRecord),
    Deleted(DeletedRecord),
}

/// Built-in, unconditional excludes, OS-specific per §6.2. Unioned with a
/// source's own `exclude_patterns` before matching.
pub fn built_in_excludes() -> Vec<String> {
    let mut patterns = vec![
        "*.tmp".to_string(),
        "*.cache".to_string(),
        ".git/".to_string(),
        "node_modules/".to_string(),
    ];

    if cfg!(target_os = "windows") {
        patterns.push("Thumbs.db".to_string());
        patterns.push("desktop.ini".to_string());
        patterns.push("~$*".to_string());
        patterns.push("$RECYCLE.BIN/".to_string());
    } else if cfg!(target_os = "macos") {
        patterns.push(".DS_Store".to_string());
        patterns.push(".AppleDouble/".to_string());
        patterns.push(".Spotlight-V100/".to_string());
    } else {
        patterns.push(".Trash-*/".to_string());
        patterns.push(".thumbnails/".to_string());
        patterns.push("*.~lock.*".to_string());
        patterns.push(".directory".to_string());
    }

    patterns
}

/// Filesystem mtime resolution used for "changed by more than resolution"
/// comparisons (§4.4). One second covers FAT/ext3-class filesystems; finer
/// filesystems simply never trigger a false negative.
const MTIME_RESOLUTION_SECS: i64 = 1;

/// Walks one source root, applying built-in + per-source excludes, and
/// diffs the result against a base backup's `BackupFile` rows when one is
/// supplied (§4.4). Entries are returned in stable lexicographic order of
/// `relative_path`.
pub fn scan_source(
    store: Option<&MetadataStore>,
    base_backup_id: Option<&str>,
    source: &Source,
) -> Result<Vec<ScanEntry>, ScannerError> {
    let mut patterns = built_in_excludes();
    patterns.extend(source.exclude_patterns.iter().cloned());
    let exclude_matcher = GlobMatcher::new(&patterns)?.exclude_matcher();

    let root = Path::new(&source.root_path);
    let mut records = walk(root, &exclude_matcher)?;
    records.sort_by(|a, b| a.relative_path.sort_key().cmp(&b.relative_path.sort_key()));

    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut entries = Vec::with_capacity(records.len());

    for mut record in records {
        record.source_root = source.name.clone();
        seen.insert(record.relative_path.as_str().to_string());

        let changed = match (store, base_backup_id) {
            (Some(store), Some(base_id)) => {
                match store.prior_state(base_id, &source.name, &record.relative_path)? {
                    None => true,
                    Some(prior) => {
                        prior.flag == FileFlag::Deleted
                            || prior.size != record.size
                            || (prior.mtime - record.mtime).abs() > MTIME_RESOLUTION_SECS
                    }
                }
            }
            _ => true,
        };

        entries.push(if changed {
            ScanEntry::Changed(record)
        } else {
            ScanEntry::Unchanged(record)
        });
    }

    if let (Some(store), Some(base_id)) = (store, base_backup_id) {
        for file in store.files_for_backup(base_id)? {
            if file.source_root != source.name || file.flag == FileFlag::Deleted {
                continue;
            }
            if !seen.contains(file.relative_path.as_str()) {
                entries.push(ScanEntry::Deleted(DeletedRecord {
                    source_root: source.name.clone(),
                    relative_path: file.relative_path,
                }));
            }
        }
    }

    Ok(entries)
}

fn walk(root: &Path, exclude_matcher: &ExcludeMatcher) -> Result<Vec<FileRecord>, ScannerError> {
    let mut out = Vec::new();
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    queue.push_back(root.to_path_buf());

    while let Some(dir) = queue.pop_front() {
        let entries = fs::read_dir(&dir).map_err(|source| ScannerError::Io {
            path: dir.clone(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| ScannerError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();

            let relative = match pathdiff(&path, root) {
                Some(rel) => RelPath::normalize(&rel),
                None => continue,
            };
            let Ok(relative) = relative else { continue };

            if exclude_matcher.is_match(&relative) {
                continue;
            }

            let metadata = fs::symlink_metadata(&path).map_err(|source| ScannerError::Io {
                path: path.clone(),
                source,
            })?;
            let file_type = metadata.file_type();

            if file_type.is_dir() {
                queue.push_back(path);
            } else if file_type.is_symlink() {
                let target = fs::read_link(&path).map_err(|source| ScannerError::Io {
                    path: path.clone(),
                    source,
                })?;
                let target_bytes = target.to_string_lossy().as_bytes().len() as u64;
                out.push(FileRecord {
                    source_root: String::new(),
                    relative_path: relative,
                    size: target_bytes,
                    mtime: mtime_of(&metadata),
                    mode: mode_of(&metadata),
                    kind: EntryKind::Symlink,
                });
            } else if file_type.is_file() {
                out.push(FileRecord {
                    source_root: String::new(),
                    relative_path: relative,
                    size: metadata.len(),
                    mtime: mtime_of(&metadata),
                    mode: mode_of(&metadata),
                    kind: EntryKind::File,
                });
            }
        }
    }

    Ok(out)
}

fn mtime_of(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(_metadata: &fs::Metadata) -> u32 {
    0o644
}

fn pathdiff(path: &Path, root: &Path) -> Option<PathBuf> {
    path.strip_prefix(root).ok().map(|p| p.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn write_file(path: &Path, content: &[u8]) {
        let mut file = File::create(path).unwrap();
        file.write_all(content).unwrap();
    }

    #[test]
    fn scans_files_in_lexicographic_order_and_applies_built_in_excludes() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("b.txt"), b"b");
        write_file(&dir.path().join("a.txt"), b"a");
        write_file(&dir.path().join("note.tmp"), b"ignored");

        let source = Source {
            name: "docs".to_string(),
            root_path: dir.path().to_string_lossy().to_string(),
            enabled: true,
            exclude_patterns: vec![],
        };

        let entries = scan_source(None, None, &source).unwrap();
        let names: Vec<String> = entries
            .iter()
            .map(|e| match e {
                ScanEntry::Changed(r) => r.relative_path.as_str().to_string(),
                _ => unreachable!(),
            })
            .collect();

        assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[test]
    fn without_a_base_every_file_is_changed() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("a.txt"), b"hello");

        let source = Source {
            name: "docs".to_string(),
            root_path: dir.path().to_string_lossy().to_string(),
            enabled: true,
            exclude_patterns: vec![],
        };

        let entries = scan_source(None, None, &source).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0], ScanEntry::Changed(_)));
    }

    #[test]
    fn with_a_base_unchanged_files_are_reported_unchanged_and_missing_files_deleted() {
        use crate::core::metadata_store::{BackupFileRow, BackupKind, BackupRow, BackupStatus};
        use crate::shared::config::Compression;
        use chrono::Utc;

        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("a.txt"), b"hello");
        let metadata = fs::metadata(dir.path().join("a.txt")).unwrap();

        let mut store = MetadataStore::open_in_memory().unwrap();
        store
            .create_backup(&BackupRow {
                backup_id: "BASE".to_string(),
                started_at: Utc::now(),
                finished_at: Some(Utc::now()),
                kind: BackupKind::Full,
                base_backup_id: None,
                destination_ref: "dest".to_string(),
                status: BackupStatus::Completed,
                files_total: 1,
                size_original: 5,
                size_stored: 5,
                passphrase_verifier: "x".to_string(),
                compression: Compression::None,
            })
            .unwrap();
        store
            .commit_segment_files(&[BackupFileRow {
                backup_id: "BASE".to_string(),
                source_root: "docs".to_string(),
                relative_path: RelPath::from_normalized("a.txt"),
                logical_size: metadata.len(),
                mtime: mtime_of(&metadata),
                archive_name: Some("data.001.scrat".to_string()),
                segment_offset: Some(0),
                segment_length: Some(5),
                flag: FileFlag::Present,
            }])
            .unwrap();

        let source = Source {
            name: "docs".to_string(),
            root_path: dir.path().to_string_lossy().to_string(),
            enabled: true,
            exclude_patterns: vec![],
        };

        let entries = scan_source(Some(&store), Some("BASE"), &source).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0], ScanEntry::Unchanged(_)));

        std::fs::remove_file(dir.path().join("a.txt")).unwrap();
        let entries = scan_source(Some(&store), Some("BASE"), &source).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0], ScanEntry::Deleted(_)));
    }
}
