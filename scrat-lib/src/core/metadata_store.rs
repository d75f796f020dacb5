use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::shared::config::Compression;
use crate::shared::relpath::RelPath;

/// Errors raised by the metadata store (§4.5, §7 `InternalError` class —
/// a corrupted or unreachable local catalog is a bug/environment issue,
/// never something the engine retries).
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("no such backup: {0}")]
    NoSuchBackup(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    fn as_str(self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "incremental" => BackupKind::Incremental,
            _ => BackupKind::Full,
        }
    }
}

fn compression_as_str(compression: Compression) -> &'static str {
    match compression {
        Compression::None => "none",
        Compression::Fast => "fast",
        Compression::Balanced => "balanced",
        Compression::Best => "best",
    }
}

fn parse_compression(value: &str) -> Compression {
    match value {
        "fast" => Compression::Fast,
        "balanced" => Compression::Balanced,
        "best" => Compression::Best,
        _ => Compression::None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    Running,
    Completed,
    Failed,
    Partial,
}

impl BackupStatus {
    fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Running => "running",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
            BackupStatus::Partial => "partial",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "completed" => BackupStatus::Completed,
            "failed" => BackupStatus::Failed,
            "partial" => BackupStatus::Partial,
            _ => BackupStatus::Running,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFlag {
    Present,
    Deleted,
}

impl FileFlag {
    fn as_str(self) -> &'static str {
        match self {
            FileFlag::Present => "present",
            FileFlag::Deleted => "deleted",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "deleted" => FileFlag::Deleted,
            _ => FileFlag::Present,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStatus {
    Writing,
    Sealed,
}

impl ArchiveStatus {
    fn as_str(self) -> &'static str {
        match self {
            ArchiveStatus::Writing => "writing",
            ArchiveStatus::Sealed => "sealed",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "sealed" => ArchiveStatus::Sealed,
            _ => ArchiveStatus::Writing,
        }
    }
}

/// A `Backup` row (§3).
#[derive(Debug, Clone)]
pub struct BackupRow {
    pub backup_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub kind: BackupKind,
    pub base_backup_id: Option<String>,
    pub destination_ref: String,
    pub status: BackupStatus,
    pub files_total: u64,
    pub size_original: u64,
    pub size_stored: u64,
    pub passphrase_verifier: String,
    /// The compression mode this backup's archives were written with
    /// (§4.2/§4.3) — restore needs this per-backup, since a chain's
    /// incrementals can each have been taken under a different policy.
    pub compression: Compression,
}

/// A `BackupFile` row (§3). Never mutated once written.
#[derive(Debug, Clone)]
pub struct BackupFileRow {
    pub backup_id: String,
    pub source_root: String,
    pub relative_path: RelPath,
    pub logical_size: u64,
    pub mtime: i64,
    pub archive_name: Option<String>,
    pub segment_offset: Option<u64>,
    pub segment_length: Option<u64>,
    pub flag: FileFlag,
}

/// An `Archive` row (§3).
#[derive(Debug, Clone)]
pub struct ArchiveRow {
    pub backup_id: String,
    pub ordinal: u32,
    pub name: String,
    pub iv_seed: String,
    pub logical_size: u64,
    pub stored_size: u64,
    pub status: ArchiveStatus,
}

/// One prior state lookup result used by the scanner's change detection
/// (§4.4): only `size`/`mtime`/`flag` matter, never content hashes.
#[derive(Debug, Clone, Copy)]
pub struct PriorFileState {
    pub size: u64,
    pub mtime: i64,
    pub flag: FileFlag,
}

/// A restorable point, as surfaced by `list_restorable_points` (§4.7).
#[derive(Debug, Clone)]
pub struct RestorablePoint {
    pub backup_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: BackupKind,
}

/// One row of the bounded backup log (§4.5, §12): narration recorded
/// alongside a run, independent of the message bus which only lives for
/// the process's lifetime.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub backup_id: Option<String>,
    pub ts: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// The authoritative local catalog of backups/files/archives (§4.5): one
/// `rusqlite` file on disk, with the three required indexes and
/// per-segment transactional commits.
pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    pub fn open(path: &Path) -> Result<Self, MetadataError> {
        let conn = Connection::open(path)?;
        Self::migrate(&conn)?;
        Ok(MetadataStore { conn })
    }

    pub fn open_in_memory() -> Result<Self, MetadataError> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(MetadataStore { conn })
    }

    fn migrate(conn: &Connection) -> Result<(), MetadataError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS backups (
                backup_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                kind TEXT NOT NULL,
                base_backup_id TEXT,
                destination_ref TEXT NOT NULL,
                status TEXT NOT NULL,
                files_total INTEGER NOT NULL DEFAULT 0,
                size_original INTEGER NOT NULL DEFAULT 0,
                size_stored INTEGER NOT NULL DEFAULT 0,
                passphrase_verifier TEXT NOT NULL DEFAULT '',
                compression TEXT NOT NULL DEFAULT 'none'
            );
            CREATE INDEX IF NOT EXISTS idx_backups_timestamp ON backups(started_at);

            CREATE TABLE IF NOT EXISTS backup_files (
                backup_id TEXT NOT NULL,
                source_root TEXT NOT NULL,
                relative_path TEXT NOT NULL,
                logical_size INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                archive_name TEXT,
                segment_offset INTEGER,
                segment_length INTEGER,
                flag TEXT NOT NULL,
                PRIMARY KEY (backup_id, source_root, relative_path)
            );
            CREATE INDEX IF NOT EXISTS idx_backup_files_backup ON backup_files(backup_id);
            CREATE INDEX IF NOT EXISTS idx_backup_files_src_rel
                ON backup_files(source_root, relative_path);

            CREATE TABLE IF NOT EXISTS archives (
                backup_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                name TEXT NOT NULL,
                iv_seed TEXT NOT NULL,
                logical_size INTEGER NOT NULL,
                stored_size INTEGER NOT NULL,
                status TEXT NOT NULL,
                PRIMARY KEY (backup_id, ordinal)
            );

            CREATE TABLE IF NOT EXISTS sources (
                name TEXT PRIMARY KEY,
                config_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS destinations (
                id TEXT PRIMARY KEY,
                config_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                config_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS log_ring (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backup_id TEXT,
                ts TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Creates a new `Backup` row in `running` status (§4.6 step 2).
    pub fn create_backup(&self, row: &BackupRow) -> Result<(), MetadataError> {
        self.conn.execute(
            "INSERT INTO backups
                (backup_id, started_at, finished_at, kind, base_backup_id,
                 destination_ref, status, files_total, size_original, size_stored,
                 passphrase_verifier, compression)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                row.backup_id,
                row.started_at.to_rfc3339(),
                row.finished_at.map(|t| t.to_rfc3339()),
                row.kind.as_str(),
                row.base_backup_id,
                row.destination_ref,
                row.status.as_str(),
                row.files_total as i64,
                row.size_original as i64,
                row.size_stored as i64,
                row.passphrase_verifier,
                compression_as_str(row.compression),
            ],
        )?;
        Ok(())
    }

    /// Updates status/finished_at/stats for a backup (used on clean end,
    /// cancel, and fatal-error cleanup — §4.6's state machine).
    pub fn update_backup_status(
        &self,
        backup_id: &str,
        status: BackupStatus,
        finished_at: Option<DateTime<Utc>>,
        files_total: u64,
        size_original: u64,
        size_stored: u64,
    ) -> Result<(), MetadataError> {
        self.conn.execute(
            "UPDATE backups SET status = ?1, finished_at = ?2, files_total = ?3,
                size_original = ?4, size_stored = ?5 WHERE backup_id = ?6",
            params![
                status.as_str(),
                finished_at.map(|t| t.to_rfc3339()),
                files_total as i64,
                size_original as i64,
                size_stored as i64,
                backup_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRow>, MetadataError> {
        let row = self
            .conn
            .query_row(
                "SELECT backup_id, started_at, finished_at, kind, base_backup_id,
                        destination_ref, status, files_total, size_original, size_stored,
                        passphrase_verifier, compression
                 FROM backups WHERE backup_id = ?1",
                params![backup_id],
                Self::map_backup_row,
            )
            .optional()?;
        Ok(row)
    }

    /// The newest `completed` backup for a destination, used to resolve
    /// `kind = auto` (§4.6 step 1).
    pub fn newest_completed_backup(
        &self,
        destination_ref: &str,
    ) -> Result<Option<BackupRow>, MetadataError> {
        let row = self
            .conn
            .query_row(
                "SELECT backup_id, started_at, finished_at, kind, base_backup_id,
                        destination_ref, status, files_total, size_original, size_stored,
                        passphrase_verifier, compression
                 FROM backups
                 WHERE destination_ref = ?1 AND status = 'completed'
                 ORDER BY backup_id DESC LIMIT 1",
                params![destination_ref],
                Self::map_backup_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All completed backups for a destination, oldest first — the basis
    /// for `list_restorable_points` (§4.7) and rotation (§4.6).
    pub fn completed_backups(
        &self,
        destination_ref: &str,
    ) -> Result<Vec<BackupRow>, MetadataError> {
        let mut stmt = self.conn.prepare(
            "SELECT backup_id, started_at, finished_at, kind, base_backup_id,
                    destination_ref, status, files_total, size_original, size_stored,
                    passphrase_verifier, compression
             FROM backups
             WHERE destination_ref = ?1 AND status = 'completed'
             ORDER BY backup_id ASC",
        )?;
        let rows = stmt
            .query_map(params![destination_ref], Self::map_backup_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_backup_row(row: &rusqlite::Row) -> rusqlite::Result<BackupRow> {
        let finished_at: Option<String> = row.get(2)?;
        Ok(BackupRow {
            backup_id: row.get(0)?,
            started_at: parse_rfc3339(&row.get::<_, String>(1)?),
            finished_at: finished_at.map(|s| parse_rfc3339(&s)),
            kind: BackupKind::parse(&row.get::<_, String>(3)?),
            base_backup_id: row.get(4)?,
            destination_ref: row.get(5)?,
            status: BackupStatus::parse(&row.get::<_, String>(6)?),
            files_total: row.get::<_, i64>(7)? as u64,
            size_original: row.get::<_, i64>(8)? as u64,
            size_stored: row.get::<_, i64>(9)? as u64,
            passphrase_verifier: row.get(10)?,
            compression: parse_compression(&row.get::<_, String>(11)?),
        })
    }

    /// Commits one segment's worth of `BackupFile` rows transactionally
    /// (§4.5: "the row set for a segment's files is committed before the
    /// next segment begins").
    pub fn commit_segment_files(
        &mut self,
        files: &[BackupFileRow],
    ) -> Result<(), MetadataError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO backup_files
                    (backup_id, source_root, relative_path, logical_size, mtime,
                     archive_name, segment_offset, segment_length, flag)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for file in files {
                stmt.execute(params![
                    file.backup_id,
                    file.source_root,
                    file.relative_path.as_str(),
                    file.logical_size as i64,
                    file.mtime,
                    file.archive_name,
                    file.segment_offset.map(|v| v as i64),
                    file.segment_length.map(|v| v as i64),
                    file.flag.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn files_for_backup(&self, backup_id: &str) -> Result<Vec<BackupFileRow>, MetadataError> {
        let mut stmt = self.conn.prepare(
            "SELECT backup_id, source_root, relative_path, logical_size, mtime,
                    archive_name, segment_offset, segment_length, flag
             FROM backup_files WHERE backup_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![backup_id], Self::map_file_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Looks up the prior state of one `(source_root, relative_path)`
    /// within a specific base backup, for the scanner's change detection
    /// (§4.4).
    pub fn prior_state(
        &self,
        base_backup_id: &str,
        source_root: &str,
        relative_path: &RelPath,
    ) -> Result<Option<PriorFileState>, MetadataError> {
        let row = self
            .conn
            .query_row(
                "SELECT logical_size, mtime, flag FROM backup_files
                 WHERE backup_id = ?1 AND source_root = ?2 AND relative_path = ?3",
                params![base_backup_id, source_root, relative_path.as_str()],
                |row| {
                    Ok(PriorFileState {
                        size: row.get::<_, i64>(0)? as u64,
                        mtime: row.get(1)?,
                        flag: FileFlag::parse(&row.get::<_, String>(2)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn map_file_row(row: &rusqlite::Row) -> rusqlite::Result<BackupFileRow> {
        Ok(BackupFileRow {
            backup_id: row.get(0)?,
            source_root: row.get(1)?,
            relative_path: RelPath::from_normalized(row.get::<_, String>(2)?),
            logical_size: row.get::<_, i64>(3)? as u64,
            mtime: row.get(4)?,
            archive_name: row.get(5)?,
            segment_offset: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
            segment_length: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
            flag: FileFlag::parse(&row.get::<_, String>(8)?),
        })
    }

    pub fn insert_archive(&self, row: &ArchiveRow) -> Result<(), MetadataError> {
        self.conn.execute(
            "INSERT INTO archives
                (backup_id, ordinal, name, iv_seed, logical_size, stored_size, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.backup_id,
                row.ordinal,
                row.name,
                row.iv_seed,
                row.logical_size as i64,
                row.stored_size as i64,
                row.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn seal_archive(&self, backup_id: &str, ordinal: u32) -> Result<(), MetadataError> {
        self.conn.execute(
            "UPDATE archives SET status = 'sealed' WHERE backup_id = ?1 AND ordinal = ?2",
            params![backup_id, ordinal],
        )?;
        Ok(())
    }

    pub fn archives_for_backup(&self, backup_id: &str) -> Result<Vec<ArchiveRow>, MetadataError> {
        let mut stmt = self.conn.prepare(
            "SELECT backup_id, ordinal, name, iv_seed, logical_size, stored_size, status
             FROM archives WHERE backup_id = ?1 ORDER BY ordinal ASC",
        )?;
        let rows = stmt
            .query_map(params![backup_id], |row| {
                Ok(ArchiveRow {
                    backup_id: row.get(0)?,
                    ordinal: row.get::<_, i64>(1)? as u32,
                    name: row.get(2)?,
                    iv_seed: row.get(3)?,
                    logical_size: row.get::<_, i64>(4)? as u64,
                    stored_size: row.get::<_, i64>(5)? as u64,
                    status: ArchiveStatus::parse(&row.get::<_, String>(6)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deletes a completed (or failed/partial) backup's rows entirely —
    /// used by rotation (§4.6) and by orphan-segment cleanup of a
    /// resumed `partial` run (§7).
    pub fn delete_backup(&mut self, backup_id: &str) -> Result<(), MetadataError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM backup_files WHERE backup_id = ?1",
            params![backup_id],
        )?;
        tx.execute(
            "DELETE FROM archives WHERE backup_id = ?1",
            params![backup_id],
        )?;
        tx.execute("DELETE FROM backups WHERE backup_id = ?1", params![backup_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Backups whose `base_backup_id` is `backup_id`, directly or
    /// transitively — used by rotation's "never delete a backup another
    /// surviving backup depends on" invariant (§3, §4.6).
    pub fn direct_children(&self, backup_id: &str) -> Result<Vec<String>, MetadataError> {
        let mut stmt = self
            .conn
            .prepare("SELECT backup_id FROM backups WHERE base_backup_id = ?1")?;
        let rows = stmt
            .query_map(params![backup_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn append_log(
        &self,
        backup_id: Option<&str>,
        level: &str,
        message: &str,
    ) -> Result<(), MetadataError> {
        self.conn.execute(
            "INSERT INTO log_ring (backup_id, ts, level, message) VALUES (?1, ?2, ?3, ?4)",
            params![backup_id, Utc::now().to_rfc3339(), level, message],
        )?;
        // Bound the ring: keep only the most recent LOG_RING_SIZE rows.
        self.conn.execute(
            "DELETE FROM log_ring WHERE id NOT IN
                (SELECT id FROM log_ring ORDER BY id DESC LIMIT ?1)",
            params![LOG_RING_SIZE],
        )?;
        Ok(())
    }

    /// Returns the `limit` most recent log rows, newest first. `backup_id`
    /// narrows to one run's entries; `None` returns entries across all runs.
    pub fn recent_logs(&self, backup_id: Option<&str>, limit: u32) -> Result<Vec<LogEntry>, MetadataError> {
        let mut stmt = match backup_id {
            Some(_) => self.conn.prepare(
                "SELECT backup_id, ts, level, message FROM log_ring
                 WHERE backup_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?,
            None => self.conn.prepare(
                "SELECT backup_id, ts, level, message FROM log_ring ORDER BY id DESC LIMIT ?1",
            )?,
        };

        let map_row = |row: &rusqlite::Row| -> rusqlite::Result<LogEntry> {
            let ts: String = row.get(1)?;
            Ok(LogEntry {
                backup_id: row.get(0)?,
                ts: parse_rfc3339(&ts),
                level: row.get(2)?,
                message: row.get(3)?,
            })
        };

        let rows = match backup_id {
            Some(id) => stmt.query_map(params![id, limit], map_row)?,
            None => stmt.query_map(params![limit], map_row)?,
        };

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

/// Ring size for the log buffer (§4.5, §12): ambient, not user-tunable.
const LOG_RING_SIZE: i64 = 2000;

fn parse_rfc3339(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_backup(id: &str, status: BackupStatus, base: Option<&str>) -> BackupRow {
        BackupRow {
            backup_id: id.to_string(),
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            kind: if base.is_some() {
                BackupKind::Incremental
            } else {
                BackupKind::Full
            },
            base_backup_id: base.map(|s| s.to_string()),
            destination_ref: "dest1".to_string(),
            status,
            files_total: 2,
            size_original: 100,
            size_stored: 80,
            passphrase_verifier: "deadbeef".to_string(),
            compression: Compression::Fast,
        }
    }

    #[test]
    fn creates_and_fetches_a_backup() {
        let store = MetadataStore::open_in_memory().unwrap();
        store
            .create_backup(&sample_backup("20260101_000000_full", BackupStatus::Completed, None))
            .unwrap();

        let fetched = store.get_backup("20260101_000000_full").unwrap().unwrap();
        assert_eq!(fetched.status, BackupStatus::Completed);
    }

    #[test]
    fn newest_completed_backup_picks_lexicographically_last() {
        let store = MetadataStore::open_in_memory().unwrap();
        store
            .create_backup(&sample_backup("20260101_000000_full", BackupStatus::Completed, None))
            .unwrap();
        store
            .create_backup(&sample_backup(
                "20260102_000000_incr",
                BackupStatus::Completed,
                Some("20260101_000000_full"),
            ))
            .unwrap();

        let newest = store.newest_completed_backup("dest1").unwrap().unwrap();
        assert_eq!(newest.backup_id, "20260102_000000_incr");
    }

    #[test]
    fn commit_segment_files_is_queryable_and_prior_state_reflects_flag() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        store
            .create_backup(&sample_backup("20260101_000000_full", BackupStatus::Completed, None))
            .unwrap();

        store
            .commit_segment_files(&[BackupFileRow {
                backup_id: "20260101_000000_full".to_string(),
                source_root: "docs".to_string(),
                relative_path: RelPath::from_normalized("a.txt"),
                logical_size: 5,
                mtime: 1000,
                archive_name: Some("data.001.scrat".to_string()),
                segment_offset: Some(0),
                segment_length: Some(5),
                flag: FileFlag::Present,
            }])
            .unwrap();

        let files = store.files_for_backup("20260101_000000_full").unwrap();
        assert_eq!(files.len(), 1);

        let prior = store
            .prior_state(
                "20260101_000000_full",
                "docs",
                &RelPath::from_normalized("a.txt"),
            )
            .unwrap()
            .unwrap();
        assert_eq!(prior.size, 5);
        assert_eq!(prior.flag, FileFlag::Present);
    }

    #[test]
    fn delete_backup_removes_files_and_archives() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        store
            .create_backup(&sample_backup("20260101_000000_full", BackupStatus::Completed, None))
            .unwrap();
        store
            .insert_archive(&ArchiveRow {
                backup_id: "20260101_000000_full".to_string(),
                ordinal: 1,
                name: "data.001.scrat".to_string(),
                iv_seed: "abc123".to_string(),
                logical_size: 10,
                stored_size: 10,
                status: ArchiveStatus::Sealed,
            })
            .unwrap();

        store.delete_backup("20260101_000000_full").unwrap();

        assert!(store.get_backup("20260101_000000_full").unwrap().is_none());
        assert!(store.archives_for_backup("20260101_000000_full").unwrap().is_empty());
    }

    #[test]
    fn direct_children_finds_dependent_incrementals() {
        let store = MetadataStore::open_in_memory().unwrap();
        store
            .create_backup(&sample_backup("F1", BackupStatus::Completed, None))
            .unwrap();
        store
            .create_backup(&sample_backup("I1a", BackupStatus::Completed, Some("F1")))
            .unwrap();

        let children = store.direct_children("F1").unwrap();
        assert_eq!(children, vec!["I1a".to_string()]);
    }

    #[test]
    fn recent_logs_filters_by_backup_and_bounds_count() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.append_log(Some("F1"), "info", "started").unwrap();
        store.append_log(Some("F1"), "info", "finished").unwrap();
        store.append_log(Some("F2"), "warn", "retrying").unwrap();

        let all = store.recent_logs(None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].message, "retrying");

        let f1_only = store.recent_logs(Some("F1"), 10).unwrap();
        assert_eq!(f1_only.len(), 2);
        assert_eq!(f1_only[0].message, "finished");

        let bounded = store.recent_logs(None, 1).unwrap();
        assert_eq!(bounded.len(), 1);
    }
}
