use std::collections::VecDeque;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::Sender;
use rand::Rng;
use secrecy::SecretString;

use crate::core::archiver::{ArchiveFileMeta, ArchiveWriter, FilePlacement};
use crate::core::compressor::CompressingReader;
use crate::core::cryptor::{derive_key, derive_verifier, hex_decode, hex_encode, random_salt, verify_passphrase};
use crate::core::destination::{Destination, DestinationError};
use crate::core::manifest::{
    Manifest, ManifestArchive, ManifestSource, ManifestStats, encrypt_manifest, MANIFEST_FORMAT_VERSION,
};
use crate::core::metadata_store::{
    ArchiveRow, ArchiveStatus, BackupFileRow, BackupKind, BackupRow, BackupStatus, FileFlag, MetadataStore,
};
use crate::core::rotation;
use crate::core::run_state::RunState;
use crate::core::scanner::{self, EntryKind, ScanEntry};
use crate::core::verifier;
use crate::send_error;
use crate::send_info;
use crate::send_warn;
use crate::shared::config::{BackupPolicy, Compression, Source};
use crate::shared::events::{BackupStats, Event, EventMessage, ProgressThrottle};
use crate::shared::message::Message;
use crate::shared::relpath::RelPath;
use crate::ScratError;

/// Which kind of backup to run, before `auto` is resolved against the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKindRequest {
    Full,
    Incremental,
    Auto,
}

/// Everything [`run_backup`] needs for one run (§4.6).
pub struct BackupRequest {
    pub sources: Vec<Source>,
    pub destination_ref: String,
    pub kind: BackupKindRequest,
    pub passphrase: SecretString,
    pub policy: BackupPolicy,
}

const MAX_PUT_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(2);
const RETRY_CAP: Duration = Duration::from_secs(30);

/// Runs one backup to completion against an already-connected destination
/// (§4.6). `destination` and `remote_root` describe the same target the
/// catalog's `destination_ref` entries refer to; connecting/disconnecting
/// is the caller's job, mirroring how `rotation`/`verifier` take their
/// destination handle.
///
/// Returns the new backup's id on success. On cancellation the run ends
/// with `ScratError::Cancelled` after the backup row has already been
/// marked `failed` — callers don't need to do anything further with the
/// catalog.
pub fn run_backup(
    run_state: &RunState,
    store: &mut MetadataStore,
    destination: &mut dyn Destination,
    remote_root: &str,
    request: BackupRequest,
    sender: Sender<Arc<dyn Message>>,
) -> Result<String, ScratError> {
    let started_at = Utc::now();
    let start_instant = Instant::now();

    let (kind, base, salt) = resolve_kind(store, &request)?;
    let key = derive_key(&request.passphrase, &salt);
    let verifier = derive_verifier(&key);

    if let Some(base_row) = &base {
        if !verify_passphrase(&key, &base_row.passphrase_verifier) {
            return Err(ScratError::Passphrase(
                "passphrase does not match this destination's existing backups".to_string(),
            ));
        }
    }

    let backup_id = format!(
        "{}_{}",
        started_at.format("%Y%m%d_%H%M%S"),
        if kind == BackupKind::Full { "full" } else { "incr" }
    );
    let run_id = backup_id.clone();

    store.create_backup(&BackupRow {
        backup_id: backup_id.clone(),
        started_at,
        finished_at: None,
        kind,
        base_backup_id: base.as_ref().map(|b| b.backup_id.clone()),
        destination_ref: request.destination_ref.clone(),
        status: BackupStatus::Running,
        files_total: 0,
        size_original: 0,
        size_stored: 0,
        passphrase_verifier: verifier,
        compression: request.policy.compression,
    })?;

    emit(&sender, Event::BackupStarted { run_id: run_id.clone() });

    match run_backup_body(
        run_state,
        store,
        destination,
        remote_root,
        &request,
        &backup_id,
        base.as_ref().map(|b| b.backup_id.as_str()),
        key,
        &salt,
        started_at,
        start_instant,
        &sender,
    ) {
        Ok(stats) => {
            store.update_backup_status(
                &backup_id,
                BackupStatus::Completed,
                Some(Utc::now()),
                stats.files_total,
                stats.size_original,
                stats.size_stored,
            )?;
            emit(
                &sender,
                Event::BackupCompleted {
                    run_id: run_id.clone(),
                    stats,
                },
            );

            if request.policy.verify_after_backup {
                let _ = verifier::verify_backup(store, destination, remote_root, &backup_id, key, sender.clone());
            }

            let chains = rotation::plan_rotation(store, &request.destination_ref, request.policy.max_versions)?;
            if !chains.is_empty() {
                rotation::apply_rotation(store, destination, remote_root, &chains, sender.clone())?;
            }

            Ok(backup_id)
        }
        Err(RunOutcome::Cancelled) => {
            store.update_backup_status(&backup_id, BackupStatus::Failed, Some(Utc::now()), 0, 0, 0)?;
            emit(
                &sender,
                Event::BackupFailed {
                    run_id,
                    kind: "cancelled".to_string(),
                    message: "backup cancelled".to_string(),
                },
            );
            Err(ScratError::Cancelled)
        }
        Err(RunOutcome::Failed {
            error,
            cleanup_ok,
        }) => {
            let status = if cleanup_ok { BackupStatus::Failed } else { BackupStatus::Partial };
            store.update_backup_status(&backup_id, status, Some(Utc::now()), 0, 0, 0)?;
            emit(
                &sender,
                Event::BackupFailed {
                    run_id,
                    kind: error.code().to_string(),
                    message: error.to_string(),
                },
            );
            Err(error)
        }
    }
}

/// Resolves `auto`/`incremental`/`full` into a concrete kind plus (when
/// incremental) the base backup and the salt that derives this chain's
/// master key — reused across every backup in the chain so later
/// incrementals can decrypt earlier archives (§4.6 step 1, §4.2).
fn resolve_kind(
    store: &MetadataStore,
    request: &BackupRequest,
) -> Result<(BackupKind, Option<BackupRow>, [u8; 32]), ScratError> {
    let newest = store.newest_completed_backup(&request.destination_ref)?;

    let wants_incremental = match request.kind {
        BackupKindRequest::Full => false,
        BackupKindRequest::Incremental => true,
        BackupKindRequest::Auto => newest.is_some(),
    };

    if !wants_incremental {
        return Ok((BackupKind::Full, None, random_salt()));
    }

    let base = newest.ok_or_else(|| {
        ScratError::Validation("incremental backup requested but no completed backup exists".to_string())
    })?;

    let archives = store.archives_for_backup(&base.backup_id)?;
    let salt = archives
        .first()
        .and_then(|a| hex_decode(&a.iv_seed))
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            ScratError::Validation(format!(
                "base backup {} has no archives to recover the chain's key salt from",
                base.backup_id
            ))
        })?;

    Ok((BackupKind::Incremental, Some(base), salt))
}

fn emit(sender: &Sender<Arc<dyn Message>>, event: Event) {
    let _ = sender.send(Arc::new(EventMessage::new(event)));
}

enum RunOutcome {
    Cancelled,
    Failed { error: ScratError, cleanup_ok: bool },
}

/// One file pulled from the scanner, carrying enough to open and read it
/// once the archiver asks for it.
struct PendingFile {
    source_root: String,
    abs_root: PathBuf,
    relative_path: RelPath,
    size: u64,
    mtime: i64,
    mode: u32,
    kind: EntryKind,
}

#[allow(clippy::too_many_arguments)]
fn run_backup_body(
    run_state: &RunState,
    store: &mut MetadataStore,
    destination: &mut dyn Destination,
    remote_root: &str,
    request: &BackupRequest,
    backup_id: &str,
    base_backup_id: Option<&str>,
    key: [u8; 32],
    salt: &[u8; 32],
    started_at: chrono::DateTime<Utc>,
    start_instant: Instant,
    sender: &Sender<Arc<dyn Message>>,
) -> Result<BackupStats, RunOutcome> {
    run_state.start();

    let mut pending: VecDeque<PendingFile> = VecDeque::new();
    let mut skipped: Vec<String> = Vec::new();
    let mut deleted_rows: Vec<BackupFileRow> = Vec::new();
    let mut bytes_total: u64 = 0;
    let mut files_total: u64 = 0;

    for source in &request.sources {
        if !source.enabled {
            continue;
        }
        let entries = scanner::scan_source(Some(store), base_backup_id, source).map_err(|err| {
            RunOutcome::Failed {
                error: ScratError::Source(err.to_string()),
                cleanup_ok: true,
            }
        })?;

        for entry in entries {
            match entry {
                ScanEntry::Changed(record) => {
                    bytes_total += record.size;
                    files_total += 1;
                    pending.push_back(PendingFile {
                        source_root: record.source_root,
                        abs_root: PathBuf::from(&source.root_path),
                        relative_path: record.relative_path,
                        size: record.size,
                        mtime: record.mtime,
                        mode: record.mode,
                        kind: record.kind,
                    });
                }
                ScanEntry::Unchanged(_) => {}
                ScanEntry::Deleted(del) => {
                    files_total += 1;
                    deleted_rows.push(BackupFileRow {
                        backup_id: backup_id.to_string(),
                        source_root: del.source_root,
                        relative_path: del.relative_path,
                        logical_size: 0,
                        mtime: 0,
                        archive_name: None,
                        segment_offset: None,
                        segment_length: None,
                        flag: FileFlag::Deleted,
                    });
                }
            }
        }
    }

    if !deleted_rows.is_empty() {
        store.commit_segment_files(&deleted_rows).map_err(|err| RunOutcome::Failed {
            error: err.into(),
            cleanup_ok: true,
        })?;
    }

    let pending = Arc::new(Mutex::new(pending));
    let in_flight: Arc<Mutex<VecDeque<PendingFile>>> = Arc::new(Mutex::new(VecDeque::new()));
    let throttle = Arc::new(Mutex::new(ProgressThrottle::new(10)));
    let bytes_done = Arc::new(AtomicU64::new(0));
    let files_done = Arc::new(AtomicU64::new(0));
    let current_path = Arc::new(Mutex::new(String::new()));

    let mut ordinal: u32 = 1;
    let mut size_original: u64 = 0;
    let mut size_stored: u64 = 0;
    let mut canceled = false;

    while !pending.lock().unwrap().is_empty() && !run_state.is_canceled() {
        let segment_rows: Arc<Mutex<Vec<BackupFileRow>>> = Arc::new(Mutex::new(Vec::new()));
        let stored_counter = Arc::new(AtomicU64::new(0));
        let logical_counter = Arc::new(AtomicU64::new(0));

        let archive_name = format!("data.{ordinal:03}.scrat");
        let remote_path = RelPath::from_normalized(format!("{remote_root}/backups/{backup_id}/{archive_name}"));

        {
            let pending = pending.clone();
            let in_flight = in_flight.clone();
            let stored_counter_for_check = stored_counter.clone();
            let skip_log: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
            let skip_log_for_next = skip_log.clone();
            let split_size_bytes = request.policy.split_size_bytes;

            let next_file = move || -> io::Result<Option<(ArchiveFileMeta, Box<dyn Read + Send>)>> {
                loop {
                    if run_state.is_canceled() || stored_counter_for_check.load(Ordering::Relaxed) >= split_size_bytes {
                        return Ok(None);
                    }
                    let file = match pending.lock().unwrap().pop_front() {
                        Some(file) => file,
                        None => return Ok(None),
                    };

                    let abs = file.abs_root.join(file.relative_path.to_os_path());
                    let reader: Box<dyn Read + Send> = match file.kind {
                        EntryKind::File => match std::fs::File::open(&abs) {
                            Ok(f) => Box::new(f),
                            Err(err) => {
                                skip_log_for_next.lock().unwrap().push((file.relative_path.to_string(), err.to_string()));
                                continue;
                            }
                        },
                        EntryKind::Symlink => match std::fs::read_link(&abs) {
                            Ok(target) => Box::new(io::Cursor::new(
                                target.to_string_lossy().into_owned().into_bytes(),
                            )),
                            Err(err) => {
                                skip_log_for_next.lock().unwrap().push((file.relative_path.to_string(), err.to_string()));
                                continue;
                            }
                        },
                    };

                    let meta = ArchiveFileMeta {
                        relative_path: file.relative_path.as_str().to_string(),
                        size: file.size,
                        mtime: file.mtime,
                        mode: file.mode,
                        is_symlink: file.kind == EntryKind::Symlink,
                    };
                    in_flight.lock().unwrap().push_back(file);
                    return Ok(Some((meta, reader)));
                }
            };

            let backup_id_owned = backup_id.to_string();
            let archive_name_for_placement = archive_name.clone();
            let in_flight_for_placement = in_flight.clone();
            let segment_rows_for_placement = segment_rows.clone();
            let bytes_done_for_placement = bytes_done.clone();
            let files_done_for_placement = files_done.clone();
            let current_path_for_placement = current_path.clone();
            let throttle_for_placement = throttle.clone();
            let bytes_total_for_placement = bytes_total;
            let files_total_for_placement = files_total;
            let sender_for_placement = sender.clone();
            let run_id_for_placement = backup_id.to_string();

            let on_placement = move |meta: &ArchiveFileMeta, placement: FilePlacement| {
                if let Some(file) = in_flight_for_placement.lock().unwrap().pop_front() {
                    segment_rows_for_placement.lock().unwrap().push(BackupFileRow {
                        backup_id: backup_id_owned.clone(),
                        source_root: file.source_root,
                        relative_path: file.relative_path,
                        logical_size: file.size,
                        mtime: file.mtime,
                        archive_name: Some(archive_name_for_placement.clone()),
                        segment_offset: Some(placement.segment_offset),
                        segment_length: Some(placement.segment_length),
                        flag: FileFlag::Present,
                    });
                }

                bytes_done_for_placement.fetch_add(meta.size, Ordering::Relaxed);
                files_done_for_placement.fetch_add(1, Ordering::Relaxed);
                *current_path_for_placement.lock().unwrap() = meta.relative_path.clone();

                let mut throttle = throttle_for_placement.lock().unwrap();
                if throttle.should_emit(Instant::now()) {
                    let bytes_done = bytes_done_for_placement.load(Ordering::Relaxed);
                    let elapsed = start_instant.elapsed().as_secs_f64();
                    let speed_bps = if elapsed > 0.0 { bytes_done as f64 / elapsed } else { 0.0 };
                    let eta_seconds = if speed_bps > 0.0 && bytes_total_for_placement > bytes_done {
                        Some((bytes_total_for_placement - bytes_done) as f64 / speed_bps)
                    } else {
                        None
                    };
                    let _ = sender_for_placement.send(Arc::new(EventMessage::new(Event::BackupProgress {
                        run_id: run_id_for_placement.clone(),
                        bytes_done,
                        bytes_total: bytes_total_for_placement,
                        files_done: files_done_for_placement.load(Ordering::Relaxed),
                        files_total: files_total_for_placement,
                        current_path: current_path_for_placement.lock().unwrap().clone(),
                        speed_bps,
                        eta_seconds,
                    })));
                }
            };

            let writer = ArchiveWriter::new(next_file, on_placement);
            let logical_counting = CountingReader::new(writer, logical_counter.clone());
            let compressed = CompressingReader::new(logical_counting, request.policy.compression).map_err(|err| {
                RunOutcome::Failed {
                    error: ScratError::Internal(err.to_string()),
                    cleanup_ok: true,
                }
            })?;
            let encryptor =
                crate::core::cryptor::SegmentEncryptor::new(compressed, key, *salt, request.policy.chunk_size_bytes);
            let mut counting_out = CountingReader::new(encryptor, stored_counter.clone());

            let put_result = retry_put_stream(destination, &remote_path, &mut counting_out, sender);

            for (path, reason) in skip_log.lock().unwrap().drain(..) {
                send_warn!(sender, "skipping {path}: {reason}");
                skipped.push(format!("{path}: {reason}"));
            }

            match put_result {
                Ok(stored) => {
                    if run_state.is_canceled() {
                        let _ = destination.delete(&remote_path);
                        canceled = true;
                        break;
                    }
                    let logical = logical_counter.load(Ordering::Relaxed);
                    let rows = segment_rows.lock().unwrap().clone();
                    if !rows.is_empty() {
                        store.commit_segment_files(&rows).map_err(|err| RunOutcome::Failed {
                            error: err.into(),
                            cleanup_ok: true,
                        })?;
                    }
                    store
                        .insert_archive(&ArchiveRow {
                            backup_id: backup_id.to_string(),
                            ordinal,
                            name: archive_name.clone(),
                            iv_seed: hex_encode(salt),
                            logical_size: logical,
                            stored_size: stored,
                            status: ArchiveStatus::Sealed,
                        })
                        .map_err(|err| RunOutcome::Failed {
                            error: err.into(),
                            cleanup_ok: true,
                        })?;
                    size_original += logical;
                    size_stored += stored;
                    ordinal += 1;
                }
                Err(err) => {
                    let cleanup_ok = destination.delete(&remote_path).is_ok();
                    return Err(RunOutcome::Failed {
                        error: err.into(),
                        cleanup_ok,
                    });
                }
            }
        }
    }

    if run_state.is_canceled() && !canceled {
        canceled = true;
    }
    run_state.stop();

    if canceled {
        return Err(RunOutcome::Cancelled);
    }

    write_manifest(
        store,
        destination,
        remote_root,
        backup_id,
        base_backup_id,
        key,
        &request.sources,
        size_original,
        size_stored,
        files_total,
        start_instant,
        request.policy.compression,
    )
    .map_err(|err| RunOutcome::Failed { error: err, cleanup_ok: true })?;

    write_recovery_info(destination, remote_root, backup_id, started_at).map_err(|err| RunOutcome::Failed {
        error: ScratError::Destination(err),
        cleanup_ok: true,
    })?;

    Ok(BackupStats {
        files_total,
        size_original,
        size_stored,
        duration_seconds: start_instant.elapsed().as_secs_f64(),
        skipped_files: skipped,
    })
}

#[allow(clippy::too_many_arguments)]
fn write_manifest(
    store: &MetadataStore,
    destination: &mut dyn Destination,
    remote_root: &str,
    backup_id: &str,
    base_backup_id: Option<&str>,
    key: [u8; 32],
    sources: &[Source],
    size_original: u64,
    size_stored: u64,
    files_total: u64,
    start_instant: Instant,
    compression: Compression,
) -> Result<(), ScratError> {
    let archives = store.archives_for_backup(backup_id)?;
    let manifest_archives = archives
        .iter()
        .map(|a| ManifestArchive {
            ordinal: a.ordinal,
            name: a.name.clone(),
            stored_size: a.stored_size,
            iv_seed: a.iv_seed.clone(),
            files_count: store
                .files_for_backup(backup_id)
                .map(|rows| {
                    rows.iter()
                        .filter(|r| r.archive_name.as_deref() == Some(a.name.as_str()))
                        .count() as u64
                })
                .unwrap_or(0),
        })
        .collect();

    let manifest = Manifest {
        backup_id: backup_id.to_string(),
        kind: if base_backup_id.is_some() { "incremental" } else { "full" }.to_string(),
        timestamp: Utc::now(),
        base_backup_id: base_backup_id.map(|s| s.to_string()),
        format_version: MANIFEST_FORMAT_VERSION,
        sources: sources
            .iter()
            .map(|s| ManifestSource {
                name: s.name.clone(),
                path: s.root_path.clone(),
            })
            .collect(),
        archives: manifest_archives,
        stats: ManifestStats {
            files_total,
            size_original,
            size_stored,
            duration_seconds: start_instant.elapsed().as_secs(),
        },
        verifier: derive_verifier(&key),
        compression,
    };

    let sealed = encrypt_manifest(&manifest, key)?;
    let remote_path = RelPath::from_normalized(format!("{remote_root}/backups/{backup_id}/manifest.json.enc"));
    destination
        .put_stream(&remote_path, &mut io::Cursor::new(sealed), None)
        .map_err(ScratError::Destination)?;
    Ok(())
}

fn write_recovery_info(
    destination: &mut dyn Destination,
    remote_root: &str,
    backup_id: &str,
    started_at: chrono::DateTime<Utc>,
) -> Result<(), DestinationError> {
    let body = format!(
        "This directory holds a scrat backup (format version {MANIFEST_FORMAT_VERSION}).\n\
         Latest backup written here: {backup_id} at {started_at}.\n\
         Restore with the scrat CLI against this destination and your passphrase;\n\
         the manifest under backups/{backup_id}/manifest.json.enc carries everything\n\
         needed to reconstruct the catalog if the local one is lost.\n",
    );
    let remote_path = RelPath::from_normalized(format!("{remote_root}/recovery_info.txt"));
    destination.put_stream(&remote_path, &mut io::Cursor::new(body.into_bytes()), None)?;
    Ok(())
}

/// Retries a single `put_stream` call against transient destination
/// failures with exponential backoff (§7: 3 attempts, base 2s, cap 30s,
/// plus jitter). Staging destinations (WebDAV, shelled multi-cloud) already
/// hold the sealed segment on local disk before this is called, so a retry
/// there buffers once and replays the buffer against a fresh attempt.
/// Streaming destinations (local, SFTP, SMB) must never have a whole
/// segment buffered into memory (§4.1) — a retry there goes straight back
/// to the original reader.
fn retry_put_stream(
    destination: &mut dyn Destination,
    path: &RelPath,
    reader: &mut dyn Read,
    sender: &Sender<Arc<dyn Message>>,
) -> Result<u64, DestinationError> {
    if destination.stages_locally() {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).map_err(|err| {
            DestinationError::PutFailed(path.to_string(), Box::new(err))
        })?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match destination.put_stream(path, &mut io::Cursor::new(buf.clone()), Some(buf.len() as u64)) {
                Ok(written) => return Ok(written),
                Err(err) if attempt < MAX_PUT_ATTEMPTS && is_retryable(&err) => {
                    send_warn!(sender, "retrying write to {path}: {err}");
                    std::thread::sleep(backoff_delay(attempt));
                }
                Err(err) => return Err(err),
            }
        }
    } else {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match destination.put_stream(path, reader, None) {
                Ok(written) => return Ok(written),
                Err(err) if attempt < MAX_PUT_ATTEMPTS && is_retryable(&err) => {
                    send_warn!(sender, "retrying write to {path}: {err}");
                    std::thread::sleep(backoff_delay(attempt));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_retryable(err: &DestinationError) -> bool {
    matches!(
        err,
        DestinationError::PutFailed(_, _) | DestinationError::ConnectionFailed(_)
    )
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE.saturating_mul(1u32 << (attempt - 1)).min(RETRY_CAP);
    let jitter_ms = rand::rng().random_range(0..250u64);
    base + Duration::from_millis(jitter_ms)
}

/// Counts bytes as they pass through `inner`, for tracking a segment's
/// logical and stored sizes without materializing them.
struct CountingReader<R: Read> {
    inner: R,
    counter: Arc<AtomicU64>,
}

impl<R: Read> CountingReader<R> {
    fn new(inner: R, counter: Arc<AtomicU64>) -> Self {
        CountingReader { inner, counter }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counter.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::destination::{DestinationEntry, DestinationStat};
    use crate::shared::config::BackupPolicy;
    use crossbeam_channel::unbounded;
    use std::collections::HashMap;
    use std::io::Write;

    struct MemoryDestination {
        objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MemoryDestination {
        fn new() -> Self {
            MemoryDestination {
                objects: Mutex::new(HashMap::new()),
            }
        }
    }

    impl Destination for MemoryDestination {
        fn connect(&mut self) -> Result<(), DestinationError> {
            Ok(())
        }
        fn disconnect(&mut self) -> Result<(), DestinationError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn put_stream(
            &mut self,
            path: &RelPath,
            reader: &mut dyn Read,
            _len_hint: Option<u64>,
        ) -> Result<u64, DestinationError> {
            let mut buf = Vec::new();
            let n = reader.read_to_end(&mut buf).unwrap() as u64;
            self.objects.lock().unwrap().insert(path.as_str().to_string(), buf);
            Ok(n)
        }
        fn get_stream(&mut self, path: &RelPath) -> Result<Box<dyn Read + Send>, DestinationError> {
            let bytes = self
                .objects
                .lock()
                .unwrap()
                .get(path.as_str())
                .cloned()
                .ok_or_else(|| DestinationError::NotFound(path.to_string()))?;
            Ok(Box::new(io::Cursor::new(bytes)))
        }
        fn list(&mut self, _dir: &RelPath) -> Result<Vec<DestinationEntry>, DestinationError> {
            Ok(Vec::new())
        }
        fn delete(&mut self, path: &RelPath) -> Result<(), DestinationError> {
            self.objects.lock().unwrap().remove(path.as_str());
            Ok(())
        }
        fn stat(&mut self, _path: &RelPath) -> Result<DestinationStat, DestinationError> {
            Ok(DestinationStat { size: 0, modified: None })
        }
        fn free_space(&mut self) -> Result<Option<u64>, DestinationError> {
            Ok(None)
        }
    }

    fn write_file(dir: &std::path::Path, name: &str, contents: &[u8]) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents).unwrap();
    }

    fn policy() -> BackupPolicy {
        BackupPolicy {
            max_versions: 3,
            split_size_bytes: 10 * 1024 * 1024,
            chunk_size_bytes: 1024 * 1024,
            compression: crate::shared::config::Compression::None,
            verify_after_backup: true,
        }
    }

    #[test]
    fn full_backup_writes_archive_and_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "a.txt", b"hello world");
        write_file(tmp.path(), "sub/b.txt", b"nested file");

        let mut store = MetadataStore::open_in_memory().unwrap();
        let mut dest = MemoryDestination::new();
        let run_state = RunState::new();
        let (tx, _rx) = unbounded();

        let request = BackupRequest {
            sources: vec![Source {
                name: "docs".to_string(),
                root_path: tmp.path().to_string_lossy().into_owned(),
                enabled: true,
                exclude_patterns: Vec::new(),
            }],
            destination_ref: "dest1".to_string(),
            kind: BackupKindRequest::Auto,
            passphrase: SecretString::new("hunter2".into()),
            policy: policy(),
        };

        let backup_id = run_backup(&run_state, &mut store, &mut dest, "scrat-backup", request, tx).unwrap();

        let row = store.get_backup(&backup_id).unwrap().unwrap();
        assert_eq!(row.status, BackupStatus::Completed);
        assert_eq!(row.kind, BackupKind::Full);
        assert_eq!(row.files_total, 2);
        assert!(row.size_original > 0);

        assert!(
            dest.objects
                .lock()
                .unwrap()
                .contains_key(&format!("scrat-backup/backups/{backup_id}/manifest.json.enc"))
        );
        assert!(
            dest.objects
                .lock()
                .unwrap()
                .contains_key(&format!("scrat-backup/backups/{backup_id}/data.001.scrat"))
        );
    }

    #[test]
    fn incremental_backup_skips_unchanged_files() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "a.txt", b"hello world");

        let mut store = MetadataStore::open_in_memory().unwrap();
        let mut dest = MemoryDestination::new();
        let run_state = RunState::new();

        let source = Source {
            name: "docs".to_string(),
            root_path: tmp.path().to_string_lossy().into_owned(),
            enabled: true,
            exclude_patterns: Vec::new(),
        };

        let (tx1, _rx1) = unbounded();
        let full_id = run_backup(
            &run_state,
            &mut store,
            &mut dest,
            "scrat-backup",
            BackupRequest {
                sources: vec![source.clone()],
                destination_ref: "dest1".to_string(),
                kind: BackupKindRequest::Full,
                passphrase: SecretString::new("hunter2".into()),
                policy: policy(),
            },
            tx1,
        )
        .unwrap();

        write_file(tmp.path(), "b.txt", b"a brand new file");

        let (tx2, _rx2) = unbounded();
        let incr_id = run_backup(
            &run_state,
            &mut store,
            &mut dest,
            "scrat-backup",
            BackupRequest {
                sources: vec![source],
                destination_ref: "dest1".to_string(),
                kind: BackupKindRequest::Incremental,
                passphrase: SecretString::new("hunter2".into()),
                policy: policy(),
            },
            tx2,
        )
        .unwrap();

        let row = store.get_backup(&incr_id).unwrap().unwrap();
        assert_eq!(row.kind, BackupKind::Incremental);
        assert_eq!(row.base_backup_id.as_deref(), Some(full_id.as_str()));
        // only the new file travels in the incremental's own file rows.
        let files = store.files_for_backup(&incr_id).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path.as_str(), "b.txt");
    }

    #[test]
    fn wrong_passphrase_is_rejected_for_incremental() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "a.txt", b"hello world");

        let mut store = MetadataStore::open_in_memory().unwrap();
        let mut dest = MemoryDestination::new();
        let run_state = RunState::new();
        let source = Source {
            name: "docs".to_string(),
            root_path: tmp.path().to_string_lossy().into_owned(),
            enabled: true,
            exclude_patterns: Vec::new(),
        };

        let (tx1, _rx1) = unbounded();
        run_backup(
            &run_state,
            &mut store,
            &mut dest,
            "scrat-backup",
            BackupRequest {
                sources: vec![source.clone()],
                destination_ref: "dest1".to_string(),
                kind: BackupKindRequest::Full,
                passphrase: SecretString::new("hunter2".into()),
                policy: policy(),
            },
            tx1,
        )
        .unwrap();

        let (tx2, _rx2) = unbounded();
        let result = run_backup(
            &run_state,
            &mut store,
            &mut dest,
            "scrat-backup",
            BackupRequest {
                sources: vec![source],
                destination_ref: "dest1".to_string(),
                kind: BackupKindRequest::Incremental,
                passphrase: SecretString::new("wrong password".into()),
                policy: policy(),
            },
            tx2,
        );

        assert!(matches!(result, Err(ScratError::Passphrase(_))));
    }

    #[test]
    fn cancellation_between_files_leaves_no_stray_archive() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..5 {
            write_file(tmp.path(), &format!("f{i}.txt"), b"some content here");
        }

        let mut store = MetadataStore::open_in_memory().unwrap();
        let mut dest = MemoryDestination::new();
        let run_state = RunState::new();
        run_state.request_cancel();

        let (tx, _rx) = unbounded();
        let result = run_backup(
            &run_state,
            &mut store,
            &mut dest,
            "scrat-backup",
            BackupRequest {
                sources: vec![Source {
                    name: "docs".to_string(),
                    root_path: tmp.path().to_string_lossy().into_owned(),
                    enabled: true,
                    exclude_patterns: Vec::new(),
                }],
                destination_ref: "dest1".to_string(),
                kind: BackupKindRequest::Full,
                passphrase: SecretString::new("hunter2".into()),
                policy: policy(),
            },
            tx,
        );

        assert!(matches!(result, Err(ScratError::Cancelled)));
        assert!(dest.objects.lock().unwrap().is_empty());
    }
}
