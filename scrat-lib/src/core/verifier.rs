use std::io;
use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::core::cryptor::SegmentDecryptor;
use crate::core::destination::Destination;
use crate::core::metadata_store::{ArchiveRow, MetadataStore};
use crate::send_error;
use crate::send_info;
use crate::shared::message::{Message, StringError};
use crate::shared::relpath::RelPath;

/// The outcome of verifying one sealed archive segment.
#[derive(Debug, Clone)]
pub struct ArchiveVerifyResult {
    pub ordinal: u32,
    pub name: String,
    pub ok: bool,
}

/// Re-reads every sealed archive of a just-completed backup and checks its
/// AEAD tags, without ever materializing plaintext to disk — a dedicated
/// pass distinct from the backup's own transfer, mirroring the corpus's
/// node verify task which revisits just-written data and reports verify
/// failures separately from transfer failures.
///
/// Driven by the `verify_after_backup` policy knob; failures here do not
/// roll a completed backup back to `failed` — they're reported so the
/// caller can decide (§6.3 event stream carries them as their own kind).
pub fn verify_backup(
    store: &MetadataStore,
    destination: &mut dyn Destination,
    remote_root: &str,
    backup_id: &str,
    key: [u8; 32],
    sender: Sender<Arc<dyn Message>>,
) -> Result<Vec<ArchiveVerifyResult>, crate::core::metadata_store::MetadataError> {
    let archives = store.archives_for_backup(backup_id)?;
    let mut results = Vec::with_capacity(archives.len());

    for archive in archives {
        let ok = verify_one_archive(destination, remote_root, backup_id, &archive, key);
        if ok {
            send_info!(sender, "Verified archive {}", archive.name);
        } else {
            send_error!(
                sender,
                StringError::new(format!("Verification failed for archive {}", archive.name))
            );
        }
        results.push(ArchiveVerifyResult {
            ordinal: archive.ordinal,
            name: archive.name.clone(),
            ok,
        });
    }

    Ok(results)
}

fn verify_one_archive(
    destination: &mut dyn Destination,
    remote_root: &str,
    backup_id: &str,
    archive: &ArchiveRow,
    key: [u8; 32],
) -> bool {
    let remote_path =
        RelPath::from_normalized(format!("{remote_root}/backups/{backup_id}/{}", archive.name));

    let reader = match destination.get_stream(&remote_path) {
        Ok(reader) => reader,
        Err(_) => return false,
    };

    let mut decryptor = SegmentDecryptor::new(reader, key);
    io::copy(&mut decryptor, &mut io::sink()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cryptor::{DEFAULT_CHUNK_SIZE, SegmentEncryptor, derive_key, random_salt};
    use crate::core::destination::{DestinationEntry, DestinationError, DestinationStat};
    use crate::core::metadata_store::{ArchiveStatus, BackupKind, BackupRow, BackupStatus};
    use chrono::Utc;
    use crossbeam_channel::unbounded;
    use secrecy::SecretString;
    use std::collections::HashMap;
    use std::io::Read;
    use std::sync::Mutex;

    struct MemoryDestination {
        objects: Mutex<HashMap<String, Vec<u8>>>,
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
            Ok(Box::new(std::io::Cursor::new(bytes)))
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

    fn backup_row(id: &str) -> BackupRow {
        BackupRow {
            backup_id: id.to_string(),
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            kind: BackupKind::Full,
            base_backup_id: None,
            destination_ref: "dest1".to_string(),
            status: BackupStatus::Completed,
            files_total: 1,
            size_original: 10,
            size_stored: 10,
            passphrase_verifier: "v".to_string(),
            compression: crate::shared::config::Compression::None,
        }
    }

    #[test]
    fn verifies_a_sealed_archive_and_detects_corruption() {
        let key = derive_key(&SecretString::new("hunter2".into()), &[1u8; 32]);

        let mut store = MetadataStore::open_in_memory().unwrap();
        store.create_backup(&backup_row("B1")).unwrap();
        store
            .insert_archive(&ArchiveRow {
                backup_id: "B1".to_string(),
                ordinal: 1,
                name: "data.001.scrat".to_string(),
                iv_seed: "abc123".to_string(),
                logical_size: 11,
                stored_size: 0,
                status: ArchiveStatus::Sealed,
            })
            .unwrap();

        let mut encryptor = SegmentEncryptor::new(
            std::io::Cursor::new(b"hello world".to_vec()),
            key,
            random_salt(),
            DEFAULT_CHUNK_SIZE,
        );
        let mut sealed = Vec::new();
        encryptor.read_to_end(&mut sealed).unwrap();

        let mut dest = MemoryDestination {
            objects: Mutex::new(HashMap::new()),
        };
        dest.objects
            .lock()
            .unwrap()
            .insert("scrat-backup/backups/B1/data.001.scrat".to_string(), sealed.clone());

        let (tx, _rx) = unbounded();
        let results = verify_backup(&store, &mut dest, "scrat-backup", "B1", key, tx).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].ok);

        // Corrupt a byte in the middle of the ciphertext and verify it's caught.
        let mut corrupted = sealed.clone();
        let mid = corrupted.len() / 2;
        corrupted[mid] ^= 0xFF;
        dest.objects
            .lock()
            .unwrap()
            .insert("scrat-backup/backups/B1/data.001.scrat".to_string(), corrupted);

        let (tx2, _rx2) = unbounded();
        let results = verify_backup(&store, &mut dest, "scrat-backup", "B1", key, tx2).unwrap();
        assert!(!results[0].ok);
    }
}
