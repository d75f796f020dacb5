use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::core::destination::Destination;
use crate::core::metadata_store::{BackupKind, BackupRow, MetadataError, MetadataStore};
use crate::send_error;
use crate::send_info;
use crate::shared::message::Message;

/// A "backup chain" (§4.6 Rotation policy): a full backup plus all of its
/// transitively dependent incrementals, treated as one rotation unit.
#[derive(Debug, Clone)]
pub struct BackupChain {
    pub full_backup_id: String,
    /// All backup_ids belonging to this chain, full first, in ascending order.
    pub members: Vec<String>,
}

/// Groups a destination's completed backups into chains and decides which
/// chains to delete to respect `max_versions` (§4.6): "keep the N newest
/// backup chains; delete entire chains oldest-first; a backup can never be
/// deleted while another surviving backup lists it as `base_backup_id`".
pub fn plan_rotation(
    store: &MetadataStore,
    destination_ref: &str,
    max_versions: u32,
) -> Result<Vec<BackupChain>, MetadataError> {
    let backups = store.completed_backups(destination_ref)?;

    let mut chains: Vec<BackupChain> = Vec::new();
    for backup in &backups {
        if backup.kind == BackupKind::Full {
            chains.push(BackupChain {
                full_backup_id: backup.backup_id.clone(),
                members: vec![backup.backup_id.clone()],
            });
        }
    }

    for backup in &backups {
        if backup.kind != BackupKind::Incremental {
            continue;
        }
        if let Some(base_id) = &backup.base_backup_id {
            if let Some(root) = find_chain_root(&backups, base_id) {
                if let Some(chain) = chains.iter_mut().find(|c| c.full_backup_id == root) {
                    chain.members.push(backup.backup_id.clone());
                }
            }
        }
    }

    for chain in &mut chains {
        chain.members.sort();
    }
    chains.sort_by(|a, b| a.full_backup_id.cmp(&b.full_backup_id));

    if (chains.len() as u64) <= max_versions as u64 {
        return Ok(Vec::new());
    }

    let drop_count = chains.len() - max_versions as usize;
    Ok(chains.into_iter().take(drop_count).collect())
}

/// Walks `base_backup_id` links back to the originating full backup.
fn find_chain_root(backups: &[BackupRow], start: &str) -> Option<String> {
    let mut current = start.to_string();
    loop {
        let row = backups.iter().find(|b| b.backup_id == current)?;
        match &row.base_backup_id {
            None => return Some(row.backup_id.clone()),
            Some(base) => current = base.clone(),
        }
    }
}

/// Deletes the chains [`plan_rotation`] selected: archives and manifest via
/// the destination, then catalog rows via the metadata store. Must succeed
/// or leave the store consistent — never partially dangling archives
/// (§4.6), so archives are removed before their rows.
pub fn apply_rotation(
    store: &mut MetadataStore,
    destination: &mut dyn Destination,
    remote_root: &str,
    chains: &[BackupChain],
    sender: Sender<Arc<dyn Message>>,
) -> Result<(), MetadataError> {
    for chain in chains {
        for backup_id in &chain.members {
            let remote_dir =
                crate::shared::relpath::RelPath::from_normalized(format!(
                    "{remote_root}/backups/{backup_id}"
                ));
            if let Err(err) = destination.delete_tree(&remote_dir) {
                send_error!(sender, err);
                continue;
            }
            store.delete_backup(backup_id)?;
            send_info!(sender, "Rotated out backup {backup_id}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metadata_store::BackupStatus;
    use chrono::Utc;
    use crossbeam_channel::unbounded;

    fn backup(id: &str, kind: BackupKind, base: Option<&str>) -> BackupRow {
        BackupRow {
            backup_id: id.to_string(),
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            kind,
            base_backup_id: base.map(|s| s.to_string()),
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
    fn keeps_newest_n_chains_and_groups_incrementals_with_their_full() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        store
            .create_backup(&backup("F1", BackupKind::Full, None))
            .unwrap();
        store
            .create_backup(&backup("F1_I1", BackupKind::Incremental, Some("F1")))
            .unwrap();
        store
            .create_backup(&backup("F2", BackupKind::Full, None))
            .unwrap();
        store
            .create_backup(&backup("F3", BackupKind::Full, None))
            .unwrap();

        let to_delete = plan_rotation(&store, "dest1", 2).unwrap();
        assert_eq!(to_delete.len(), 1);
        assert_eq!(to_delete[0].full_backup_id, "F1");
        assert!(to_delete[0].members.contains(&"F1_I1".to_string()));
    }

    #[test]
    fn no_rotation_needed_when_under_the_limit() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        store
            .create_backup(&backup("F1", BackupKind::Full, None))
            .unwrap();

        let to_delete = plan_rotation(&store, "dest1", 3).unwrap();
        assert!(to_delete.is_empty());
    }

    #[test]
    fn apply_rotation_removes_store_rows() {
        use crate::core::destination::{Destination, DestinationEntry, DestinationError, DestinationStat};
        use crate::shared::relpath::RelPath;
        use std::io::Read;

        struct NoopDestination;
        impl Destination for NoopDestination {
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
                _path: &RelPath,
                _reader: &mut dyn Read,
                _len_hint: Option<u64>,
            ) -> Result<u64, DestinationError> {
                Ok(0)
            }
            fn get_stream(&mut self, _path: &RelPath) -> Result<Box<dyn Read + Send>, DestinationError> {
                Ok(Box::new(std::io::Cursor::new(Vec::new())))
            }
            fn list(&mut self, _dir: &RelPath) -> Result<Vec<DestinationEntry>, DestinationError> {
                Ok(Vec::new())
            }
            fn delete(&mut self, _path: &RelPath) -> Result<(), DestinationError> {
                Ok(())
            }
            fn stat(&mut self, _path: &RelPath) -> Result<DestinationStat, DestinationError> {
                Ok(DestinationStat {
                    size: 0,
                    modified: None,
                })
            }
            fn free_space(&mut self) -> Result<Option<u64>, DestinationError> {
                Ok(None)
            }
        }

        let mut store = MetadataStore::open_in_memory().unwrap();
        store
            .create_backup(&backup("F1", BackupKind::Full, None))
            .unwrap();

        let chains = vec![BackupChain {
            full_backup_id: "F1".to_string(),
            members: vec!["F1".to_string()],
        }];

        let (tx, _rx) = unbounded();
        let mut dest = NoopDestination;
        apply_rotation(&mut store, &mut dest, "scrat-backup", &chains, tx).unwrap();

        assert!(store.get_backup("F1").unwrap().is_none());
    }
}
