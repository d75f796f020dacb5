use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::Sender;
use toml_edit::{DocumentMut, Item};

use crate::{
    send_error, send_info,
    shared::{config::Config, message::Message},
};

/// Writes a [`Config`] back to disk while preserving comments and key
/// order of the existing file (patch, not overwrite).
pub struct ConfigWriter;

impl ConfigWriter {
    pub fn write(sender: Sender<Arc<dyn Message>>, path: &Path, config: &Config) {
        let mut doc: DocumentMut = if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => content
                    .parse::<DocumentMut>()
                    .unwrap_or_else(|_| DocumentMut::new()),
                Err(err) => {
                    send_error!(sender, err);
                    return;
                }
            }
        } else {
            DocumentMut::new()
        };

        Self::patch_root(config, &mut doc);

        match std::fs::write(path, doc.to_string()) {
            Ok(()) => send_info!(sender, "Config written to {}", path.display()),
            Err(err) => send_error!(sender, err),
        }
    }

    fn patch_root(config: &Config, doc: &mut DocumentMut) {
        doc["backup_policy"] = Item::Table(
            toml_edit::ser::to_document(&config.backup_policy)
                .expect("BackupPolicy always serializes")
                .as_table()
                .clone(),
        );

        Self::patch_table(doc, "sources", &config.sources);
        Self::patch_table(doc, "destinations", &config.destinations);
        Self::patch_table(doc, "schedules", &config.schedules);
    }

    fn patch_table<T: serde::Serialize>(
        doc: &mut DocumentMut,
        path: &str,
        map: &std::collections::HashMap<String, T>,
    ) {
        let mut current = doc.as_table_mut();

        for part in path.split('.') {
            current = current
                .entry(part)
                .or_insert(Item::Table(Default::default()))
                .as_table_mut()
                .unwrap();
        }

        let existing_keys: Vec<String> = current.iter().map(|(k, _)| k.to_string()).collect();
        for key in existing_keys {
            if !map.contains_key(&key) {
                current.remove(&key);
            }
        }

        for (key, value) in map {
            let table = toml_edit::ser::to_document(value)
                .expect("config entries always serialize")
                .as_table()
                .clone();

            current[key] = Item::Table(table);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::config::{ConfigEntryType, Source};
    use crossbeam_channel::unbounded;

    #[test]
    fn preserves_unrelated_comments_on_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "# a hand-written comment\n").unwrap();

        let mut config = Config::default();
        config.add_new_entry(&ConfigEntryType::Source, "docs");
        if let Some(crate::shared::config::ConfigEntryMut::Source(source)) =
            config.get_entry_mut(&crate::shared::config::ConfigEntryKey {
                entry_type: ConfigEntryType::Source,
                name: "docs".to_string(),
            })
        {
            *source = Source {
                name: "docs".to_string(),
                root_path: "/home/user/Documents".to_string(),
                enabled: true,
                exclude_patterns: vec![],
            };
        }

        let (tx, _rx) = unbounded();
        ConfigWriter::write(tx, &path, &config);

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# a hand-written comment"));
        assert!(written.contains("/home/user/Documents"));
    }
}
