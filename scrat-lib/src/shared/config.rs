use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::{send_error, shared::message::Message};

/// Loads a [`Config`] from a TOML file on disk, reporting parse/IO errors
/// over the event sender rather than panicking (§9: engine never calls UI
/// code directly, but it may narrate failures over the bus).
pub fn load_config_from_file(sender: Sender<Arc<dyn Message>>, path: &str) -> Option<Config> {
    match std::fs::read_to_string(path) {
        Ok(content) => load_config_from_str(sender, &content),
        Err(err) => {
            send_error!(sender, err);
            None
        }
    }
}

pub fn load_config_from_str(sender: Sender<Arc<dyn Message>>, content: &str) -> Option<Config> {
    match toml::from_str::<Config>(content) {
        Ok(config) => Some(config),
        Err(err) => {
            send_error!(sender, err);
            None
        }
    }
}

pub fn save_config_to_file(sender: Sender<Arc<dyn Message>>, path: &str, config: &Config) {
    let content = match toml::to_string_pretty(config) {
        Ok(content) => content,
        Err(err) => {
            send_error!(sender, err);
            return;
        }
    };

    if let Err(err) = std::fs::write(path, content) {
        send_error!(sender, err);
    }
}

#[derive(Display, Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConfigEntryType {
    #[strum(to_string = "source")]
    Source,
    #[strum(to_string = "destination")]
    Destination,
    #[strum(to_string = "schedule")]
    Schedule,
}

impl ConfigEntryType {
    pub const ALL: [Self; 3] = [Self::Source, Self::Destination, Self::Schedule];
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigEntryKey {
    pub entry_type: ConfigEntryType,
    pub name: String,
}

impl fmt::Display for ConfigEntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.\"{}\"", self.entry_type, self.name)
    }
}

pub enum ConfigEntryMut<'a> {
    Source(&'a mut Source),
    Destination(&'a mut Destination),
    Schedule(&'a mut Schedule),
}

/// Compression policy knob (§6.2). "none" is a first-class mode, not a
/// runtime fallback (§9 "Compression regression" note).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[strum(to_string = "none")]
    None,
    #[strum(to_string = "fast")]
    Fast,
    #[strum(to_string = "balanced")]
    Balanced,
    #[strum(to_string = "best")]
    Best,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Fast
    }
}

impl Compression {
    /// Maps the policy knob to a zstd compression level; `None` means
    /// store-only and is handled separately by the compressor (it never
    /// invokes the zstd encoder at all).
    pub fn zstd_level(self) -> i32 {
        match self {
            Compression::None => 0,
            Compression::Fast => 1,
            Compression::Balanced => 9,
            Compression::Best => 19,
        }
    }
}

fn default_max_versions() -> u32 {
    3
}

fn default_split_size() -> u64 {
    128 * 1024 * 1024
}

fn default_chunk_size() -> u32 {
    64 * 1024 * 1024
}

/// Backup policy (§6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupPolicy {
    pub max_versions: u32,
    pub split_size_bytes: u64,
    pub chunk_size_bytes: u32,
    pub compression: Compression,
    pub verify_after_backup: bool,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        BackupPolicy {
            max_versions: default_max_versions(),
            split_size_bytes: default_split_size(),
            chunk_size_bytes: default_chunk_size(),
            compression: Compression::default(),
            verify_after_backup: false,
        }
    }
}

/// A backup source (§3, §6.2). `exclude_patterns` are unioned with the
/// OS-specific built-ins in [`super::super::core::scanner::built_in_excludes`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Source {
    pub name: String,
    pub root_path: String,
    pub enabled: bool,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LocalDestinationConfig {
    pub root_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SftpDestinationConfig {
    pub host: String,
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    pub username: String,
    pub password_id: Option<String>,
    pub private_key_path: Option<String>,
    pub remote_path: String,
}

fn default_sftp_port() -> u16 {
    22
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SmbDestinationConfig {
    pub server: String,
    pub share: String,
    pub domain: Option<String>,
    pub username: String,
    pub password_id: String,
    pub remote_path: String,
}

fn default_webdav_timeout() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebDavDestinationConfig {
    pub url: String,
    pub user: String,
    pub password_id: String,
    #[serde(default = "default_webdav_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShelledMultiCloudConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub provider: String,
}

/// Destination kind + kind-specific configuration (§3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DestinationKind {
    Local(LocalDestinationConfig),
    Sftp(SftpDestinationConfig),
    Smb(SmbDestinationConfig),
    Webdav(WebDavDestinationConfig),
    ShelledMultiCloud(ShelledMultiCloudConfig),
}

impl Default for DestinationKind {
    fn default() -> Self {
        DestinationKind::Local(LocalDestinationConfig::default())
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DestinationKind::Local(_) => "local",
            DestinationKind::Sftp(_) => "sftp",
            DestinationKind::Smb(_) => "smb",
            DestinationKind::Webdav(_) => "webdav",
            DestinationKind::ShelledMultiCloud(_) => "shelled_multi_cloud",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Destination {
    pub id: String,
    #[serde(flatten)]
    pub kind: DestinationKind,
    pub enabled: bool,
}

/// Schedule frequency (§3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "frequency", rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly { weekdays: Vec<chrono::Weekday> },
    Monthly { day_of_month: u32 },
    Startup,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub enabled: bool,
    #[serde(flatten)]
    pub frequency: Frequency,
    /// `HH:MM` in local time; absent for `startup`/`shutdown`.
    pub time_of_day: Option<String>,
    pub sources: Vec<String>,
    pub destination_id: String,
    pub last_run: Option<chrono::DateTime<chrono::Utc>>,
    pub next_run: Option<chrono::DateTime<chrono::Utc>>,
}

/// The full recognized configuration surface (§6.2).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub backup_policy: BackupPolicy,
    #[serde(default)]
    pub sources: HashMap<String, Source>,
    #[serde(default)]
    pub destinations: HashMap<String, Destination>,
    #[serde(default)]
    pub schedules: HashMap<String, Schedule>,
}

impl Config {
    pub fn has_password_id(&self, password_id: &str) -> bool {
        self.destinations.values().any(|dest| match &dest.kind {
            DestinationKind::Sftp(c) => c.password_id.as_deref() == Some(password_id),
            DestinationKind::Smb(c) => c.password_id == password_id,
            DestinationKind::Webdav(c) => c.password_id == password_id,
            _ => false,
        })
    }

    pub fn list_entry_keys(&self) -> Vec<ConfigEntryKey> {
        let mut keys = Vec::new();

        for name in self.sources.keys() {
            keys.push(ConfigEntryKey {
                entry_type: ConfigEntryType::Source,
                name: name.clone(),
            });
        }
        for name in self.destinations.keys() {
            keys.push(ConfigEntryKey {
                entry_type: ConfigEntryType::Destination,
                name: name.clone(),
            });
        }
        for name in self.schedules.keys() {
            keys.push(ConfigEntryKey {
                entry_type: ConfigEntryType::Schedule,
                name: name.clone(),
            });
        }

        keys
    }

    pub fn get_entry_mut(&mut self, key: &ConfigEntryKey) -> Option<ConfigEntryMut<'_>> {
        match key.entry_type {
            ConfigEntryType::Source => {
                self.sources.get_mut(&key.name).map(ConfigEntryMut::Source)
            }
            ConfigEntryType::Destination => self
                .destinations
                .get_mut(&key.name)
                .map(ConfigEntryMut::Destination),
            ConfigEntryType::Schedule => self
                .schedules
                .get_mut(&key.name)
                .map(ConfigEntryMut::Schedule),
        }
    }

    pub fn add_new_entry(&mut self, entry_type: &ConfigEntryType, name: &str) {
        match entry_type {
            ConfigEntryType::Source => {
                self.sources.insert(
                    name.to_string(),
                    Source {
                        name: name.to_string(),
                        ..Default::default()
                    },
                );
            }
            ConfigEntryType::Destination => {
                self.destinations.insert(
                    name.to_string(),
                    Destination {
                        id: name.to_string(),
                        ..Default::default()
                    },
                );
            }
            ConfigEntryType::Schedule => {
                self.schedules.insert(
                    name.to_string(),
                    Schedule {
                        id: name.to_string(),
                        enabled: false,
                        frequency: Frequency::Daily,
                        time_of_day: Some("02:00".to_string()),
                        sources: Vec::new(),
                        destination_id: String::new(),
                        last_run: None,
                        next_run: None,
                    },
                );
            }
        }
    }

    pub fn delete_entry(&mut self, key: &ConfigEntryKey) {
        match key.entry_type {
            ConfigEntryType::Source => {
                self.sources.remove(&key.name);
            }
            ConfigEntryType::Destination => {
                self.destinations.remove(&key.name);
            }
            ConfigEntryType::Schedule => {
                self.schedules.remove(&key.name);
            }
        }
    }
}

/// A starting-point configuration, written by `config example write` and
/// shown by `config example show` (§6.4).
pub const EXAMPLE_CONFIG: &str = r#"
[backup_policy]
# How many backup chains (a full plus its dependent incrementals) to keep
# per destination before rotation deletes the oldest.
max_versions = 3
# Archive segments are split at this many plaintext bytes.
split_size_bytes = 134217728
# AEAD chunk size within a segment.
chunk_size_bytes = 67108864
# none | fast | balanced | best
compression = "fast"
# Re-read every sealed segment after a backup and check its AEAD tags.
verify_after_backup = false

[sources.documents]
name = "documents"
root_path = "/home/user/Documents"
enabled = true
exclude_patterns = ["*.tmp", "**/node_modules/**"]

[destinations.nas]
id = "nas"
kind = "local"
root_path = "/mnt/nas/backups"
enabled = true

[destinations.remote]
id = "remote"
kind = "webdav"
url = "https://example.com/remote.php/dav/user"
user = "user"
# Identifier for password retrieval: scrat password set webdav-pass
password_id = "webdav-pass"
timeout_secs = 3600
verify_tls = true
enabled = true

[schedules.nightly]
id = "nightly"
enabled = true
frequency = "daily"
time_of_day = "02:00"
sources = ["documents"]
destination_id = "nas"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_toml() {
        let mut config = Config::default();
        config.sources.insert(
            "docs".to_string(),
            Source {
                name: "docs".to_string(),
                root_path: "/home/user/Documents".to_string(),
                enabled: true,
                exclude_patterns: vec!["*.tmp".to_string()],
            },
        );
        config.destinations.insert(
            "nas".to_string(),
            Destination {
                id: "nas".to_string(),
                kind: DestinationKind::Local(LocalDestinationConfig {
                    root_path: "/mnt/nas".to_string(),
                }),
                enabled: true,
            },
        );

        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();

        assert_eq!(parsed.sources["docs"].root_path, "/home/user/Documents");
        assert!(matches!(
            parsed.destinations["nas"].kind,
            DestinationKind::Local(_)
        ));
    }

    #[test]
    fn add_and_delete_entry_round_trip() {
        let mut config = Config::default();
        config.add_new_entry(&ConfigEntryType::Source, "photos");
        assert!(config.sources.contains_key("photos"));

        config.delete_entry(&ConfigEntryKey {
            entry_type: ConfigEntryType::Source,
            name: "photos".to_string(),
        });
        assert!(!config.sources.contains_key("photos"));
    }

    #[test]
    fn has_password_id_checks_destinations() {
        let mut config = Config::default();
        config.destinations.insert(
            "webdav1".to_string(),
            Destination {
                id: "webdav1".to_string(),
                kind: DestinationKind::Webdav(WebDavDestinationConfig {
                    url: "https://example.com/dav".to_string(),
                    user: "user".to_string(),
                    password_id: "webdav-pass".to_string(),
                    timeout_secs: 3600,
                    verify_tls: true,
                }),
                enabled: true,
            },
        );

        assert!(config.has_password_id("webdav-pass"));
        assert!(!config.has_password_id("other"));
    }
}
