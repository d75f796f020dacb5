use std::io::Read;
use std::process::{Command, Stdio};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::shared::config::ShelledMultiCloudConfig;
use crate::shared::relpath::RelPath;

use super::{Destination, DestinationEntry, DestinationError, DestinationStat};

/// Drives a child process acting as a multi-provider object mover through a
/// small RPC surface (§4.1): `put`/`get`/`list`/`delete`/`stat` subcommands,
/// each invoked fresh with the destination's fixed `args` plus the op and
/// its operands, `provider` passed via environment. Grounded on the
/// corpus's shell-out idiom (see `SmbDestination`), generalized from one
/// fixed CLI to an arbitrary configured command.
///
/// The engine can't stream bytes through an arbitrary child process
/// invocation the way it can through a socket, so `put_stream`/`get_stream`
/// stage through a local temp file (§4.1 "stages the archive locally and
/// uploads after the archive is sealed").
pub struct ShelledDestination {
    config: ShelledMultiCloudConfig,
    connected: bool,
}

#[derive(Debug, Deserialize)]
struct ShelledListEntry {
    name: String,
    is_dir: bool,
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ShelledStat {
    size: u64,
    modified: Option<DateTime<Utc>>,
}

impl ShelledDestination {
    pub fn new(config: ShelledMultiCloudConfig) -> Self {
        ShelledDestination {
            config,
            connected: false,
        }
    }

    fn run(&self, op: &str, operands: &[&str]) -> Result<String, DestinationError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        cmd.arg(op);
        cmd.args(operands);
        cmd.env("SCRAT_PROVIDER", &self.config.provider);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd
            .output()
            .map_err(|err| DestinationError::ConnectionFailed(Box::new(err)))?;

        if !output.status.success() {
            return Err(DestinationError::ConnectionFailed(
                format!(
                    "{} {op} exited with {}: {}",
                    self.config.command,
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                )
                .into(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Destination for ShelledDestination {
    fn connect(&mut self) -> Result<(), DestinationError> {
        self.run("ping", &[])?;
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), DestinationError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn put_stream(
        &mut self,
        path: &RelPath,
        reader: &mut dyn Read,
        _len_hint: Option<u64>,
    ) -> Result<u64, DestinationError> {
        if !self.connected {
            return Err(DestinationError::NotConnected);
        }

        let mut tmp = tempfile::NamedTempFile::new()
            .map_err(|err| DestinationError::PutFailed(path.to_string(), Box::new(err)))?;
        let written = std::io::copy(reader, &mut tmp)
            .map_err(|err| DestinationError::PutFailed(path.to_string(), Box::new(err)))?;

        let local = tmp.path().to_string_lossy().into_owned();
        self.run("put", &[&local, path.as_str()])
            .map_err(|err| DestinationError::PutFailed(path.to_string(), Box::new(err)))?;
        Ok(written)
    }

    fn get_stream(&mut self, path: &RelPath) -> Result<Box<dyn Read + Send>, DestinationError> {
        if !self.connected {
            return Err(DestinationError::NotConnected);
        }

        let tmp = tempfile::NamedTempFile::new()
            .map_err(|err| DestinationError::GetFailed(path.to_string(), Box::new(err)))?;
        let local = tmp.path().to_string_lossy().into_owned();
        self.run("get", &[path.as_str(), &local])
            .map_err(|err| DestinationError::GetFailed(path.to_string(), Box::new(err)))?;

        let mut bytes = Vec::new();
        std::fs::File::open(tmp.path())
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|err| DestinationError::GetFailed(path.to_string(), Box::new(err)))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    fn list(&mut self, dir: &RelPath) -> Result<Vec<DestinationEntry>, DestinationError> {
        if !self.connected {
            return Err(DestinationError::NotConnected);
        }

        let output = self
            .run("list", &[dir.as_str()])
            .map_err(|err| DestinationError::ListFailed(dir.to_string(), Box::new(err)))?;

        let mut entries = Vec::new();
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let entry: ShelledListEntry = serde_json::from_str(line).map_err(|err| {
                DestinationError::ListFailed(dir.to_string(), Box::new(err))
            })?;
            let rel = if dir.as_str().is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", dir.as_str(), entry.name)
            };
            entries.push(DestinationEntry {
                path: RelPath::from_normalized(rel),
                is_dir: entry.is_dir,
                size: entry.size,
            });
        }

        Ok(entries)
    }

    fn delete(&mut self, path: &RelPath) -> Result<(), DestinationError> {
        if !self.connected {
            return Err(DestinationError::NotConnected);
        }
        self.run("delete", &[path.as_str()])
            .map_err(|err| DestinationError::DeleteFailed(path.to_string(), Box::new(err)))?;
        Ok(())
    }

    fn stat(&mut self, path: &RelPath) -> Result<DestinationStat, DestinationError> {
        if !self.connected {
            return Err(DestinationError::NotConnected);
        }

        let output = self
            .run("stat", &[path.as_str()])
            .map_err(|err| DestinationError::StatFailed(path.to_string(), Box::new(err)))?;
        let stat: ShelledStat = serde_json::from_str(output.trim())
            .map_err(|err| DestinationError::StatFailed(path.to_string(), Box::new(err)))?;

        Ok(DestinationStat {
            size: stat.size,
            modified: stat.modified,
        })
    }

    fn free_space(&mut self) -> Result<Option<u64>, DestinationError> {
        Ok(None)
    }

    fn stages_locally(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_parses_jsonl_output_into_entries() {
        let output = "{\"name\":\"data.001.scrat\",\"is_dir\":false,\"size\":1024}\n{\"name\":\"sub\",\"is_dir\":true,\"size\":null}\n";
        let mut entries = Vec::new();
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let entry: ShelledListEntry = serde_json::from_str(line).unwrap();
            entries.push(entry);
        }
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "data.001.scrat");
        assert!(entries[1].is_dir);
    }

    #[test]
    fn stat_parses_json_output() {
        let output = "{\"size\":2048,\"modified\":null}";
        let stat: ShelledStat = serde_json::from_str(output).unwrap();
        assert_eq!(stat.size, 2048);
        assert!(stat.modified.is_none());
    }
}
