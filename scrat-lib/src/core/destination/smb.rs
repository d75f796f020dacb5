use std::io::{Cursor, Read, Write};
use std::process::{Command, Stdio};

use secrecy::{ExposeSecret, SecretString};

use crate::shared::config::SmbDestinationConfig;
use crate::shared::relpath::RelPath;

use super::{Destination, DestinationEntry, DestinationError, DestinationStat};

/// SMB destination backed by the `smbclient` CLI. No mature synchronous
/// native SMB crate exists in the ecosystem at the stack's pinned versions,
/// so this shells out the way the corpus's `shelled_multi_cloud` variant
/// shells out to a child process rather than linking a protocol
/// implementation directly (SPEC_FULL §13).
pub struct SmbDestination {
    config: SmbDestinationConfig,
    password: Option<SecretString>,
    connected: bool,
}

impl SmbDestination {
    pub fn new(config: SmbDestinationConfig, password: Option<SecretString>) -> Self {
        SmbDestination {
            config,
            password,
            connected: false,
        }
    }

    fn share_url(&self) -> String {
        format!("//{}/{}", self.config.server, self.config.share)
    }

    fn run(&self, commands: &str) -> Result<String, DestinationError> {
        let mut cmd = Command::new("smbclient");
        cmd.arg(self.share_url());
        cmd.arg("-c").arg(commands);
        cmd.arg("-U").arg(format!(
            "{}{}",
            self.password
                .as_ref()
                .map(|_| format!("{}", self.config.username))
                .unwrap_or_else(|| self.config.username.clone()),
            self.password
                .as_ref()
                .map(|pw| format!("%{}", pw.expose_secret()))
                .unwrap_or_default()
        ));
        if let Some(domain) = &self.config.domain {
            cmd.arg("-W").arg(domain);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd
            .output()
            .map_err(|err| DestinationError::ConnectionFailed(Box::new(err)))?;

        if !output.status.success() {
            return Err(DestinationError::ConnectionFailed(
                format!(
                    "smbclient exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                )
                .into(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn remote_path(&self, path: &RelPath) -> String {
        let joined = if self.config.remote_path.is_empty() {
            path.as_str().to_string()
        } else {
            format!("{}/{}", self.config.remote_path.trim_end_matches('/'), path.as_str())
        };
        joined.replace('/', "\\")
    }
}

impl Destination for SmbDestination {
    fn connect(&mut self) -> Result<(), DestinationError> {
        self.run("ls")?;
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

        // smbclient has no stdin-streaming "put", so stage the segment to a
        // local temp file first (same staging idiom as the WebDAV variant).
        let mut tmp = tempfile::NamedTempFile::new()
            .map_err(|err| DestinationError::PutFailed(path.to_string(), Box::new(err)))?;
        let written = std::io::copy(reader, &mut tmp)
            .map_err(|err| DestinationError::PutFailed(path.to_string(), Box::new(err)))?;
        tmp.flush()
            .map_err(|err| DestinationError::PutFailed(path.to_string(), Box::new(err)))?;

        let remote = self.remote_path(path);
        let local = tmp.path().to_string_lossy().into_owned();
        self.run(&format!("put \"{local}\" \"{remote}\""))?;
        Ok(written)
    }

    fn get_stream(&mut self, path: &RelPath) -> Result<Box<dyn Read + Send>, DestinationError> {
        if !self.connected {
            return Err(DestinationError::NotConnected);
        }

        let tmp = tempfile::NamedTempFile::new()
            .map_err(|err| DestinationError::GetFailed(path.to_string(), Box::new(err)))?;
        let local = tmp.path().to_string_lossy().into_owned();
        let remote = self.remote_path(path);
        self.run(&format!("get \"{remote}\" \"{local}\""))?;

        let mut bytes = Vec::new();
        std::fs::File::open(tmp.path())
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|err| DestinationError::GetFailed(path.to_string(), Box::new(err)))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn list(&mut self, dir: &RelPath) -> Result<Vec<DestinationEntry>, DestinationError> {
        if !self.connected {
            return Err(DestinationError::NotConnected);
        }

        let remote = self.remote_path(dir);
        let output = self.run(&format!("cd \"{remote}\"; ls"))?;

        let mut result = Vec::new();
        for line in output.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('.') {
                continue;
            }
            let mut parts = trimmed.split_whitespace();
            let Some(name) = parts.next() else { continue };
            let is_dir = trimmed.contains("   D ") || trimmed.contains("\tD\t");
            let rel_str = if dir.as_str().is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", dir.as_str(), name)
            };
            result.push(DestinationEntry {
                path: RelPath::from_normalized(rel_str),
                is_dir,
                size: None,
            });
        }

        Ok(result)
    }

    fn delete(&mut self, path: &RelPath) -> Result<(), DestinationError> {
        if !self.connected {
            return Err(DestinationError::NotConnected);
        }
        let remote = self.remote_path(path);
        self.run(&format!("del \"{remote}\""))?;
        Ok(())
    }

    fn stat(&mut self, path: &RelPath) -> Result<DestinationStat, DestinationError> {
        if !self.connected {
            return Err(DestinationError::NotConnected);
        }
        let remote = self.remote_path(path);
        let output = self.run(&format!("allinfo \"{remote}\""))?;
        let size = output
            .lines()
            .find_map(|line| line.strip_prefix("size: "))
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);

        Ok(DestinationStat {
            size,
            modified: None,
        })
    }

    fn free_space(&mut self) -> Result<Option<u64>, DestinationError> {
        Ok(None)
    }
}
