use std::io::Read;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use ssh2::Session;

use crate::shared::config::SftpDestinationConfig;
use crate::shared::relpath::RelPath;

use super::{Destination, DestinationEntry, DestinationError, DestinationStat};

/// SFTP destination over an SSH2 session, grounded on the corpus's
/// `LocalFS`/`WebDAVFS` shape but backed by `ssh2`'s synchronous `Sftp`
/// handle (no async runtime in this engine, §5).
pub struct SftpDestination {
    config: SftpDestinationConfig,
    password: Option<SecretString>,
    session: Option<Session>,
}

impl SftpDestination {
    pub fn new(config: SftpDestinationConfig, password: Option<SecretString>) -> Self {
        SftpDestination {
            config,
            password,
            session: None,
        }
    }

    fn sftp(&self) -> Result<ssh2::Sftp, DestinationError> {
        let session = self.session.as_ref().ok_or(DestinationError::NotConnected)?;
        session
            .sftp()
            .map_err(|err| DestinationError::ConnectionFailed(Box::new(err)))
    }

    fn remote_path(&self, path: &RelPath) -> PathBuf {
        Path::new(&self.config.remote_path).join(path.to_os_path())
    }

    fn ensure_parents(&self, sftp: &ssh2::Sftp, path: &Path) -> Result<(), DestinationError> {
        let mut current = PathBuf::new();
        for component in path.parent().unwrap_or(Path::new("")).components() {
            current.push(component);
            if sftp.stat(&current).is_err() {
                let _ = sftp.mkdir(&current, 0o755);
            }
        }
        Ok(())
    }
}

impl Destination for SftpDestination {
    fn connect(&mut self) -> Result<(), DestinationError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let tcp = TcpStream::connect(&addr)
            .map_err(|err| DestinationError::ConnectionFailed(Box::new(err)))?;

        let mut session = Session::new()
            .map_err(|err| DestinationError::ConnectionFailed(Box::new(err)))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|err| DestinationError::ConnectionFailed(Box::new(err)))?;

        if let Some(key_path) = &self.config.private_key_path {
            session
                .userauth_pubkey_file(&self.config.username, None, Path::new(key_path), None)
                .map_err(|err| DestinationError::ConnectionFailed(Box::new(err)))?;
        } else if let Some(password) = &self.password {
            session
                .userauth_password(&self.config.username, password.expose_secret())
                .map_err(|err| DestinationError::ConnectionFailed(Box::new(err)))?;
        }

        if !session.authenticated() {
            return Err(DestinationError::ConnectionFailed(
                "SSH authentication failed".into(),
            ));
        }

        self.session = Some(session);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), DestinationError> {
        self.session = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn put_stream(
        &mut self,
        path: &RelPath,
        reader: &mut dyn Read,
        _len_hint: Option<u64>,
    ) -> Result<u64, DestinationError> {
        let sftp = self.sftp()?;
        let remote = self.remote_path(path);
        self.ensure_parents(&sftp, &remote)?;

        let mut file = sftp
            .create(&remote)
            .map_err(|err| DestinationError::PutFailed(path.to_string(), Box::new(err)))?;
        std::io::copy(reader, &mut file)
            .map_err(|err| DestinationError::PutFailed(path.to_string(), Box::new(err)))
    }

    fn get_stream(&mut self, path: &RelPath) -> Result<Box<dyn Read + Send>, DestinationError> {
        let sftp = self.sftp()?;
        let file = sftp
            .open(&self.remote_path(path))
            .map_err(|err| DestinationError::GetFailed(path.to_string(), Box::new(err)))?;
        Ok(Box::new(file))
    }

    fn list(&mut self, dir: &RelPath) -> Result<Vec<DestinationEntry>, DestinationError> {
        let sftp = self.sftp()?;
        let remote_dir = self.remote_path(dir);
        let entries = match sftp.readdir(&remote_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };

        let mut result = Vec::new();
        for (path, stat) in entries {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let rel_os = if dir.as_str().is_empty() {
                PathBuf::from(&name)
            } else {
                dir.to_os_path().join(&name)
            };
            let rel = RelPath::normalize(&rel_os).map_err(|err| {
                DestinationError::ListFailed(
                    dir.to_string(),
                    Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())),
                )
            })?;

            result.push(DestinationEntry {
                path: rel,
                is_dir: stat.is_dir(),
                size: if stat.is_file() { stat.size } else { None },
            });
        }

        Ok(result)
    }

    fn delete(&mut self, path: &RelPath) -> Result<(), DestinationError> {
        let sftp = self.sftp()?;
        let remote = self.remote_path(path);
        let stat = sftp
            .stat(&remote)
            .map_err(|err| DestinationError::DeleteFailed(path.to_string(), Box::new(err)))?;

        if stat.is_dir() {
            sftp.rmdir(&remote)
        } else {
            sftp.unlink(&remote)
        }
        .map_err(|err| DestinationError::DeleteFailed(path.to_string(), Box::new(err)))
    }

    fn stat(&mut self, path: &RelPath) -> Result<DestinationStat, DestinationError> {
        let sftp = self.sftp()?;
        let stat = sftp
            .stat(&self.remote_path(path))
            .map_err(|err| DestinationError::StatFailed(path.to_string(), Box::new(err)))?;

        let modified = stat
            .mtime
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0));

        Ok(DestinationStat {
            size: stat.size.unwrap_or(0),
            modified,
        })
    }

    fn free_space(&mut self) -> Result<Option<u64>, DestinationError> {
        // SFTP has no standard statvfs extension guaranteed by every server.
        Ok(None)
    }
}
