use std::fs;
use std::io::Read;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::shared::relpath::RelPath;

use super::{Destination, DestinationEntry, DestinationError, DestinationStat};

/// Stores archives directly on a local (or locally-mounted) filesystem,
/// grounded on the corpus's `LocalFS` — writes go straight through rather
/// than staging, since there is no network round trip to amortize.
pub struct LocalDestination {
    root: PathBuf,
    connected: bool,
}

impl LocalDestination {
    pub fn new(root: PathBuf) -> Self {
        LocalDestination {
            root,
            connected: false,
        }
    }

    fn abs(&self, path: &RelPath) -> PathBuf {
        self.root.join(path.to_os_path())
    }

    fn io_err(context: &str, err: std::io::Error) -> DestinationError {
        match err.kind() {
            std::io::ErrorKind::NotFound => DestinationError::NotFound(context.to_string()),
            _ => DestinationError::PutFailed(context.to_string(), Box::new(err)),
        }
    }
}

impl Destination for LocalDestination {
    fn connect(&mut self) -> Result<(), DestinationError> {
        fs::create_dir_all(&self.root)
            .map_err(|err| DestinationError::ConnectionFailed(Box::new(err)))?;
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

        let abs_path = self.abs(path);
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| DestinationError::PutFailed(path.to_string(), Box::new(err)))?;
        }

        let mut file = fs::File::create(&abs_path)
            .map_err(|err| DestinationError::PutFailed(path.to_string(), Box::new(err)))?;
        std::io::copy(reader, &mut file)
            .map_err(|err| DestinationError::PutFailed(path.to_string(), Box::new(err)))
    }

    fn get_stream(&mut self, path: &RelPath) -> Result<Box<dyn Read + Send>, DestinationError> {
        if !self.connected {
            return Err(DestinationError::NotConnected);
        }

        let file = fs::File::open(self.abs(path))
            .map_err(|err| Self::io_err(&path.to_string(), err))?;
        Ok(Box::new(file))
    }

    fn list(&mut self, dir: &RelPath) -> Result<Vec<DestinationEntry>, DestinationError> {
        if !self.connected {
            return Err(DestinationError::NotConnected);
        }

        let abs_dir = self.abs(dir);
        let entries = match fs::read_dir(&abs_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(DestinationError::ListFailed(dir.to_string(), Box::new(err))),
        };

        let mut result = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                DestinationError::ListFailed(dir.to_string(), Box::new(err))
            })?;
            let metadata = entry.metadata().map_err(|err| {
                DestinationError::ListFailed(dir.to_string(), Box::new(err))
            })?;
            let rel = if dir.as_str().is_empty() {
                RelPath::normalize(std::path::Path::new(&entry.file_name()))
            } else {
                RelPath::normalize(&PathBuf::from(dir.to_os_path()).join(entry.file_name()))
            }
            .map_err(|err| {
                DestinationError::ListFailed(dir.to_string(), Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())))
            })?;

            result.push(DestinationEntry {
                path: rel,
                is_dir: metadata.is_dir(),
                size: if metadata.is_file() {
                    Some(metadata.len())
                } else {
                    None
                },
            });
        }

        Ok(result)
    }

    fn delete(&mut self, path: &RelPath) -> Result<(), DestinationError> {
        if !self.connected {
            return Err(DestinationError::NotConnected);
        }

        let abs_path = self.abs(path);
        let metadata = fs::symlink_metadata(&abs_path)
            .map_err(|err| DestinationError::DeleteFailed(path.to_string(), Box::new(err)))?;

        if metadata.is_dir() {
            fs::remove_dir(&abs_path)
        } else {
            fs::remove_file(&abs_path)
        }
        .map_err(|err| DestinationError::DeleteFailed(path.to_string(), Box::new(err)))
    }

    fn stat(&mut self, path: &RelPath) -> Result<DestinationStat, DestinationError> {
        if !self.connected {
            return Err(DestinationError::NotConnected);
        }

        let metadata = fs::metadata(self.abs(path))
            .map_err(|err| DestinationError::StatFailed(path.to_string(), Box::new(err)))?;
        let modified: Option<DateTime<Utc>> = metadata.modified().ok().map(DateTime::<Utc>::from);

        Ok(DestinationStat {
            size: metadata.len(),
            modified,
        })
    }

    fn free_space(&mut self) -> Result<Option<u64>, DestinationError> {
        // No portable stdlib API for free disk space; local destinations
        // report unknown and let a write failure surface the real limit.
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn writes_reads_lists_and_deletes_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dest = LocalDestination::new(tmp.path().to_path_buf());
        dest.connect().unwrap();

        let path = RelPath::from_normalized("archives/seg-0001.bin");
        let mut content = Cursor::new(b"segment bytes".to_vec());
        let written = dest.put_stream(&path, &mut content, None).unwrap();
        assert_eq!(written, 13);

        let stat = dest.stat(&path).unwrap();
        assert_eq!(stat.size, 13);

        let mut readback = Vec::new();
        dest.get_stream(&path)
            .unwrap()
            .read_to_end(&mut readback)
            .unwrap();
        assert_eq!(readback, b"segment bytes");

        let listed = dest.list(&RelPath::from_normalized("archives")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path.as_str(), "archives/seg-0001.bin");

        dest.delete(&path).unwrap();
        assert!(dest.list(&RelPath::from_normalized("archives")).unwrap().is_empty());
    }

    #[test]
    fn free_space_is_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dest = LocalDestination::new(tmp.path().to_path_buf());
        dest.connect().unwrap();
        assert_eq!(dest.free_space().unwrap(), None);
    }
}
