mod local;
mod sftp;
mod shelled;
mod smb;
mod webdav;

pub use local::LocalDestination;
pub use sftp::SftpDestination;
pub use shelled::ShelledDestination;
pub use smb::SmbDestination;
pub use webdav::WebDavDestination;

use std::error::Error as StdError;
use std::io::Read;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::shared::relpath::RelPath;

/// Errors raised by a [`Destination`] implementation (§4.1, §7).
#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("failed to connect: {0}")]
    ConnectionFailed(#[source] Box<dyn StdError + Send + Sync>),

    #[error("not connected")]
    NotConnected,

    #[error("operation not supported by this destination")]
    NotSupported,

    #[error("failed to stat {0}: {1}")]
    StatFailed(String, #[source] Box<dyn StdError + Send + Sync>),

    #[error("failed to list {0}: {1}")]
    ListFailed(String, #[source] Box<dyn StdError + Send + Sync>),

    #[error("failed to delete {0}: {1}")]
    DeleteFailed(String, #[source] Box<dyn StdError + Send + Sync>),

    #[error("failed to write {0}: {1}")]
    PutFailed(String, #[source] Box<dyn StdError + Send + Sync>),

    #[error("failed to read {0}: {1}")]
    GetFailed(String, #[source] Box<dyn StdError + Send + Sync>),

    #[error("not found: {0}")]
    NotFound(String),
}

/// A single entry returned by [`Destination::list`].
#[derive(Debug, Clone)]
pub struct DestinationEntry {
    pub path: RelPath,
    pub is_dir: bool,
    pub size: Option<u64>,
}

/// Metadata about one object, returned by [`Destination::stat`].
#[derive(Debug, Clone)]
pub struct DestinationStat {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Polymorphic storage backend (§4.1). All reads and writes are streaming —
/// implementations MUST NOT buffer a whole archive segment into memory, and
/// the engine never assumes a destination handle is safe to share across
/// threads (§5: one connection per run).
pub trait Destination: Send {
    /// Establishes whatever session/handshake the backend needs.
    fn connect(&mut self) -> Result<(), DestinationError>;

    /// Tears the session down. Idempotent.
    fn disconnect(&mut self) -> Result<(), DestinationError>;

    fn is_connected(&self) -> bool;

    /// Streams `reader` to `path`, creating parent directories as needed.
    /// `len_hint`, when known, lets backends that need a `Content-Length`
    /// (WebDAV) or progress reporting avoid buffering to find it.
    fn put_stream(
        &mut self,
        path: &RelPath,
        reader: &mut dyn Read,
        len_hint: Option<u64>,
    ) -> Result<u64, DestinationError>;

    /// Opens `path` for streaming, lazy read — implementations must not
    /// read the whole object before returning.
    fn get_stream(&mut self, path: &RelPath) -> Result<Box<dyn Read + Send>, DestinationError>;

    /// Lists immediate children of `dir` (non-recursive).
    fn list(&mut self, dir: &RelPath) -> Result<Vec<DestinationEntry>, DestinationError>;

    fn delete(&mut self, path: &RelPath) -> Result<(), DestinationError>;

    /// Recursively deletes `dir` and everything under it. The default
    /// implementation walks [`list`] depth-first; backends with a native
    /// recursive delete should override it.
    fn delete_tree(&mut self, dir: &RelPath) -> Result<(), DestinationError> {
        for entry in self.list(dir)? {
            if entry.is_dir {
                self.delete_tree(&entry.path)?;
            } else {
                self.delete(&entry.path)?;
            }
        }
        self.delete(dir)
    }

    /// Whether this backend stages a segment to local disk before
    /// uploading it, rather than streaming bytes to the remote as they're
    /// produced (§4.1). WebDAV and shelled multi-cloud stage; local, SFTP,
    /// and SMB stream. A caller retrying a failed `put_stream` needs this
    /// to know whether it may buffer the segment for the retry or must
    /// instead restart against a fresh reader.
    fn stages_locally(&self) -> bool {
        false
    }

    fn stat(&mut self, path: &RelPath) -> Result<DestinationStat, DestinationError>;

    /// Remaining free space at the destination root, when the backend can
    /// report one. Destinations with no native quota concept (most object
    /// stores) return `None`; the engine then proceeds optimistically and
    /// lets a write failure surface as [`DestinationError::PutFailed`]
    /// (§9 Open Questions).
    fn free_space(&mut self) -> Result<Option<u64>, DestinationError>;

    /// Exercises connect/disconnect as a connectivity check, used by the
    /// "test connection" command surface (§6.4). The default round-trips
    /// the connection; backends with a cheaper health check may override.
    fn test(&mut self) -> Result<(), DestinationError> {
        self.connect()?;
        self.disconnect()
    }
}
