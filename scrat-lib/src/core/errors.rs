use thiserror::Error;

/// The error taxonomy of §7, rolled up into one type so the engine's
/// command surface (§6.4) can map any failure to an exit/result code.
#[derive(Debug, Error)]
pub enum ScratError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("passphrase error: {0}")]
    Passphrase(String),

    #[error("destination error: {0}")]
    Destination(#[from] crate::core::destination::DestinationError),

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ScratError {
    /// The exit/result code discriminant of §6.4.
    pub fn code(&self) -> &'static str {
        match self {
            ScratError::Validation(_) => "validation_error",
            ScratError::Passphrase(_) => "passphrase_error",
            ScratError::Destination(_) => "destination_error",
            ScratError::TransientIo(_) => "io_error",
            ScratError::Source(_) => "io_error",
            ScratError::Integrity(_) => "io_error",
            ScratError::Cancelled => "cancelled",
            ScratError::Internal(_) => "internal_error",
        }
    }
}

impl From<crate::core::cryptor::CryptorError> for ScratError {
    fn from(err: crate::core::cryptor::CryptorError) -> Self {
        match err {
            crate::core::cryptor::CryptorError::VerifierMismatch => {
                ScratError::Passphrase(err.to_string())
            }
            crate::core::cryptor::CryptorError::TagFailure
            | crate::core::cryptor::CryptorError::MalformedEnvelope(_) => {
                ScratError::Integrity(err.to_string())
            }
            _ => ScratError::Internal(err.to_string()),
        }
    }
}

impl From<crate::core::metadata_store::MetadataError> for ScratError {
    fn from(err: crate::core::metadata_store::MetadataError) -> Self {
        ScratError::Internal(err.to_string())
    }
}

impl From<crate::core::manifest::ManifestError> for ScratError {
    fn from(err: crate::core::manifest::ManifestError) -> Self {
        match err {
            crate::core::manifest::ManifestError::Cryptor(cryptor_err) => cryptor_err.into(),
            other => ScratError::Integrity(other.to_string()),
        }
    }
}

impl From<crate::core::scanner::ScannerError> for ScratError {
    fn from(err: crate::core::scanner::ScannerError) -> Self {
        ScratError::Source(err.to_string())
    }
}

impl From<crate::core::keyring::KeyringError> for ScratError {
    fn from(err: crate::core::keyring::KeyringError) -> Self {
        ScratError::Internal(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ArchiverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed archive stream: {0}")]
    Malformed(String),
}
