use std::io::Read;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::cryptor::{SegmentDecryptor, SegmentEncryptor, random_salt};
use crate::shared::config::Compression;

/// Encrypted JSON document written once per backup alongside its archives
/// (§3 `Manifest`, §6.1). Duplicates enough of the catalog for disaster
/// recovery without the local metadata store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub backup_id: String,
    pub kind: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub base_backup_id: Option<String>,
    pub format_version: u32,
    pub sources: Vec<ManifestSource>,
    pub archives: Vec<ManifestArchive>,
    pub stats: ManifestStats,
    pub verifier: String,
    /// Compression mode these archives were stored with (§4.3) — restore
    /// needs this to undo it before the archive codec can parse a segment.
    pub compression: Compression,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestSource {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestArchive {
    pub ordinal: u32,
    pub name: String,
    pub stored_size: u64,
    pub iv_seed: String,
    pub files_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ManifestStats {
    pub files_total: u64,
    pub size_original: u64,
    pub size_stored: u64,
    pub duration_seconds: u64,
}

pub const MANIFEST_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed manifest JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Cryptor(#[from] crate::core::cryptor::CryptorError),
}

/// Encrypts a manifest's JSON bytes into the same chunked AEAD envelope
/// used for archive segments (§4.2), for storage as `manifest.json.enc`.
/// The manifest is small, so a single chunk covers the whole document.
pub fn encrypt_manifest(manifest: &Manifest, key: [u8; 32]) -> Result<Vec<u8>, ManifestError> {
    let json = serde_json::to_vec(manifest)?;
    let mut encryptor = SegmentEncryptor::new(
        std::io::Cursor::new(json),
        key,
        random_salt(),
        crate::core::cryptor::DEFAULT_CHUNK_SIZE,
    );
    let mut sealed = Vec::new();
    encryptor.read_to_end(&mut sealed)?;
    Ok(sealed)
}

/// Decrypts and parses a `manifest.json.enc` blob.
pub fn decrypt_manifest(sealed: &[u8], key: [u8; 32]) -> Result<Manifest, ManifestError> {
    let mut decryptor = SegmentDecryptor::new(std::io::Cursor::new(sealed), key);
    let mut json = Vec::new();
    decryptor.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn sample_manifest() -> Manifest {
        Manifest {
            backup_id: "20260101_000000_full".to_string(),
            kind: "full".to_string(),
            timestamp: chrono::Utc::now(),
            base_backup_id: None,
            format_version: MANIFEST_FORMAT_VERSION,
            sources: vec![ManifestSource {
                name: "docs".to_string(),
                path: "/home/user/Documents".to_string(),
            }],
            archives: vec![ManifestArchive {
                ordinal: 1,
                name: "data.001.scrat".to_string(),
                stored_size: 1024,
                iv_seed: "abc123".to_string(),
                files_count: 3,
            }],
            stats: ManifestStats {
                files_total: 3,
                size_original: 2048,
                size_stored: 1024,
                duration_seconds: 12,
            },
            verifier: "deadbeef".to_string(),
            compression: Compression::Fast,
        }
    }

    #[test]
    fn round_trips_through_encryption() {
        let key = crate::core::cryptor::derive_key(
            &SecretString::new("correct-horse-battery-staple".into()),
            &[3u8; 32],
        );
        let manifest = sample_manifest();

        let sealed = encrypt_manifest(&manifest, key).unwrap();
        let recovered = decrypt_manifest(&sealed, key).unwrap();

        assert_eq!(recovered, manifest);
    }

    #[test]
    fn decrypting_with_wrong_key_fails() {
        let key = crate::core::cryptor::derive_key(
            &SecretString::new("correct-horse-battery-staple".into()),
            &[3u8; 32],
        );
        let other_key = crate::core::cryptor::derive_key(
            &SecretString::new("wrong".into()),
            &[3u8; 32],
        );
        let sealed = encrypt_manifest(&sample_manifest(), key).unwrap();

        assert!(decrypt_manifest(&sealed, other_key).is_err());
    }
}
