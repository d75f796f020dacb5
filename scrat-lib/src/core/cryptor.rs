use std::io::{self, Read};

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use hmac::Hmac;
use rand::{RngCore, rng};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

/// Magic bytes identifying the chunked envelope (§4.2). Any other leading
/// bytes are treated as the legacy single-shot layout.
pub const MAGIC: &[u8; 8] = b"SCRAT001";
pub const SALT_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024 * 1024;
pub const PBKDF2_ITERATIONS: u32 = 100_000;

const VERIFIER_PLAINTEXT: &[u8] = b"scrat-passphrase-verifier-v1";
const VERIFIER_AAD: &[u8] = b"verifier";
const VERIFIER_NONCE: [u8; NONCE_LEN] = [0u8; NONCE_LEN];
const TRAILER_AAD: &[u8] = b"end";

#[derive(Debug, Error)]
pub enum CryptorError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("authentication tag verification failed")]
    TagFailure,
    #[error("passphrase verifier mismatch")]
    VerifierMismatch,
}

/// Derives the 256-bit master key from a passphrase and a per-backup salt
/// using PBKDF2-HMAC-SHA256 at `PBKDF2_ITERATIONS` rounds (§4.2).
pub fn derive_key(passphrase: &SecretString, salt: &[u8; SALT_LEN]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(
        passphrase.expose_secret().as_bytes(),
        salt,
        PBKDF2_ITERATIONS,
        &mut key,
    )
    .expect("32-byte output is within pbkdf2's supported range");
    key
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String never fails");
    }
    out
}

pub(crate) fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

/// Derives a verifier value from the master key: a constant-input AEAD
/// encryption that lets a later run confirm a passphrase without ever
/// storing it (§4.2, glossary "Verifier").
pub fn derive_verifier(key: &[u8; 32]) -> String {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let tag = cipher
        .encrypt(
            Nonce::from_slice(&VERIFIER_NONCE),
            Payload {
                msg: VERIFIER_PLAINTEXT,
                aad: VERIFIER_AAD,
            },
        )
        .expect("encrypting a fixed short plaintext cannot fail");
    hex_encode(&tag)
}

/// Checks `key` against a stored verifier without decrypting any archive.
pub fn verify_passphrase(key: &[u8; 32], verifier_hex: &str) -> bool {
    derive_verifier(key) == verifier_hex
}

fn encrypt_chunk(cipher: &Aes256Gcm, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Vec<u8> {
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: &[],
            },
        )
        .expect("encryption with a fresh nonce cannot fail")
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rng().fill_bytes(&mut nonce);
    nonce
}

/// Wraps a plaintext reader, producing the chunked AEAD envelope of §4.2 as
/// bytes are read. Used as the last stage before handing the stream to a
/// destination's `put_stream` (never buffers more than one chunk).
pub struct SegmentEncryptor<R: Read> {
    reader: R,
    cipher: Aes256Gcm,
    chunk_size: usize,
    salt: [u8; SALT_LEN],
    header_emitted: bool,
    finished: bool,
    out: Vec<u8>,
    out_pos: usize,
}

impl<R: Read> SegmentEncryptor<R> {
    pub fn new(reader: R, key: [u8; 32], salt: [u8; SALT_LEN], chunk_size: u32) -> Self {
        let key_ref = Key::<Aes256Gcm>::from_slice(&key);
        SegmentEncryptor {
            reader,
            cipher: Aes256Gcm::new(key_ref),
            chunk_size: chunk_size as usize,
            salt,
            header_emitted: false,
            finished: false,
            out: Vec::new(),
            out_pos: 0,
        }
    }

    fn fill_header(&mut self) {
        let mut header = Vec::with_capacity(8 + SALT_LEN + 4);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&self.salt);
        header.extend_from_slice(&(self.chunk_size as u32).to_le_bytes());
        self.out = header;
        self.out_pos = 0;
        self.header_emitted = true;
    }

    fn fill_next_frame(&mut self) -> io::Result<()> {
        let mut plaintext = vec![0u8; self.chunk_size];
        let mut read_total = 0;
        while read_total < self.chunk_size {
            let n = self.reader.read(&mut plaintext[read_total..])?;
            if n == 0 {
                break;
            }
            read_total += n;
        }
        plaintext.truncate(read_total);

        if read_total == 0 {
            let nonce = random_nonce();
            let tag = self
                .cipher
                .encrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &[],
                        aad: TRAILER_AAD,
                    },
                )
                .expect("encrypting an empty trailer plaintext cannot fail");

            let mut frame = Vec::with_capacity(NONCE_LEN + 4 + TAG_LEN);
            frame.extend_from_slice(&nonce);
            frame.extend_from_slice(&0u32.to_le_bytes());
            frame.extend_from_slice(&tag);
            self.out = frame;
            self.out_pos = 0;
            self.finished = true;
            return Ok(());
        }

        let nonce = random_nonce();
        let sealed = encrypt_chunk(&self.cipher, &nonce, &plaintext);
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut frame = Vec::with_capacity(NONCE_LEN + 4 + ciphertext.len() + TAG_LEN);
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&(ciphertext.len() as u32).to_le_bytes());
        frame.extend_from_slice(ciphertext);
        frame.extend_from_slice(tag);
        self.out = frame;
        self.out_pos = 0;
        Ok(())
    }
}

impl<R: Read> Read for SegmentEncryptor<R> {
    fn read(&mut self, into: &mut [u8]) -> io::Result<usize> {
        if self.out_pos >= self.out.len() {
            if !self.header_emitted {
                self.fill_header();
            } else if self.finished {
                return Ok(0);
            } else {
                self.fill_next_frame()?;
            }
        }

        let available = self.out.len() - self.out_pos;
        let to_copy = available.min(into.len());
        into[..to_copy].copy_from_slice(&self.out[self.out_pos..self.out_pos + to_copy]);
        self.out_pos += to_copy;
        Ok(to_copy)
    }
}

fn read_exact_or_none(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut read_total = 0;
    while read_total < buf.len() {
        let n = reader.read(&mut buf[read_total..])?;
        if n == 0 {
            break;
        }
        read_total += n;
    }
    if read_total == 0 {
        Ok(false)
    } else if read_total == buf.len() {
        Ok(true)
    } else {
        Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated envelope",
        ))
    }
}

enum DecryptorMode {
    Chunked,
    Legacy,
}

/// Decrypts a segment produced by [`SegmentEncryptor`], or accepts the
/// legacy single-shot `[salt|iv|ciphertext|tag]` layout for backward
/// compatibility (§4.2, §9).
pub struct SegmentDecryptor<R: Read> {
    reader: R,
    key: [u8; 32],
    cipher: Option<Aes256Gcm>,
    mode: Option<DecryptorMode>,
    chunk_size: usize,
    out: Vec<u8>,
    out_pos: usize,
    done: bool,
}

impl<R: Read> SegmentDecryptor<R> {
    pub fn new(reader: R, key: [u8; 32]) -> Self {
        SegmentDecryptor {
            reader,
            key,
            cipher: None,
            mode: None,
            chunk_size: 0,
            out: Vec::new(),
            out_pos: 0,
            done: false,
        }
    }

    fn init(&mut self) -> Result<(), CryptorError> {
        let mut magic_or_salt = [0u8; 8];
        if !read_exact_or_none(&mut self.reader, &mut magic_or_salt)? {
            self.done = true;
            return Ok(());
        }

        if &magic_or_salt == MAGIC {
            let mut salt = [0u8; SALT_LEN];
            self.reader.read_exact(&mut salt)?;
            let mut chunk_size_bytes = [0u8; 4];
            self.reader.read_exact(&mut chunk_size_bytes)?;
            self.chunk_size = u32::from_le_bytes(chunk_size_bytes) as usize;
            self.cipher = Some(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key)));
            self.mode = Some(DecryptorMode::Chunked);
        } else {
            // Legacy single-shot layout: buffer the rest of the stream.
            let mut rest = Vec::new();
            self.reader.read_to_end(&mut rest)?;
            let mut blob = Vec::with_capacity(8 + rest.len());
            blob.extend_from_slice(&magic_or_salt);
            blob.extend_from_slice(&rest);

            if blob.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
                return Err(CryptorError::MalformedEnvelope(
                    "legacy envelope too short".to_string(),
                ));
            }

            let (_salt, rest) = blob.split_at(SALT_LEN);
            let (nonce, rest) = rest.split_at(NONCE_LEN);
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
            let plaintext = cipher
                .decrypt(
                    Nonce::from_slice(nonce),
                    Payload {
                        msg: rest,
                        aad: &[],
                    },
                )
                .map_err(|_| CryptorError::TagFailure)?;

            self.out = plaintext;
            self.out_pos = 0;
            self.mode = Some(DecryptorMode::Legacy);
            self.done = true;
        }

        Ok(())
    }

    fn fill_next_chunked_frame(&mut self) -> Result<(), CryptorError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.reader.read_exact(&mut nonce)?;
        let mut len_bytes = [0u8; 4];
        self.reader.read_exact(&mut len_bytes)?;
        let ciphertext_len = u32::from_le_bytes(len_bytes) as usize;

        if ciphertext_len == 0 {
            let mut tag = [0u8; TAG_LEN];
            self.reader.read_exact(&mut tag)?;
            let cipher = self.cipher.as_ref().unwrap();
            cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &tag,
                        aad: TRAILER_AAD,
                    },
                )
                .map_err(|_| CryptorError::TagFailure)?;
            self.out.clear();
            self.out_pos = 0;
            self.done = true;
            return Ok(());
        }

        let mut body = vec![0u8; ciphertext_len + TAG_LEN];
        self.reader.read_exact(&mut body)?;

        let cipher = self.cipher.as_ref().unwrap();
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &body,
                    aad: &[],
                },
            )
            .map_err(|_| CryptorError::TagFailure)?;

        self.out = plaintext;
        self.out_pos = 0;
        Ok(())
    }
}

impl<R: Read> Read for SegmentDecryptor<R> {
    fn read(&mut self, into: &mut [u8]) -> io::Result<usize> {
        if self.mode.is_none() && !self.done {
            self.init()
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        }

        if self.out_pos >= self.out.len() {
            if self.done {
                return Ok(0);
            }
            self.fill_next_chunked_frame()
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            if self.out.is_empty() {
                return Ok(0);
            }
        }

        let available = self.out.len() - self.out_pos;
        let to_copy = available.min(into.len());
        into[..to_copy].copy_from_slice(&self.out[self.out_pos..self.out_pos + to_copy]);
        self.out_pos += to_copy;
        Ok(to_copy)
    }
}

pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rng().fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn test_key() -> [u8; 32] {
        let passphrase = SecretString::new("correct-horse-battery-staple".into());
        derive_key(&passphrase, &[7u8; SALT_LEN])
    }

    #[test]
    fn round_trips_data_smaller_than_one_chunk() {
        let key = test_key();
        let plaintext = b"hello, scrat";
        let mut encryptor =
            SegmentEncryptor::new(Cursor::new(plaintext.to_vec()), key, random_salt(), 16);
        let mut sealed = Vec::new();
        encryptor.read_to_end(&mut sealed).unwrap();

        let mut decryptor = SegmentDecryptor::new(Cursor::new(sealed), key);
        let mut recovered = Vec::new();
        decryptor.read_to_end(&mut recovered).unwrap();

        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn round_trips_data_spanning_multiple_chunks() {
        let key = test_key();
        let plaintext: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut encryptor =
            SegmentEncryptor::new(Cursor::new(plaintext.clone()), key, random_salt(), 1024);
        let mut sealed = Vec::new();
        encryptor.read_to_end(&mut sealed).unwrap();

        let mut decryptor = SegmentDecryptor::new(Cursor::new(sealed), key);
        let mut recovered = Vec::new();
        decryptor.read_to_end(&mut recovered).unwrap();

        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn tampering_with_a_chunk_is_detected() {
        let key = test_key();
        let plaintext = vec![0xABu8; 5000];
        let mut encryptor =
            SegmentEncryptor::new(Cursor::new(plaintext), key, random_salt(), 1024);
        let mut sealed = Vec::new();
        encryptor.read_to_end(&mut sealed).unwrap();

        let flip_at = 8 + SALT_LEN + 4 + NONCE_LEN + 4 + 10;
        sealed[flip_at] ^= 0xFF;

        let mut decryptor = SegmentDecryptor::new(Cursor::new(sealed), key);
        let mut recovered = Vec::new();
        let result = decryptor.read_to_end(&mut recovered);
        assert!(result.is_err());
    }

    #[test]
    fn decrypting_with_wrong_key_fails() {
        let key = test_key();
        let other_passphrase = SecretString::new("wrong-passphrase".into());
        let other_key = derive_key(&other_passphrase, &[7u8; SALT_LEN]);

        let mut encryptor =
            SegmentEncryptor::new(Cursor::new(b"secret".to_vec()), key, random_salt(), 1024);
        let mut sealed = Vec::new();
        encryptor.read_to_end(&mut sealed).unwrap();

        let mut decryptor = SegmentDecryptor::new(Cursor::new(sealed), other_key);
        let mut recovered = Vec::new();
        assert!(decryptor.read_to_end(&mut recovered).is_err());
    }

    #[test]
    fn legacy_single_shot_layout_is_still_readable() {
        let key = test_key();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let salt = random_salt();
        let iv = random_nonce();
        let plaintext = b"legacy payload";
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .unwrap();

        let mut blob = Vec::new();
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&sealed);

        let mut decryptor = SegmentDecryptor::new(Cursor::new(blob), key);
        let mut recovered = Vec::new();
        decryptor.read_to_end(&mut recovered).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn verifier_confirms_correct_passphrase_and_rejects_wrong_one() {
        let key = test_key();
        let verifier = derive_verifier(&key);
        assert!(verify_passphrase(&key, &verifier));

        let wrong_passphrase = SecretString::new("nope".into());
        let wrong_key = derive_key(&wrong_passphrase, &[7u8; SALT_LEN]);
        assert!(!verify_passphrase(&wrong_key, &verifier));
    }

    #[test]
    fn hex_round_trip() {
        let bytes = [0u8, 1, 255, 16, 128];
        let encoded = hex_encode(&bytes);
        assert_eq!(hex_decode(&encoded).unwrap(), bytes);
    }
}
