use std::io::{self, Read};

use crate::shared::config::Compression;

/// Wraps a plaintext reader with streaming zstd compression, or passes
/// bytes through unchanged for [`Compression::None`] (§4.3: "none" is a
/// first-class store-only mode, not a fallback).
pub enum CompressingReader<'a, R: Read + 'a> {
    Store(R),
    Zstd(zstd::stream::read::Encoder<'a, R>),
}

impl<'a, R: Read + 'a> CompressingReader<'a, R> {
    pub fn new(reader: R, compression: Compression) -> io::Result<Self> {
        match compression {
            Compression::None => Ok(CompressingReader::Store(reader)),
            level => {
                let mut encoder = zstd::stream::read::Encoder::new(reader, level.zstd_level())?;
                // Multithreaded, streaming compression (§4.3): parallelize across
                // the available cores without breaking streaming output.
                let workers = std::thread::available_parallelism()
                    .map(|n| n.get() as u32)
                    .unwrap_or(1);
                if workers > 1 {
                    let _ = encoder.multithread(workers);
                }
                Ok(CompressingReader::Zstd(encoder))
            }
        }
    }
}

impl<'a, R: Read + 'a> Read for CompressingReader<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            CompressingReader::Store(reader) => reader.read(buf),
            CompressingReader::Zstd(encoder) => encoder.read(buf),
        }
    }
}

/// Wraps a compressed reader with streaming zstd decompression, or passes
/// bytes through unchanged when the archive was stored (§4.3).
pub enum DecompressingReader<'a, R: Read + 'a> {
    Store(R),
    Zstd(zstd::stream::read::Decoder<'a, io::BufReader<R>>),
}

impl<'a, R: Read + 'a> DecompressingReader<'a, R> {
    pub fn new(reader: R, compression: Compression) -> io::Result<Self> {
        match compression {
            Compression::None => Ok(DecompressingReader::Store(reader)),
            _ => Ok(DecompressingReader::Zstd(zstd::stream::read::Decoder::new(
                reader,
            )?)),
        }
    }
}

impl<'a, R: Read + 'a> Read for DecompressingReader<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DecompressingReader::Store(reader) => reader.read(buf),
            DecompressingReader::Zstd(decoder) => decoder.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn store_mode_passes_bytes_through_unchanged() {
        let data = b"no compression here".to_vec();
        let mut reader = CompressingReader::new(Cursor::new(data.clone()), Compression::None)
            .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn zstd_round_trips() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 17) as u8).collect();
        let mut compressor =
            CompressingReader::new(Cursor::new(data.clone()), Compression::Fast).unwrap();
        let mut compressed = Vec::new();
        compressor.read_to_end(&mut compressed).unwrap();
        assert!(compressed.len() < data.len());

        let mut decompressor =
            DecompressingReader::new(Cursor::new(compressed), Compression::Fast).unwrap();
        let mut recovered = Vec::new();
        decompressor.read_to_end(&mut recovered).unwrap();
        assert_eq!(recovered, data);
    }
}
