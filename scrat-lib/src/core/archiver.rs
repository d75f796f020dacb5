use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

/// Per-file metadata carried inline in the archiver's plaintext stream
/// (§4.3). Written as a length-prefixed JSON header immediately before
/// the file's content bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveFileMeta {
    pub relative_path: String,
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
    /// True when `size` bytes of content is a symlink target path rather
    /// than file bytes (§4.4 boundary behaviors list symlinks explicitly).
    #[serde(default)]
    pub is_symlink: bool,
}

/// Where a file's content landed within the current plaintext segment,
/// surfaced to the engine for storage in `BackupFile` (§3, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePlacement {
    pub segment_offset: u64,
    pub segment_length: u64,
}

type NextFileFn<'a> =
    dyn FnMut() -> io::Result<Option<(ArchiveFileMeta, Box<dyn Read + Send>)>> + 'a;
type PlacementFn<'a> = dyn FnMut(&ArchiveFileMeta, FilePlacement) + 'a;

enum ArchiverState {
    NeedNext,
    Header {
        buf: Vec<u8>,
        pos: usize,
        meta: ArchiveFileMeta,
        reader: Box<dyn Read + Send>,
    },
    Content {
        reader: Box<dyn Read + Send>,
        meta: ArchiveFileMeta,
        content_start: u64,
        consumed: u64,
    },
    Done,
}

/// Presents a sequential plaintext byte stream for one archive segment,
/// pulling files one at a time from `next_file` and reporting each file's
/// placement via `on_placement` the moment its content is fully consumed —
/// which is also the point at which the caller may decide to stop pulling
/// (ending this segment) without leaving a file half-written, since a new
/// file is only requested once the previous one is fully drained (§4.3:
/// "splitting boundaries MUST fall between files").
pub struct ArchiveWriter<'a> {
    next_file: Box<NextFileFn<'a>>,
    on_placement: Box<PlacementFn<'a>>,
    position: u64,
    state: ArchiverState,
}

impl<'a> ArchiveWriter<'a> {
    pub fn new(
        next_file: impl FnMut() -> io::Result<Option<(ArchiveFileMeta, Box<dyn Read + Send>)>> + 'a,
        on_placement: impl FnMut(&ArchiveFileMeta, FilePlacement) + 'a,
    ) -> Self {
        ArchiveWriter {
            next_file: Box::new(next_file),
            on_placement: Box::new(on_placement),
            position: 0,
            state: ArchiverState::NeedNext,
        }
    }

    /// Total plaintext bytes emitted into the current segment so far.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl<'a> Read for ArchiveWriter<'a> {
    fn read(&mut self, into: &mut [u8]) -> io::Result<usize> {
        loop {
            let state = std::mem::replace(&mut self.state, ArchiverState::Done);
            match state {
                ArchiverState::NeedNext => match (self.next_file)()? {
                    None => {
                        self.state = ArchiverState::Done;
                        return Ok(0);
                    }
                    Some((meta, reader)) => {
                        let header_json = serde_json::to_vec(&meta).map_err(|err| {
                            io::Error::new(io::ErrorKind::InvalidData, err)
                        })?;
                        let mut buf = Vec::with_capacity(4 + header_json.len());
                        buf.extend_from_slice(&(header_json.len() as u32).to_le_bytes());
                        buf.extend_from_slice(&header_json);
                        self.state = ArchiverState::Header {
                            buf,
                            pos: 0,
                            meta,
                            reader,
                        };
                    }
                },
                ArchiverState::Header {
                    buf,
                    pos,
                    meta,
                    reader,
                } => {
                    if pos < buf.len() {
                        let to_copy = (buf.len() - pos).min(into.len());
                        into[..to_copy].copy_from_slice(&buf[pos..pos + to_copy]);
                        self.position += to_copy as u64;
                        self.state = ArchiverState::Header {
                            buf,
                            pos: pos + to_copy,
                            meta,
                            reader,
                        };
                        return Ok(to_copy);
                    }
                    self.state = ArchiverState::Content {
                        reader,
                        meta,
                        content_start: self.position,
                        consumed: 0,
                    };
                }
                ArchiverState::Content {
                    mut reader,
                    meta,
                    content_start,
                    consumed,
                } => {
                    let n = reader.read(into)?;
                    if n == 0 {
                        (self.on_placement)(
                            &meta,
                            FilePlacement {
                                segment_offset: content_start,
                                segment_length: consumed,
                            },
                        );
                        self.state = ArchiverState::NeedNext;
                        continue;
                    }
                    self.position += n as u64;
                    self.state = ArchiverState::Content {
                        reader,
                        meta,
                        content_start,
                        consumed: consumed + n as u64,
                    };
                    return Ok(n);
                }
                ArchiverState::Done => return Ok(0),
            }
        }
    }
}

/// Reads back an archiver stream produced by [`ArchiveWriter`], yielding
/// one `(meta, content)` pair per call to `next_file`; `read_content`
/// pulls bounded bytes for the current file only (never past its
/// declared size), matching the restore engine's segment-slice reads
/// (§4.7).
pub struct ArchiveReader<R: Read> {
    inner: R,
    remaining: u64,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(inner: R) -> Self {
        ArchiveReader {
            inner,
            remaining: 0,
        }
    }

    /// Advances to the next file's header, skipping any unread content
    /// bytes of the previous file. Returns `None` at a clean end of
    /// stream.
    pub fn next_file(&mut self) -> io::Result<Option<ArchiveFileMeta>> {
        if self.remaining > 0 {
            io::copy(
                &mut (&mut self.inner).take(self.remaining),
                &mut io::sink(),
            )?;
            self.remaining = 0;
        }

        let mut len_bytes = [0u8; 4];
        let read = read_partial(&mut self.inner, &mut len_bytes)?;
        if read == 0 {
            return Ok(None);
        }
        if read != len_bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated archive header length",
            ));
        }

        let header_len = u32::from_le_bytes(len_bytes) as usize;
        let mut header_buf = vec![0u8; header_len];
        self.inner.read_exact(&mut header_buf)?;
        let meta: ArchiveFileMeta = serde_json::from_slice(&header_buf)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.remaining = meta.size;
        Ok(Some(meta))
    }

    /// Reads up to `buf.len()` bytes of the current file's content.
    /// Returns `0` once the current file's declared size is exhausted.
    pub fn read_content(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..want])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn read_partial(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Drains the rest of an [`ArchiveReader`]'s current file into `writer`.
pub fn copy_file_content<R: Read, W: Write>(
    archive: &mut ArchiveReader<R>,
    writer: &mut W,
) -> io::Result<u64> {
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = archive.read_content(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn make_file(path: &str, content: &[u8]) -> (ArchiveFileMeta, Box<dyn Read + Send>) {
        (
            ArchiveFileMeta {
                relative_path: path.to_string(),
                size: content.len() as u64,
                mtime: 0,
                mode: 0o644,
                is_symlink: false,
            },
            Box::new(Cursor::new(content.to_vec())),
        )
    }

    #[test]
    fn round_trips_several_files_with_placements() {
        let mut files = vec![
            make_file("a.txt", b"hello"),
            make_file("b/c.bin", &[0xABu8; 20]),
            make_file("empty.txt", b""),
        ]
        .into_iter();

        let mut placements = Vec::new();
        let mut writer = ArchiveWriter::new(
            move || Ok(files.next()),
            |meta, placement| placements.push((meta.relative_path.clone(), placement)),
        );

        let mut bytes = Vec::new();
        writer.read_to_end(&mut bytes).unwrap();

        let mut reader = ArchiveReader::new(Cursor::new(bytes));
        let meta_a = reader.next_file().unwrap().unwrap();
        assert_eq!(meta_a.relative_path, "a.txt");
        let mut out_a = Vec::new();
        copy_file_content(&mut reader, &mut out_a).unwrap();
        assert_eq!(out_a, b"hello");

        let meta_b = reader.next_file().unwrap().unwrap();
        assert_eq!(meta_b.relative_path, "b/c.bin");
        let mut out_b = Vec::new();
        copy_file_content(&mut reader, &mut out_b).unwrap();
        assert_eq!(out_b, vec![0xABu8; 20]);

        let meta_c = reader.next_file().unwrap().unwrap();
        assert_eq!(meta_c.relative_path, "empty.txt");
        let mut out_c = Vec::new();
        copy_file_content(&mut reader, &mut out_c).unwrap();
        assert!(out_c.is_empty());

        assert!(reader.next_file().unwrap().is_none());
    }

    #[test]
    fn skipping_a_file_without_reading_its_content_still_advances() {
        let mut files = vec![make_file("a.txt", b"12345"), make_file("b.txt", b"67890")].into_iter();
        let mut writer = ArchiveWriter::new(move || Ok(files.next()), |_, _| {});
        let mut bytes = Vec::new();
        writer.read_to_end(&mut bytes).unwrap();

        let mut reader = ArchiveReader::new(Cursor::new(bytes));
        reader.next_file().unwrap().unwrap();
        // Don't read "a.txt"'s content; next_file must skip it correctly.
        let meta_b = reader.next_file().unwrap().unwrap();
        assert_eq!(meta_b.relative_path, "b.txt");
        let mut out = Vec::new();
        copy_file_content(&mut reader, &mut out).unwrap();
        assert_eq!(out, b"67890");
    }
}
