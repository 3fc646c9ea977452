//! Framed append-only log
//!
//! Both the data log and the ingest marker log are sequences of frames:
//!
//! ```text
//! | length: u32 BE | crc32(payload): u32 BE | payload: length bytes |
//! ```
//!
//! A frame is written with a single `write_all`. Replay stops at the first
//! frame that is short or fails its checksum; everything from there on is a
//! torn tail left by a write that was never acknowledged.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind as IoErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Bytes in a frame header
pub const FRAME_HEADER_LEN: u64 = 8;

/// Refuse frames larger than this when replaying
const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Appends frames to a log file
#[derive(Debug)]
pub struct LogWriter {
    path: PathBuf,
    file: File,
    /// Offset where the next frame starts
    offset: u64,
    /// fsync after every append
    sync: bool,
}

impl LogWriter {
    /// Open for append, positioned at `valid_len` (anything past it is discarded)
    pub fn open(path: &Path, valid_len: u64, sync: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let actual = file.metadata()?.len();
        if actual > valid_len {
            warn!(
                path = %path.display(),
                discarded = actual - valid_len,
                "truncating torn log tail"
            );
            file.set_len(valid_len)?;
        }
        let mut writer = Self {
            path: path.to_path_buf(),
            file,
            offset: valid_len,
            sync,
        };
        writer.file.seek(SeekFrom::Start(valid_len))?;
        Ok(writer)
    }

    /// Append one frame; returns the file offset of its payload.
    ///
    /// On failure the file is cut back to the previous end so a partial frame
    /// never precedes later ones.
    pub fn append(&mut self, payload: &[u8]) -> Result<u64> {
        let mut frame = Vec::with_capacity(payload.len() + FRAME_HEADER_LEN as usize);
        frame.write_u32::<BigEndian>(payload.len() as u32)?;
        frame.write_u32::<BigEndian>(crc32fast::hash(payload))?;
        frame.extend_from_slice(payload);

        let start = self.offset;
        let written = self.file.write_all(&frame).and_then(|_| {
            if self.sync {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            let _ = self.file.set_len(start);
            let _ = self.file.seek(SeekFrom::Start(start));
            return Err(Error::IoError(e));
        }

        self.offset += frame.len() as u64;
        Ok(start + FRAME_HEADER_LEN)
    }

    /// Force appended frames to stable storage
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Drop every frame
    pub fn reset(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.offset = 0;
        self.file.sync_data()?;
        Ok(())
    }

    /// Current end of the log
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Replay every intact frame of a log, calling `visit(payload_offset, payload)`.
///
/// Returns the length of the intact prefix. A missing file is an empty log.
pub fn replay<F>(path: &Path, mut visit: F) -> Result<u64>
where
    F: FnMut(u64, &[u8]) -> Result<()>,
{
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let total = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut offset = 0u64;
    let mut frames = 0usize;

    loop {
        if offset + FRAME_HEADER_LEN > total {
            break;
        }
        let len = reader.read_u32::<BigEndian>()?;
        let crc = reader.read_u32::<BigEndian>()?;
        if len > MAX_FRAME_LEN || offset + FRAME_HEADER_LEN + len as u64 > total {
            break;
        }
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            warn!(path = %path.display(), offset, "checksum mismatch, stopping replay");
            break;
        }
        visit(offset + FRAME_HEADER_LEN, &payload)?;
        offset += FRAME_HEADER_LEN + len as u64;
        frames += 1;
    }

    debug!(path = %path.display(), frames, valid_len = offset, "log replayed");
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.log");

        let mut writer = LogWriter::open(&path, 0, false).unwrap();
        let first = writer.append(b"hello").unwrap();
        let second = writer.append(b"world!").unwrap();
        assert_eq!(first, FRAME_HEADER_LEN);
        assert_eq!(second, FRAME_HEADER_LEN * 2 + 5);

        let mut seen = Vec::new();
        let valid = replay(&path, |off, payload| {
            seen.push((off, payload.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(valid, writer.offset());
        assert_eq!(seen[0], (first, b"hello".to_vec()));
        assert_eq!(seen[1], (second, b"world!".to_vec()));
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torn.log");

        let mut writer = LogWriter::open(&path, 0, false).unwrap();
        writer.append(b"intact").unwrap();
        let good_len = writer.offset();
        writer.append(b"will be torn").unwrap();
        drop(writer);

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(good_len + 10).unwrap();

        let mut count = 0;
        let valid = replay(&path, |_, _| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(valid, good_len);

        let writer = LogWriter::open(&path, valid, false).unwrap();
        assert_eq!(writer.offset(), good_len);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
    }

    #[test]
    fn test_missing_log_is_empty() {
        let dir = TempDir::new().unwrap();
        let valid = replay(&dir.path().join("absent.log"), |_, _| Ok(())).unwrap();
        assert_eq!(valid, 0);
    }
}
