// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Control file recording which record files are current.
//!
//! # File Format
//!
//! ```text
//! ┌────────────────┬──────────────────┬─────────────────┬──────────────┐
//! │ Magic "QCTL"   │ Write ref (4B LE)│ Read ref (4B LE)│ CRC32 (4B LE)│
//! └────────────────┴──────────────────┴─────────────────┴──────────────┘
//! ```
//!
//! The 16 bytes are rewritten in place at offset 0 and synced. A write of
//! the pair already on disk is skipped, so the file never grows.

use std::{
    fs::{File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use snafu::{ResultExt, ensure};
use tracing::{debug, warn};

use crate::{
    Result,
    crc::checksum,
    error::{ControlFileCorruptedSnafu, IoSnafu},
};

pub const CONTROL_MAGIC: [u8; 4] = *b"QCTL";
pub const CONTROL_FILE_SIZE: usize = 16;

/// Identity of one of the two record files of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum FileRef {
    #[display("queue-file-1")]
    First,
    #[display("queue-file-2")]
    Second,
}

impl FileRef {
    /// The sentinel used when no control data exists.
    pub const DEFAULT: Self = Self::First;

    pub const fn other(self) -> Self {
        match self {
            Self::First => Self::Second,
            Self::Second => Self::First,
        }
    }

    pub const fn file_name(self) -> &'static str {
        match self {
            Self::First => "queue-file-1",
            Self::Second => "queue-file-2",
        }
    }

    const fn as_u32(self) -> u32 {
        match self {
            Self::First => 1,
            Self::Second => 2,
        }
    }

    const fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::First),
            2 => Some(Self::Second),
            _ => None,
        }
    }
}

/// `(write, read)` pair persisted by the control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePair {
    pub write: FileRef,
    pub read:  FileRef,
}

impl FilePair {
    pub const DEFAULT: Self = Self {
        write: FileRef::DEFAULT,
        read:  FileRef::DEFAULT,
    };

    pub fn is_rotated(self) -> bool { self.write != self.read }

    fn serialize(self) -> [u8; CONTROL_FILE_SIZE] {
        let mut buf = [0u8; CONTROL_FILE_SIZE];
        buf[..4].copy_from_slice(&CONTROL_MAGIC);
        buf[4..8].copy_from_slice(&self.write.as_u32().to_le_bytes());
        buf[8..12].copy_from_slice(&self.read.as_u32().to_le_bytes());
        let crc = checksum(&buf[..12]);
        buf[12..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn deserialize(path: &Path, buf: &[u8; CONTROL_FILE_SIZE]) -> Result<Self> {
        ensure!(
            buf[..4] == CONTROL_MAGIC,
            ControlFileCorruptedSnafu {
                path,
                reason: "invalid magic",
            }
        );
        let stored_crc = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        ensure!(
            checksum(&buf[..12]) == stored_crc,
            ControlFileCorruptedSnafu {
                path,
                reason: "checksum mismatch",
            }
        );
        let decode = |bytes: [u8; 4]| {
            let value = u32::from_le_bytes(bytes);
            FileRef::from_u32(value).ok_or_else(|| {
                ControlFileCorruptedSnafu {
                    path,
                    reason: format!("unknown file reference {value}"),
                }
                .build()
            })
        };
        Ok(Self {
            write: decode([buf[4], buf[5], buf[6], buf[7]])?,
            read:  decode([buf[8], buf[9], buf[10], buf[11]])?,
        })
    }
}

/// Exclusive handle on a queue's control file.
#[derive(Debug)]
pub struct ControlFile {
    file:         File,
    path:         PathBuf,
    last_written: Option<FilePair>,
}

impl ControlFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .context(IoSnafu { path: &path })?;
        Ok(Self {
            file,
            path,
            last_written: None,
        })
    }

    /// Reads the persisted pair.
    ///
    /// An empty file yields [`FilePair::DEFAULT`]. A short or corrupted
    /// file also yields the default, with a warning, so the store falls
    /// back to fresh record files.
    pub fn read(&mut self) -> Result<FilePair> {
        let len = self.file.metadata().context(IoSnafu { path: &self.path })?.len();
        if len == 0 {
            return Ok(FilePair::DEFAULT);
        }

        let mut buf = [0u8; CONTROL_FILE_SIZE];
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0)).context(IoSnafu { path: &self.path })?;
        match file.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                warn!(path = ?self.path, len, "Short control file, falling back to default file pair");
                return Ok(FilePair::DEFAULT);
            }
            Err(e) => return Err(e).context(IoSnafu { path: &self.path }),
        }

        match FilePair::deserialize(&self.path, &buf) {
            Ok(pair) => {
                self.last_written = Some(pair);
                Ok(pair)
            }
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Control file unreadable, falling back to default file pair");
                Ok(FilePair::DEFAULT)
            }
        }
    }

    /// Persists `pair` unless it equals the last persisted value.
    ///
    /// Returns whether bytes were written.
    pub fn write(&mut self, pair: FilePair) -> Result<bool> {
        if self.last_written == Some(pair) {
            return Ok(false);
        }
        let buf = pair.serialize();
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0)).context(IoSnafu { path: &self.path })?;
        file.write_all(&buf).context(IoSnafu { path: &self.path })?;
        self.file.sync_all().context(IoSnafu { path: &self.path })?;
        self.last_written = Some(pair);
        debug!(path = ?self.path, write = %pair.write, read = %pair.read, "Control file updated");
        Ok(true)
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata().context(IoSnafu { path: &self.path })?.len())
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Flushes and closes the handle, leaving the file in place.
    pub fn dispose(self) -> Result<()> { self.file.sync_all().context(IoSnafu { path: &self.path }) }

    /// Closes the handle and deletes the file.
    pub fn delete(self) -> Result<()> {
        let Self { file, path, .. } = self;
        drop(file);
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e).context(IoSnafu { path }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    const ROTATED: FilePair = FilePair {
        write: FileRef::Second,
        read:  FileRef::First,
    };

    #[test]
    fn test_absent_file_reads_default() {
        let temp_dir = TempDir::new().unwrap();
        let mut control = ControlFile::open(temp_dir.path().join("queue-control-data")).unwrap();
        assert_eq!(control.read().unwrap(), FilePair::DEFAULT);
    }

    #[test]
    fn test_write_then_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("queue-control-data");
        {
            let mut control = ControlFile::open(&path).unwrap();
            assert!(control.write(ROTATED).unwrap());
            control.dispose().unwrap();
        }
        let mut control = ControlFile::open(&path).unwrap();
        let pair = control.read().unwrap();
        assert_eq!(pair, ROTATED);
        assert!(pair.is_rotated());
    }

    #[test]
    fn test_repeated_write_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let mut control = ControlFile::open(temp_dir.path().join("queue-control-data")).unwrap();

        assert!(control.write(ROTATED).unwrap());
        let len = control.len().unwrap();
        assert!(!control.write(ROTATED).unwrap());
        assert_eq!(control.len().unwrap(), len);

        assert!(control.write(FilePair::DEFAULT).unwrap());
        assert_eq!(control.len().unwrap(), CONTROL_FILE_SIZE as u64);
    }

    #[test]
    fn test_read_after_read_skips_identical_write() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("queue-control-data");
        ControlFile::open(&path).unwrap().write(ROTATED).unwrap();

        let mut control = ControlFile::open(&path).unwrap();
        control.read().unwrap();
        assert!(!control.write(ROTATED).unwrap());
    }

    #[test]
    fn test_corrupted_file_falls_back_to_default() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("queue-control-data");
        ControlFile::open(&path).unwrap().write(ROTATED).unwrap();

        let mut raw = fs::read(&path).unwrap();
        raw[5] ^= 0xFF;
        fs::write(&path, &raw).unwrap();

        let mut control = ControlFile::open(&path).unwrap();
        assert_eq!(control.read().unwrap(), FilePair::DEFAULT);
    }

    #[test]
    fn test_delete_removes_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("queue-control-data");
        let mut control = ControlFile::open(&path).unwrap();
        control.write(FilePair::DEFAULT).unwrap();
        control.delete().unwrap();
        assert!(!path.exists());
    }
}
