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

//! Framed append-only journal file.
//!
//! # Entry Format
//!
//! ```text
//! ┌─────────────────┬─────────────────────┬─────────────────┬───────────────┐
//! │ Length (4B, LE) │ Length CRC (4B, LE) │ Body (N bytes)  │ CRC32 (4B, LE)│
//! └─────────────────┴─────────────────────┴─────────────────┴───────────────┘
//! ```
//!
//! The trailing CRC covers the length prefix and the body. The length CRC
//! lets a scan trust a length that runs past EOF as a torn final entry;
//! a length that fails its own checksum with data after it is corruption.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use snafu::{ResultExt, ensure};
use tracing::warn;

use crate::{
    Result,
    crc::{calculate_entry_crc, checksum, verify_entry_crc},
    error::{IoSnafu, JournalCorruptedSnafu},
};

const ENTRY_LENGTH_SIZE: usize = 4;
const ENTRY_HEADER_SIZE: usize = ENTRY_LENGTH_SIZE + 4;
const ENTRY_CRC_SIZE: usize = 4;

/// One decoded frame and its byte offset.
pub(crate) struct RawEntry {
    pub offset: u64,
    pub body:   Vec<u8>,
}

pub(crate) struct JournalFile {
    file: File,
    path: PathBuf,
    len:  u64,
}

impl JournalFile {
    /// Opens the journal and returns every intact entry body in order.
    ///
    /// A torn or checksum-failing final entry, or a zero-filled tail, is
    /// truncated. A damaged entry followed by more data is fatal.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<RawEntry>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .context(IoSnafu { path: &path })?;
        let raw = fs::read(&path).context(IoSnafu { path: &path })?;

        let mut entries = Vec::new();
        let mut position = 0usize;
        while position < raw.len() {
            let remaining = raw.len() - position;
            if remaining < ENTRY_HEADER_SIZE + ENTRY_CRC_SIZE {
                warn!(path = ?path, position, remaining, "Torn entry at end of journal, truncating");
                break;
            }
            let length_bytes = &raw[position..position + ENTRY_LENGTH_SIZE];
            let mut crc_buf = [0u8; 4];
            crc_buf.copy_from_slice(&raw[position + ENTRY_LENGTH_SIZE..position + ENTRY_HEADER_SIZE]);
            if checksum(length_bytes) != u32::from_le_bytes(crc_buf) {
                ensure!(
                    raw[position..].iter().all(|&b| b == 0),
                    JournalCorruptedSnafu {
                        path:   &path,
                        offset: position as u64,
                        reason: "entry length fails its checksum",
                    }
                );
                warn!(path = ?path, position, "Unwritten tail in journal, truncating");
                break;
            }
            let mut length_buf = [0u8; ENTRY_LENGTH_SIZE];
            length_buf.copy_from_slice(length_bytes);
            let length = u32::from_le_bytes(length_buf);
            let frame_len = ENTRY_HEADER_SIZE + length as usize + ENTRY_CRC_SIZE;
            if frame_len > remaining {
                warn!(path = ?path, position, length, "Truncated entry at end of journal, truncating");
                break;
            }

            let body_start = position + ENTRY_HEADER_SIZE;
            let body = &raw[body_start..body_start + length as usize];
            let mut crc_buf = [0u8; ENTRY_CRC_SIZE];
            crc_buf.copy_from_slice(&raw[position + frame_len - ENTRY_CRC_SIZE..position + frame_len]);
            if !verify_entry_crc(length, body, u32::from_le_bytes(crc_buf)) {
                ensure!(
                    position + frame_len == raw.len(),
                    JournalCorruptedSnafu {
                        path:   &path,
                        offset: position as u64,
                        reason: "checksum mismatch before the end of the journal",
                    }
                );
                warn!(path = ?path, position, "Checksum mismatch on last journal entry, truncating");
                break;
            }

            entries.push(RawEntry {
                offset: position as u64,
                body:   body.to_vec(),
            });
            position += frame_len;
        }

        let valid_len = position as u64;
        if valid_len < raw.len() as u64 {
            file.set_len(valid_len).context(IoSnafu { path: &path })?;
            file.sync_all().context(IoSnafu { path: &path })?;
        }

        Ok((
            Self {
                file,
                path,
                len: valid_len,
            },
            entries,
        ))
    }

    /// Appends one entry and syncs it. A failed append is rolled back so
    /// later entries never follow a partial frame.
    pub fn append(&mut self, body: &[u8]) -> io::Result<()> {
        let frame = encode_frame(body)?;
        let mut result = self.file.write_all(&frame);
        if result.is_ok() {
            result = self.file.sync_data();
        }
        match result {
            Ok(()) => {
                self.len += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.file.set_len(self.len) {
                    warn!(path = ?self.path, error = %rollback, "Failed to roll back partial journal entry");
                }
                Err(e)
            }
        }
    }

    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0).context(IoSnafu { path: &self.path })?;
        self.file.sync_all().context(IoSnafu { path: &self.path })?;
        self.len = 0;
        Ok(())
    }

    /// Atomically replaces the journal with the given entry bodies.
    pub fn rewrite<'a>(&mut self, bodies: impl IntoIterator<Item = &'a [u8]>) -> Result<()> {
        let scratch = self.path.with_extension("compact");
        let mut buf = Vec::new();
        for body in bodies {
            buf.extend_from_slice(&encode_frame(body).context(IoSnafu { path: &scratch })?);
        }
        {
            let mut out = File::create(&scratch).context(IoSnafu { path: &scratch })?;
            out.write_all(&buf).context(IoSnafu { path: &scratch })?;
            out.sync_all().context(IoSnafu { path: &scratch })?;
        }
        fs::rename(&scratch, &self.path).context(IoSnafu { path: &self.path })?;
        self.file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .context(IoSnafu { path: &self.path })?;
        self.len = buf.len() as u64;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> { self.file.sync_all().context(IoSnafu { path: &self.path }) }

    pub const fn len(&self) -> u64 { self.len }

    pub fn path(&self) -> &Path { &self.path }
}

fn encode_frame(body: &[u8]) -> io::Result<Vec<u8>> {
    let length = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "journal entry exceeds 4 GiB"))?;
    let length_bytes = length.to_le_bytes();
    let mut frame = Vec::with_capacity(ENTRY_HEADER_SIZE + body.len() + ENTRY_CRC_SIZE);
    frame.extend_from_slice(&length_bytes);
    frame.extend_from_slice(&checksum(&length_bytes).to_le_bytes());
    frame.extend_from_slice(body);
    frame.extend_from_slice(&calculate_entry_crc(length, body).to_le_bytes());
    Ok(frame)
}
