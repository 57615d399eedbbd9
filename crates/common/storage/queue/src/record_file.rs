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

//! Append-only file of length-prefixed records.
//!
//! # File Format
//!
//! ```text
//! ┌──────────────────────┬───────────────────┬──────────┬──────────┬─────┐
//! │ Read cursor (8B, LE) │ Id floor (8B, LE) │ Frame 0  │ Frame 1  │ ... │
//! └──────────────────────┴───────────────────┴──────────┴──────────┴─────┘
//!
//! Frame:
//! ┌─────────────────┬─────────────┬────────────────────┬─────────────┬──────────────────┐
//! │ Length (8B, LE) │ Id (8B, LE) │ Header CRC (4B)    │ Payload (N) │ Payload CRC (4B) │
//! └─────────────────┴─────────────┴────────────────────┴─────────────┴──────────────────┘
//! ```
//!
//! Every record carries an id that is unique within its store and never
//! changes, even when the file is rewritten. The id floor is the lowest id
//! the file may hand out next, so ids keep growing after a file is
//! recreated.
//!
//! The header checksum tells a torn tail apart from a damaged length: a
//! frame whose header verifies but whose end lies past EOF can only be the
//! last one, so it is truncated. A damaged frame anywhere else is
//! [`CorruptFrame`](crate::QueueError::CorruptFrame).
//!
//! Frames are never rewritten. Consuming a record only moves the read
//! cursor, which is overwritten in place in the header so that consumed
//! records stay consumed across restarts. The file never shrinks while it
//! is in use; it is deleted once fully drained.

use std::{
    fs::{File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use bytes::Bytes;
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, warn};

use crate::{
    FlushMode, Result,
    crc::checksum,
    error::{CorruptFrameSnafu, IoSnafu},
};

/// Read cursor plus id floor.
pub const RECORD_HEADER_SIZE: u64 = 16;
/// Length and id of a frame, covered by the header checksum.
const FRAME_FIELDS_SIZE: usize = 16;
/// Length, id and their checksum.
pub const FRAME_HEADER_SIZE: u64 = FRAME_FIELDS_SIZE as u64 + 4;
/// Header plus the payload checksum trailer.
pub const FRAME_OVERHEAD: u64 = FRAME_HEADER_SIZE + 4;

/// One record read back from a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id:      u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    length: u64,
    id:     u64,
}

/// A single record file with its read and write positions.
///
/// Invariant: `RECORD_HEADER_SIZE <= read_position <= write_position`, and
/// `write_position` is the file length.
#[derive(Debug)]
pub struct RecordFile {
    file:           File,
    path:           PathBuf,
    read_position:  u64,
    write_position: u64,
    unread:         u64,
    id_floor:       u64,
    next_id:        u64,
    flush_mode:     FlushMode,
}

impl RecordFile {
    /// Opens (or creates) a record file and scans its frames.
    ///
    /// A torn trailing frame is truncated away. A damaged frame followed by
    /// more data, or a read cursor that does not land on a frame boundary,
    /// is reported as [`CorruptFrame`].
    ///
    /// [`CorruptFrame`]: crate::QueueError::CorruptFrame
    pub fn open(path: impl AsRef<Path>, flush_mode: FlushMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .context(IoSnafu { path: &path })?;
        let len = file.metadata().context(IoSnafu { path: &path })?.len();
        let mut record_file = Self::blank(file, path, flush_mode);

        if len < RECORD_HEADER_SIZE {
            if len > 0 {
                warn!(path = ?record_file.path, len, "Torn record file header, reinitializing file");
            }
            record_file.reset(0)?;
            return Ok(record_file);
        }

        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        record_file.read_exact_at(0, &mut header)?;
        let (cursor, floor) = header.split_at(8);
        record_file.id_floor = le_u64(floor);
        record_file.scan(le_u64(cursor), len)?;
        Ok(record_file)
    }

    /// Creates an empty record file, replacing whatever was at `path`. The
    /// first record appended should use an id of at least `id_floor`.
    pub fn create(path: impl AsRef<Path>, flush_mode: FlushMode, id_floor: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .context(IoSnafu { path: &path })?;
        let mut record_file = Self::blank(file, path, flush_mode);
        record_file.reset(id_floor)?;
        Ok(record_file)
    }

    fn blank(file: File, path: PathBuf, flush_mode: FlushMode) -> Self {
        Self {
            file,
            path,
            read_position: RECORD_HEADER_SIZE,
            write_position: RECORD_HEADER_SIZE,
            unread: 0,
            id_floor: 0,
            next_id: 0,
            flush_mode,
        }
    }

    fn reset(&mut self, id_floor: u64) -> Result<()> {
        self.file.set_len(0).context(IoSnafu { path: &self.path })?;
        self.read_position = RECORD_HEADER_SIZE;
        self.write_position = RECORD_HEADER_SIZE;
        self.unread = 0;
        self.id_floor = id_floor;
        self.next_id = id_floor;
        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        header[..8].copy_from_slice(&self.read_position.to_le_bytes());
        header[8..].copy_from_slice(&id_floor.to_le_bytes());
        self.write_all_at(0, &header)?;
        if self.flush_mode.is_sync() {
            self.file.sync_data().context(IoSnafu { path: &self.path })?;
        }
        Ok(())
    }

    fn scan(&mut self, cursor: u64, len: u64) -> Result<()> {
        let mut position = RECORD_HEADER_SIZE;
        let mut count = 0u64;
        let mut consumed = None;
        let mut next_id = self.id_floor;

        loop {
            if position == cursor {
                consumed = Some(count);
            }
            if position == len {
                break;
            }
            if position + FRAME_HEADER_SIZE > len {
                warn!(path = ?self.path, position, len, "Torn frame header at end of record file, truncating");
                self.truncate_to(position)?;
                break;
            }
            let Some(header) = self.read_header(position)? else {
                ensure!(
                    self.is_zero_tail(position, len)?,
                    CorruptFrameSnafu {
                        path:   &self.path,
                        offset: position,
                        reason: "frame header fails its checksum",
                    }
                );
                warn!(path = ?self.path, position, len, "Unwritten tail in record file, truncating");
                self.truncate_to(position)?;
                break;
            };
            match (position + FRAME_OVERHEAD).checked_add(header.length) {
                Some(end) if end <= len => {
                    if self.read_payload(position, header.length)?.is_none() {
                        ensure!(
                            end == len,
                            CorruptFrameSnafu {
                                path:   &self.path,
                                offset: position,
                                reason: "payload checksum mismatch before the end of the file",
                            }
                        );
                        warn!(path = ?self.path, position, "Checksum mismatch on last record, truncating");
                        self.truncate_to(position)?;
                        break;
                    }
                    next_id = next_id.max(header.id + 1);
                    position = end;
                    count += 1;
                }
                _ => {
                    warn!(
                        path = ?self.path,
                        position,
                        length = header.length,
                        len,
                        "Truncated record found at end of file, truncating"
                    );
                    self.truncate_to(position)?;
                    break;
                }
            }
        }

        self.write_position = position;
        self.next_id = next_id;

        match consumed {
            Some(consumed) => {
                self.read_position = cursor;
                self.unread = count - consumed;
            }
            None if cursor > position => {
                warn!(
                    path = ?self.path,
                    cursor,
                    end = position,
                    "Read cursor beyond valid records, treating file as drained"
                );
                self.read_position = position;
                self.unread = 0;
                self.persist_cursor()?;
            }
            None => {
                return CorruptFrameSnafu {
                    path:   &self.path,
                    offset: cursor,
                    reason: "read cursor is not on a frame boundary",
                }
                .fail();
            }
        }

        debug!(
            path = ?self.path,
            records = count,
            unread = self.unread,
            next_id = self.next_id,
            read_position = self.read_position,
            write_position = self.write_position,
            "Record file scan complete"
        );
        Ok(())
    }

    /// Header of the frame at `position`, or `None` if it fails its checksum.
    fn read_header(&self, position: u64) -> Result<Option<FrameHeader>> {
        let mut header = [0u8; FRAME_HEADER_SIZE as usize];
        self.read_exact_at(position, &mut header)?;
        let (fields, crc) = header.split_at(FRAME_FIELDS_SIZE);
        let mut crc_buf = [0u8; 4];
        crc_buf.copy_from_slice(crc);
        if checksum(fields) != u32::from_le_bytes(crc_buf) {
            return Ok(None);
        }
        let (length, id) = fields.split_at(8);
        Ok(Some(FrameHeader {
            length: le_u64(length),
            id:     le_u64(id),
        }))
    }

    /// Payload of the frame at `position`, or `None` if it fails its checksum.
    fn read_payload(&self, position: u64, length: u64) -> Result<Option<Bytes>> {
        let payload_len = usize::try_from(length).map_err(|_| {
            CorruptFrameSnafu {
                path:   &self.path,
                offset: position,
                reason: format!("frame length {length} does not fit in memory"),
            }
            .build()
        })?;
        let mut body = vec![0u8; payload_len + 4];
        self.read_exact_at(position + FRAME_HEADER_SIZE, &mut body)?;
        let mut crc_buf = [0u8; 4];
        crc_buf.copy_from_slice(&body[payload_len..]);
        body.truncate(payload_len);
        if checksum(&body) != u32::from_le_bytes(crc_buf) {
            return Ok(None);
        }
        Ok(Some(Bytes::from(body)))
    }

    /// Whether every byte from `position` to `len` is zero, as left behind
    /// by a crash after the file was extended but before data landed.
    fn is_zero_tail(&self, position: u64, len: u64) -> Result<bool> {
        let mut chunk = [0u8; 4096];
        let mut offset = position;
        while offset < len {
            let n = usize::try_from(len - offset).map_or(chunk.len(), |rest| rest.min(chunk.len()));
            self.read_exact_at(offset, &mut chunk[..n])?;
            if chunk[..n].iter().any(|&b| b != 0) {
                return Ok(false);
            }
            offset += n as u64;
        }
        Ok(true)
    }

    fn truncate_to(&self, position: u64) -> Result<()> {
        self.file.set_len(position).context(IoSnafu { path: &self.path })?;
        self.file.sync_all().context(IoSnafu { path: &self.path })
    }

    /// Appends one frame carrying `id` at the write position.
    pub fn append(&mut self, id: u64, payload: &[u8]) -> Result<()> {
        let mut fields = [0u8; FRAME_FIELDS_SIZE];
        fields[..8].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        fields[8..].copy_from_slice(&id.to_le_bytes());
        let mut frame = Vec::with_capacity(FRAME_OVERHEAD as usize + payload.len());
        frame.extend_from_slice(&fields);
        frame.extend_from_slice(&checksum(&fields).to_le_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&checksum(payload).to_le_bytes());

        self.write_all_at(self.write_position, &frame)?;
        if self.flush_mode.is_sync() {
            self.file.sync_data().context(IoSnafu { path: &self.path })?;
        }

        self.write_position += frame.len() as u64;
        self.unread += 1;
        self.next_id = self.next_id.max(id + 1);
        Ok(())
    }

    /// Decodes the frame at `position`, returning the record and the
    /// position of the following frame.
    pub fn read_at(&self, position: u64) -> Result<(Record, u64)> {
        let header = self.frame_header_at(position)?;
        let payload = self.read_payload(position, header.length)?.context(CorruptFrameSnafu {
            path:   &self.path,
            offset: position,
            reason: "payload checksum mismatch",
        })?;
        let record = Record { id: header.id, payload };
        Ok((record, position + FRAME_OVERHEAD + header.length))
    }

    /// Verified header of the frame at `position`, checked to end inside
    /// the written region.
    fn frame_header_at(&self, position: u64) -> Result<FrameHeader> {
        ensure!(
            position >= RECORD_HEADER_SIZE && position + FRAME_OVERHEAD <= self.write_position,
            CorruptFrameSnafu {
                path:   &self.path,
                offset: position,
                reason: "frame header lies outside the written region",
            }
        );
        let header = self.read_header(position)?.context(CorruptFrameSnafu {
            path:   &self.path,
            offset: position,
            reason: "frame header fails its checksum",
        })?;
        let remaining = self.write_position - position - FRAME_OVERHEAD;
        ensure!(
            header.length <= remaining,
            CorruptFrameSnafu {
                path:   &self.path,
                offset: position,
                reason: format!("declared length {} exceeds remaining {remaining} bytes", header.length),
            }
        );
        Ok(header)
    }

    /// Returns the oldest unread record without consuming it.
    pub fn peek_first(&self) -> Result<Option<Record>> {
        if self.is_exhausted() {
            return Ok(None);
        }
        let (record, _) = self.read_at(self.read_position)?;
        Ok(Some(record))
    }

    /// Consumes the oldest unread record.
    pub fn remove_first(&mut self) -> Result<Option<Record>> {
        if self.is_exhausted() {
            return Ok(None);
        }
        let (record, next) = self.read_at(self.read_position)?;
        self.move_cursor(next)?;
        Ok(Some(record))
    }

    /// Moves the read cursor past the oldest unread record without
    /// materializing its payload. Returns `false` when nothing is unread.
    pub fn advance_read_cursor(&mut self) -> Result<bool> {
        if self.is_exhausted() {
            return Ok(false);
        }
        let position = self.read_position;
        let next = position + FRAME_OVERHEAD + self.frame_header_at(position)?.length;
        self.move_cursor(next)?;
        Ok(true)
    }

    fn move_cursor(&mut self, next: u64) -> Result<()> {
        self.read_position = next;
        self.unread -= 1;
        self.persist_cursor()
    }

    fn persist_cursor(&mut self) -> Result<()> {
        self.write_all_at(0, &self.read_position.to_le_bytes())?;
        if self.flush_mode.is_sync() {
            self.file.sync_data().context(IoSnafu { path: &self.path })?;
        }
        Ok(())
    }

    /// Iterates the unread records in order, one frame at a time.
    pub fn unread_records(&self) -> UnreadRecords<'_> {
        UnreadRecords {
            file:     self,
            position: self.read_position,
        }
    }

    pub const fn is_exhausted(&self) -> bool { self.read_position == self.write_position }

    /// File length in bytes, header included.
    pub const fn length(&self) -> u64 { self.write_position }

    pub const fn read_position(&self) -> u64 { self.read_position }

    pub const fn write_position(&self) -> u64 { self.write_position }

    /// Bytes of frames not yet consumed.
    pub const fn remaining_bytes(&self) -> u64 { self.write_position - self.read_position }

    pub const fn unread_count(&self) -> u64 { self.unread }

    /// One past the highest id this file has seen, and never below its
    /// id floor.
    pub const fn next_id(&self) -> u64 { self.next_id }

    pub fn path(&self) -> &Path { &self.path }

    /// Forces all written bytes to stable storage.
    pub fn sync(&self) -> Result<()> { self.file.sync_all().context(IoSnafu { path: &self.path }) }

    /// Closes and deletes the file.
    pub fn dispose(self) -> Result<()> {
        let Self { file, path, .. } = self;
        drop(file);
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e).context(IoSnafu { path }),
            _ => Ok(()),
        }
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset)).context(IoSnafu { path: &self.path })?;
        file.read_exact(buf).context(IoSnafu { path: &self.path })
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset)).context(IoSnafu { path: &self.path })?;
        file.write_all(buf).context(IoSnafu { path: &self.path })
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

/// Iterator over the unread records of a [`RecordFile`].
pub struct UnreadRecords<'a> {
    file:     &'a RecordFile,
    position: u64,
}

impl Iterator for UnreadRecords<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.file.write_position {
            return None;
        }
        match self.file.read_at(self.position) {
            Ok((record, next)) => {
                self.position = next;
                Some(Ok(record))
            }
            Err(e) => {
                self.position = self.file.write_position;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    struct TestFixture {
        _temp_dir: TempDir,
        path:      PathBuf,
    }

    impl TestFixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("queue-file-1");
            Self {
                _temp_dir: temp_dir,
                path,
            }
        }

        fn open(&self) -> RecordFile { RecordFile::open(&self.path, FlushMode::Sync).unwrap() }

        fn raw(&self) -> Vec<u8> { fs::read(&self.path).unwrap() }

        fn write_raw(&self, raw: &[u8]) { fs::write(&self.path, raw).unwrap() }
    }

    fn frame_header(length: u64, id: u64) -> Vec<u8> {
        let mut fields = Vec::with_capacity(FRAME_HEADER_SIZE as usize);
        fields.extend_from_slice(&length.to_le_bytes());
        fields.extend_from_slice(&id.to_le_bytes());
        let crc = checksum(&fields);
        fields.extend_from_slice(&crc.to_le_bytes());
        fields
    }

    #[test]
    fn test_append_and_read() {
        let fixture = TestFixture::new();
        let mut file = fixture.open();
        assert!(file.is_exhausted());
        assert_eq!(file.length(), RECORD_HEADER_SIZE);

        file.append(0, b"first").unwrap();
        file.append(1, b"second").unwrap();
        assert_eq!(file.length(), RECORD_HEADER_SIZE + 2 * FRAME_OVERHEAD + 11);
        assert_eq!(file.unread_count(), 2);
        assert_eq!(file.next_id(), 2);

        let (record, next) = file.read_at(RECORD_HEADER_SIZE).unwrap();
        assert_eq!(record.id, 0);
        assert_eq!(&record.payload[..], b"first");
        let (record, end) = file.read_at(next).unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(&record.payload[..], b"second");
        assert_eq!(end, file.write_position());
    }

    #[test]
    fn test_remove_first_moves_cursor_only() {
        let fixture = TestFixture::new();
        let mut file = fixture.open();
        file.append(0, b"a").unwrap();
        file.append(1, b"b").unwrap();
        let length = file.length();

        let record = file.remove_first().unwrap().unwrap();
        assert_eq!(record.id, 0);
        assert_eq!(&record.payload[..], b"a");
        assert_eq!(file.length(), length);
        assert_eq!(file.unread_count(), 1);

        assert!(file.advance_read_cursor().unwrap());
        assert!(file.is_exhausted());
        assert!(!file.advance_read_cursor().unwrap());
        assert!(file.remove_first().unwrap().is_none());
    }

    #[test]
    fn test_cursor_and_ids_survive_reopen() {
        let fixture = TestFixture::new();
        {
            let mut file = fixture.open();
            for (id, payload) in [(4, b"a"), (9, b"b"), (5, b"c")] {
                file.append(id, payload).unwrap();
            }
            file.remove_first().unwrap();
        }

        let file = fixture.open();
        assert_eq!(file.unread_count(), 2);
        assert_eq!(file.next_id(), 10);
        let head = file.peek_first().unwrap().unwrap();
        assert_eq!(head.id, 9);
        assert_eq!(&head.payload[..], b"b");
    }

    #[test]
    fn test_id_floor_survives_reopen() {
        let fixture = TestFixture::new();
        RecordFile::create(&fixture.path, FlushMode::Sync, 42).unwrap();
        let file = fixture.open();
        assert!(file.is_exhausted());
        assert_eq!(file.next_id(), 42);
    }

    #[test]
    fn test_torn_trailing_frame_is_truncated() {
        let fixture = TestFixture::new();
        let valid_len = {
            let mut file = fixture.open();
            file.append(0, b"intact").unwrap();
            file.length()
        };

        // A verified header promising more bytes than were written.
        let mut raw = fixture.raw();
        raw.extend_from_slice(&frame_header(100, 1));
        raw.extend_from_slice(b"part");
        fixture.write_raw(&raw);

        let file = fixture.open();
        assert_eq!(file.unread_count(), 1);
        assert_eq!(file.length(), valid_len);
        assert_eq!(fs::metadata(&fixture.path).unwrap().len(), valid_len);
    }

    #[test]
    fn test_torn_length_prefix_is_truncated() {
        let fixture = TestFixture::new();
        {
            let mut file = fixture.open();
            file.append(0, b"x").unwrap();
        }
        let mut raw = fixture.raw();
        raw.extend_from_slice(&[1, 2, 3]);
        fixture.write_raw(&raw);

        let file = fixture.open();
        assert_eq!(file.unread_count(), 1);
    }

    #[test]
    fn test_zeroed_tail_is_truncated() {
        let fixture = TestFixture::new();
        let valid_len = {
            let mut file = fixture.open();
            file.append(0, b"x").unwrap();
            file.length()
        };
        let mut raw = fixture.raw();
        raw.extend_from_slice(&[0u8; 64]);
        fixture.write_raw(&raw);

        let file = fixture.open();
        assert_eq!(file.unread_count(), 1);
        assert_eq!(file.length(), valid_len);
    }

    #[test]
    fn test_damaged_length_before_tail_is_corrupt() {
        let fixture = TestFixture::new();
        {
            let mut file = fixture.open();
            file.append(0, b"first").unwrap();
            file.append(1, b"second").unwrap();
        }
        // Grow the first frame's length past EOF; the header checksum no
        // longer matches and intact data follows.
        let mut raw = fixture.raw();
        let at = RECORD_HEADER_SIZE as usize;
        raw[at..at + 8].copy_from_slice(&10_000u64.to_le_bytes());
        fixture.write_raw(&raw);

        let err = RecordFile::open(&fixture.path, FlushMode::Sync).unwrap_err();
        assert!(matches!(err, crate::QueueError::CorruptFrame { .. }));
        assert_eq!(fixture.raw().len(), raw.len());
    }

    #[test]
    fn test_damaged_payload_before_tail_is_corrupt() {
        let fixture = TestFixture::new();
        {
            let mut file = fixture.open();
            file.append(0, b"first").unwrap();
            file.append(1, b"second").unwrap();
        }
        let mut raw = fixture.raw();
        raw[(RECORD_HEADER_SIZE + FRAME_HEADER_SIZE) as usize] ^= 0xff;
        fixture.write_raw(&raw);

        let err = RecordFile::open(&fixture.path, FlushMode::Sync).unwrap_err();
        assert!(matches!(err, crate::QueueError::CorruptFrame { .. }));
    }

    #[test]
    fn test_damaged_last_payload_is_truncated() {
        let fixture = TestFixture::new();
        let first_end = {
            let mut file = fixture.open();
            file.append(0, b"first").unwrap();
            let first_end = file.length();
            file.append(1, b"second").unwrap();
            first_end
        };
        let mut raw = fixture.raw();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fixture.write_raw(&raw);

        let file = fixture.open();
        assert_eq!(file.unread_count(), 1);
        assert_eq!(file.length(), first_end);
    }

    #[test]
    fn test_torn_header_reinitializes() {
        let fixture = TestFixture::new();
        fixture.write_raw(&[1, 2, 3]);
        let file = fixture.open();
        assert!(file.is_exhausted());
        assert_eq!(file.length(), RECORD_HEADER_SIZE);
    }

    #[test]
    fn test_misaligned_cursor_is_corrupt() {
        let fixture = TestFixture::new();
        {
            let mut file = fixture.open();
            file.append(0, b"abcdef").unwrap();
        }
        let mut raw = fixture.raw();
        raw[..8].copy_from_slice(&(RECORD_HEADER_SIZE + 3).to_le_bytes());
        fixture.write_raw(&raw);

        let err = RecordFile::open(&fixture.path, FlushMode::Sync).unwrap_err();
        assert!(matches!(err, crate::QueueError::CorruptFrame { .. }));
    }

    #[test]
    fn test_read_beyond_written_region_is_corrupt() {
        let fixture = TestFixture::new();
        let mut file = fixture.open();
        file.append(0, b"abc").unwrap();
        let err = file.read_at(file.write_position()).unwrap_err();
        assert!(matches!(err, crate::QueueError::CorruptFrame { .. }));
    }

    #[test]
    fn test_unread_records_iterates_in_order() {
        let fixture = TestFixture::new();
        let mut file = fixture.open();
        for i in 0..5u8 {
            file.append(u64::from(i), &[i]).unwrap();
        }
        file.remove_first().unwrap();

        let payloads: Vec<u8> = file
            .unread_records()
            .map(|r| r.unwrap().payload[0])
            .collect();
        assert_eq!(payloads, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_dispose_deletes_file() {
        let fixture = TestFixture::new();
        let file = fixture.open();
        file.dispose().unwrap();
        assert!(!fixture.path.exists());
    }
}
