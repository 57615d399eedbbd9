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

//! Unbounded FIFO over two rotating record files.
//!
//! ```text
//!   SINGLE (write == read)                 ROTATED (write != read)
//!  ┌──────────────┐  write.length >=       ┌──────────────┐  ┌──────────────┐
//!  │ queue-file-1 │  max_file_size   ───▶  │ queue-file-1 │  │ queue-file-2 │
//!  │  read+write  │  on add_last           │     read     │  │    write     │
//!  └──────────────┘                        └──────────────┘  └──────────────┘
//!         ▲                                        │ read file drained
//!         └────────────────────────────────────────┘ (observed by the next read)
//! ```
//!
//! While rotated the write file keeps growing until the read file drains;
//! an item is never split across files. Consuming the last record of the
//! read file leaves the pair rotated: the next poll or peek notices the
//! drained file, deletes it and rewrites the control file.
//!
//! Inserting at the head and removing an arbitrary item rewrite one file
//! into a scratch file which then atomically replaces it, so frames are
//! never edited in place. Records keep their ids through a rewrite.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use snafu::ResultExt;
use tracing::{debug, info, warn};

use super::{QueueKind, QueueStoreBackend, StoredItem};
use crate::{
    FlushMode, QueueItem, Result,
    codec::SharedCodec,
    control_file::{ControlFile, FilePair, FileRef},
    error::IoSnafu,
    path::{control_file_path, record_file_path, rewrite_file_path},
    record_file::{Record, RecordFile},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Read,
    Write,
}

/// Where [`DualFileQueueStore::find`] located a record.
#[derive(Debug, Clone, Copy)]
struct Found {
    slot:    Slot,
    id:      u64,
    is_head: bool,
}

/// Persistent queue backend.
pub struct DualFileQueueStore<T> {
    dir:           PathBuf,
    codec:         SharedCodec<T>,
    max_file_size: u64,
    flush_mode:    FlushMode,
    control:       ControlFile,
    pair:          FilePair,
    write_file:    RecordFile,
    /// Present only while rotated.
    read_file:     Option<RecordFile>,
    size:          usize,
    next_id:       u64,
}

impl<T> std::fmt::Debug for DualFileQueueStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualFileQueueStore")
            .field("dir", &self.dir)
            .field("pair", &self.pair)
            .field("size", &self.size)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl<T: QueueItem> DualFileQueueStore<T> {
    /// Opens the store in `dir`, creating it when absent.
    ///
    /// Record files named by the control file but missing on disk start
    /// empty. A drained file left behind by an interrupted rotation is
    /// removed.
    pub fn open(
        dir: impl AsRef<Path>,
        codec: SharedCodec<T>,
        max_file_size: u64,
        flush_mode: FlushMode,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context(IoSnafu { path: &dir })?;

        let scratch = rewrite_file_path(&dir);
        if scratch.exists() {
            warn!(path = ?scratch, "Discarding unfinished record file rewrite");
            fs::remove_file(&scratch).context(IoSnafu { path: &scratch })?;
        }

        let control_path = control_file_path(&dir);
        let had_control = fs::metadata(&control_path).is_ok_and(|m| m.len() > 0);
        let mut control = ControlFile::open(&control_path)?;
        let pair = control.read()?;

        if had_control {
            for file in [pair.write, pair.read] {
                let path = record_file_path(&dir, file);
                if !path.exists() {
                    warn!(path = ?path, "Record file named by the control file is missing, starting it empty");
                }
            }
        }

        let write_file = RecordFile::open(record_file_path(&dir, pair.write), flush_mode)?;
        let read_file = if pair.is_rotated() {
            Some(RecordFile::open(record_file_path(&dir, pair.read), flush_mode)?)
        } else {
            Self::discard_stale(&dir, pair.write.other(), flush_mode)?;
            None
        };
        control.write(pair)?;

        let unread = write_file.unread_count() + read_file.as_ref().map_or(0, RecordFile::unread_count);
        let next_id = write_file
            .next_id()
            .max(read_file.as_ref().map_or(0, RecordFile::next_id));
        let mut store = Self {
            dir,
            codec,
            max_file_size,
            flush_mode,
            control,
            pair,
            write_file,
            read_file,
            size: usize::try_from(unread).unwrap_or(usize::MAX),
            next_id,
        };
        store.refresh_read_file()?;

        info!(
            dir = ?store.dir,
            size = store.size,
            write = %store.pair.write,
            read = %store.pair.read,
            "Opened persistent queue store"
        );
        Ok(store)
    }

    fn discard_stale(dir: &Path, file: FileRef, flush_mode: FlushMode) -> Result<()> {
        let path = record_file_path(dir, file);
        if !path.exists() {
            return Ok(());
        }
        let stale = RecordFile::open(&path, flush_mode)?;
        if stale.unread_count() == 0 {
            debug!(path = ?path, "Removing drained record file left by a previous rotation");
            stale.dispose()
        } else {
            warn!(
                path = ?path,
                unread = stale.unread_count(),
                "Ignoring record file not referenced by the control file"
            );
            Ok(())
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Appends an encoded item, rotating first when the write file is full.
    /// Returns the id of the new record.
    pub fn add_last(&mut self, payload: &[u8]) -> Result<u64> {
        if self.read_file.is_none() && self.write_file.length() >= self.max_file_size {
            self.rotate()?;
        }
        let id = self.allocate_id();
        self.write_file.append(id, payload)?;
        self.size += 1;
        Ok(id)
    }

    fn rotate(&mut self) -> Result<()> {
        let next = self.pair.write.other();
        let fresh = RecordFile::create(record_file_path(&self.dir, next), self.flush_mode, self.next_id)?;
        let pair = FilePair {
            write: next,
            read:  self.pair.write,
        };
        self.control.write(pair)?;
        let previous = std::mem::replace(&mut self.write_file, fresh);
        debug!(
            dir = ?self.dir,
            write = %pair.write,
            read = %pair.read,
            length = previous.length(),
            "Rotated record files"
        );
        self.read_file = Some(previous);
        self.pair = pair;
        Ok(())
    }

    /// Collapses back to a single file once the read file is drained.
    fn refresh_read_file(&mut self) -> Result<()> {
        if !self.read_file.as_ref().is_some_and(RecordFile::is_exhausted) {
            return Ok(());
        }
        let pair = FilePair {
            write: self.pair.write,
            read:  self.pair.write,
        };
        self.control.write(pair)?;
        self.pair = pair;
        if let Some(drained) = self.read_file.take() {
            debug!(dir = ?self.dir, path = ?drained.path(), "Read file drained, back to a single record file");
            drained.dispose()?;
        }
        Ok(())
    }

    /// Consumes the oldest record.
    pub fn remove_first(&mut self) -> Result<Option<Record>> {
        self.refresh_read_file()?;
        let record = self.file_mut(Slot::Read).remove_first()?;
        if record.is_some() {
            self.size -= 1;
        }
        Ok(record)
    }

    /// Returns the oldest record without consuming it.
    ///
    /// Like [`remove_first`](Self::remove_first) this first drops a drained
    /// read file, so a peek may update the control file.
    pub fn peek_first(&mut self) -> Result<Option<Record>> {
        self.refresh_read_file()?;
        self.file(Slot::Read).peek_first()
    }

    /// Inserts an encoded item ahead of every other record and returns its
    /// id.
    pub fn add_first(&mut self, payload: &[u8]) -> Result<u64> {
        self.refresh_read_file()?;
        let id = self.allocate_id();
        self.rewrite(Slot::Read, Some((id, payload)), None)?;
        self.size += 1;
        Ok(id)
    }

    /// Bytes held by the store: the whole write file plus what is left
    /// unread in the read file while rotated.
    pub fn get_length(&self) -> u64 {
        self.write_file.length() + self.read_file.as_ref().map_or(0, RecordFile::remaining_bytes)
    }

    pub const fn file_pair(&self) -> FilePair { self.pair }

    pub fn dir(&self) -> &Path { &self.dir }

    fn slots(&self) -> &'static [Slot] {
        if self.read_file.is_some() { &[Slot::Read, Slot::Write] } else { &[Slot::Read] }
    }

    fn file(&self, slot: Slot) -> &RecordFile {
        match (slot, self.read_file.as_ref()) {
            (Slot::Read, Some(read)) => read,
            _ => &self.write_file,
        }
    }

    fn file_mut(&mut self, slot: Slot) -> &mut RecordFile {
        match (slot, self.read_file.as_mut()) {
            (Slot::Read, Some(read)) => read,
            _ => &mut self.write_file,
        }
    }

    const fn file_ref(&self, slot: Slot) -> FileRef {
        match slot {
            Slot::Read => self.pair.read,
            Slot::Write => self.pair.write,
        }
    }

    /// Finds the first unread record accepted by `matches`, oldest first.
    fn find<F>(&self, mut matches: F) -> Result<Option<Found>>
    where
        F: FnMut(&Record) -> Result<bool>,
    {
        let mut is_head = true;
        for &slot in self.slots() {
            for record in self.file(slot).unread_records() {
                let record = record?;
                if matches(&record)? {
                    return Ok(Some(Found {
                        slot,
                        id: record.id,
                        is_head: is_head && slot == Slot::Read,
                    }));
                }
                is_head = false;
            }
        }
        Ok(None)
    }

    fn remove_found(&mut self, found: Found) -> Result<()> {
        if found.is_head {
            self.remove_first()?;
            return Ok(());
        }
        self.rewrite(found.slot, None, Some(found.id))?;
        self.size -= 1;
        self.refresh_read_file()
    }

    /// Replaces one file with a copy holding `head` first and skipping the
    /// record with id `skip`.
    fn rewrite(&mut self, slot: Slot, head: Option<(u64, &[u8])>, skip: Option<u64>) -> Result<()> {
        let target = record_file_path(&self.dir, self.file_ref(slot));
        let scratch_path = rewrite_file_path(&self.dir);
        {
            let mut scratch = RecordFile::create(&scratch_path, FlushMode::Async, self.next_id)?;
            if let Some((id, payload)) = head {
                scratch.append(id, payload)?;
            }
            for record in self.file(slot).unread_records() {
                let record = record?;
                if Some(record.id) != skip {
                    scratch.append(record.id, &record.payload)?;
                }
            }
            scratch.sync()?;
        }
        fs::rename(&scratch_path, &target).context(IoSnafu { path: &target })?;
        *self.file_mut(slot) = RecordFile::open(&target, self.flush_mode)?;
        debug!(path = ?target, "Rewrote record file");
        Ok(())
    }

    fn decode_record(&self, record: Record) -> Result<StoredItem<T>> {
        Ok(StoredItem {
            id:   record.id,
            item: self.codec.decode(&record.payload)?,
        })
    }
}

impl<T: QueueItem> QueueStoreBackend<T> for DualFileQueueStore<T> {
    fn kind(&self) -> QueueKind { QueueKind::Persistent }

    fn size(&self) -> usize { self.size }

    fn next_id(&self) -> u64 { self.next_id }

    fn offer_last(&mut self, item: T) -> Result<bool> {
        let payload = self.codec.encode(&item)?;
        self.add_last(&payload)?;
        Ok(true)
    }

    fn force_last(&mut self, item: T) -> Result<u64> {
        let payload = self.codec.encode(&item)?;
        self.add_last(&payload)
    }

    fn offer_first(&mut self, item: T) -> Result<u64> {
        let payload = self.codec.encode(&item)?;
        self.add_first(&payload)
    }

    fn peek_first(&mut self) -> Result<Option<StoredItem<T>>> {
        DualFileQueueStore::peek_first(self)?
            .map(|record| self.decode_record(record))
            .transpose()
    }

    fn poll_first(&mut self) -> Result<Option<StoredItem<T>>> {
        self.remove_first()?
            .map(|record| self.decode_record(record))
            .transpose()
    }

    fn contains(&mut self, item: &T) -> Result<bool> {
        let codec = self.codec.clone();
        Ok(self
            .find(|record| Ok(codec.decode(&record.payload)? == *item))?
            .is_some())
    }

    fn remove(&mut self, item: &T) -> Result<bool> {
        let codec = self.codec.clone();
        match self.find(|record| Ok(codec.decode(&record.payload)? == *item))? {
            Some(found) => self.remove_found(found).map(|()| true),
            None => Ok(false),
        }
    }

    fn remove_id(&mut self, id: u64) -> Result<bool> {
        match self.find(|record| Ok(record.id == id))? {
            Some(found) => self.remove_found(found).map(|()| true),
            None => Ok(false),
        }
    }

    fn clear(&mut self) -> Result<()> {
        if let Some(read) = self.read_file.take() {
            read.dispose()?;
        }
        let fresh = RecordFile::create(
            record_file_path(&self.dir, FileRef::DEFAULT),
            self.flush_mode,
            self.next_id,
        )?;
        let previous = std::mem::replace(&mut self.write_file, fresh);
        if self.pair.write == FileRef::DEFAULT {
            drop(previous);
        } else {
            previous.dispose()?;
        }
        self.control.write(FilePair::DEFAULT)?;
        self.pair = FilePair::DEFAULT;
        self.size = 0;
        debug!(dir = ?self.dir, "Cleared persistent queue store");
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.write_file.sync()?;
        if let Some(read) = &self.read_file {
            read.sync()?;
        }
        let Self { control, dir, .. } = *self;
        control.dispose()?;
        debug!(dir = ?dir, "Closed persistent queue store");
        Ok(())
    }

    fn dispose(self: Box<Self>) -> Result<()> {
        let Self {
            dir,
            control,
            write_file,
            read_file,
            ..
        } = *self;
        if let Some(read) = read_file {
            read.dispose()?;
        }
        write_file.dispose()?;
        control.delete()?;
        match fs::remove_dir(&dir) {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                warn!(dir = ?dir, error = %e, "Queue directory not removed after dispose");
            }
            _ => {}
        }
        info!(dir = ?dir, "Disposed persistent queue store");
        Ok(())
    }
}
