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

//! Transaction journal.
//!
//! Every transactional mutation is journaled and synced before it is
//! applied to a queue. On restart the journal tells the recoverers which
//! transactions never reached a terminal marker so their effects can be
//! undone (or, for prepared XA branches, held in doubt).
//!
//! # Entry Body
//!
//! ```text
//! ┌────────┬───────────────┬──────────────────────────────────────────────┐
//! │ Op (1B)│ Transaction id│ Operation fields                             │
//! └────────┴───────────────┴──────────────────────────────────────────────┘
//!
//! Add:     [queue len u16][queue][record id u64][item len u32][item]
//! Remove:  [queue len u16][queue][record id u64][item len u32][item]
//! Prepare, Commit, Rollback: no fields
//! ```
//!
//! Integers are little-endian. Bodies are framed by [`file`].

mod file;
mod local;
mod xa;

use std::{fmt, hash::Hash, path::{Path, PathBuf}};

use bytes::{BufMut, Bytes};
use parking_lot::Mutex;
use snafu::{IntoError, OptionExt};
use tracing::{debug, info};

use self::file::JournalFile;
pub use self::local::LocalTxId;
use crate::{
    Result,
    error::{InvalidLifecycleSnafu, JournalCorruptedSnafu, JournalWriteSnafu},
    xa::Xid,
};

/// Journal of local transactions.
pub type LocalTxJournal = TransactionJournal<LocalTxId>;
/// Journal of XA branches.
pub type XaTxJournal = TransactionJournal<Xid>;

/// Identifier type a journal is keyed by.
pub trait TransactionId: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {
    fn encode_into(&self, buf: &mut Vec<u8>);

    fn decode_from(buf: &mut &[u8]) -> Option<Self>;
}

/// Operation recorded by one journal entry.
///
/// `id` is the record id the item has (or gets) in its queue, which lets
/// recovery undo exactly the record a transaction touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    Add {
        queue: String,
        id:    u64,
        item:  Bytes,
    },
    Remove {
        queue: String,
        id:    u64,
        item:  Bytes,
    },
    Prepare,
    Commit,
    Rollback,
}

impl JournalOp {
    const ADD: u8 = 1;
    const COMMIT: u8 = 4;
    const PREPARE: u8 = 3;
    const REMOVE: u8 = 2;
    const ROLLBACK: u8 = 5;

    const fn tag(&self) -> u8 {
        match self {
            Self::Add { .. } => Self::ADD,
            Self::Remove { .. } => Self::REMOVE,
            Self::Prepare => Self::PREPARE,
            Self::Commit => Self::COMMIT,
            Self::Rollback => Self::ROLLBACK,
        }
    }

    /// Commit and rollback end a transaction.
    pub const fn is_terminal(&self) -> bool { matches!(self, Self::Commit | Self::Rollback) }
}

/// One journaled operation of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry<K> {
    pub tx: K,
    pub op: JournalOp,
}

pub(crate) fn take_array<const N: usize>(buf: &mut &[u8]) -> Option<[u8; N]> {
    let (head, rest) = buf.split_first_chunk::<N>()?;
    *buf = rest;
    Some(*head)
}

pub(crate) fn take_slice<'a>(buf: &mut &'a [u8], len: usize) -> Option<&'a [u8]> {
    let (head, rest) = buf.split_at_checked(len)?;
    *buf = rest;
    Some(head)
}

fn put_queue(buf: &mut Vec<u8>, queue: &str) {
    // Queue names longer than u16::MAX bytes are rejected at registration.
    buf.put_u16_le(u16::try_from(queue.len()).unwrap_or(u16::MAX));
    buf.put_slice(&queue.as_bytes()[..queue.len().min(usize::from(u16::MAX))]);
}

fn put_item(buf: &mut Vec<u8>, item: &[u8]) {
    buf.put_u32_le(u32::try_from(item.len()).unwrap_or(u32::MAX));
    buf.put_slice(item);
}

fn take_queue(buf: &mut &[u8]) -> Option<String> {
    let len = u16::from_le_bytes(take_array(buf)?);
    let raw = take_slice(buf, usize::from(len))?;
    String::from_utf8(raw.to_vec()).ok()
}

fn take_item(buf: &mut &[u8]) -> Option<Bytes> {
    let len = u32::from_le_bytes(take_array(buf)?);
    let raw = take_slice(buf, usize::try_from(len).ok()?)?;
    Some(Bytes::copy_from_slice(raw))
}

impl<K: TransactionId> JournalEntry<K> {
    pub const fn new(tx: K, op: JournalOp) -> Self { Self { tx, op } }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.put_u8(self.op.tag());
        self.tx.encode_into(&mut buf);
        match &self.op {
            JournalOp::Add { queue, id, item } | JournalOp::Remove { queue, id, item } => {
                put_queue(&mut buf, queue);
                buf.put_u64_le(*id);
                put_item(&mut buf, item);
            }
            JournalOp::Prepare | JournalOp::Commit | JournalOp::Rollback => {}
        }
        buf
    }

    fn decode(mut body: &[u8]) -> Option<Self> {
        let buf = &mut body;
        let [tag] = take_array::<1>(buf)?;
        let tx = K::decode_from(buf)?;
        let op = match tag {
            JournalOp::ADD => JournalOp::Add {
                queue: take_queue(buf)?,
                id:    u64::from_le_bytes(take_array(buf)?),
                item:  take_item(buf)?,
            },
            JournalOp::REMOVE => JournalOp::Remove {
                queue: take_queue(buf)?,
                id:    u64::from_le_bytes(take_array(buf)?),
                item:  take_item(buf)?,
            },
            JournalOp::PREPARE => JournalOp::Prepare,
            JournalOp::COMMIT => JournalOp::Commit,
            JournalOp::ROLLBACK => JournalOp::Rollback,
            _ => return None,
        };
        buf.is_empty().then_some(Self { tx, op })
    }
}

/// A transaction without a terminal marker, with its entries in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTransaction<K> {
    pub tx:      K,
    pub entries: Vec<JournalEntry<K>>,
}

impl<K> OpenTransaction<K> {
    /// Whether a prepare marker was journaled (XA in-doubt).
    pub fn is_prepared(&self) -> bool { self.entries.iter().any(|e| e.op == JournalOp::Prepare) }
}

/// Journal operations used by transaction contexts and recoverers.
///
/// Each `log_*` call is durable when it returns.
pub trait TxJournal<K: TransactionId>: Send + Sync {
    fn log(&self, entry: JournalEntry<K>) -> Result<()>;

    fn log_add(&self, tx: &K, queue: &str, id: u64, item: Bytes) -> Result<()> {
        self.log(JournalEntry::new(tx.clone(), JournalOp::Add {
            queue: queue.to_owned(),
            id,
            item,
        }))
    }

    fn log_remove(&self, tx: &K, queue: &str, id: u64, item: Bytes) -> Result<()> {
        self.log(JournalEntry::new(tx.clone(), JournalOp::Remove {
            queue: queue.to_owned(),
            id,
            item,
        }))
    }

    fn log_prepare(&self, tx: &K) -> Result<()> { self.log(JournalEntry::new(tx.clone(), JournalOp::Prepare)) }

    fn log_commit(&self, tx: &K) -> Result<()> { self.log(JournalEntry::new(tx.clone(), JournalOp::Commit)) }

    fn log_rollback(&self, tx: &K) -> Result<()> { self.log(JournalEntry::new(tx.clone(), JournalOp::Rollback)) }

    /// Entries of `tx` if it is still open.
    fn entries_for(&self, tx: &K) -> Vec<JournalEntry<K>>;

    /// Open transactions in order of their first entry.
    fn open_transactions(&self) -> Vec<OpenTransaction<K>>;

    /// Forgets every entry and empties the file.
    fn clear(&self) -> Result<()>;

    /// Keeps only the open transactions matching `keep`, compacting the file.
    fn retain(&self, keep: &dyn Fn(&OpenTransaction<K>) -> bool) -> Result<()>;

    fn sync(&self) -> Result<()>;

    /// Releases the file handle; later writes fail.
    fn close(&self) -> Result<()>;
}

struct JournalState<K> {
    file:          Option<JournalFile>,
    open:          Vec<OpenTransaction<K>>,
    recovery_scan: bool,
}

impl<K: TransactionId> JournalState<K> {
    fn index(&mut self, entry: JournalEntry<K>) {
        let position = self.open.iter().position(|open| open.tx == entry.tx);
        match (position, entry.op.is_terminal()) {
            (Some(index), true) => {
                self.open.remove(index);
            }
            (None, true) => {}
            (Some(index), false) => self.open[index].entries.push(entry),
            (None, false) => self.open.push(OpenTransaction {
                tx:      entry.tx.clone(),
                entries: vec![entry],
            }),
        }
    }
}

/// File-backed [`TxJournal`] with an in-memory index of open transactions.
pub struct TransactionJournal<K> {
    path:     PathBuf,
    max_size: u64,
    state:    Mutex<JournalState<K>>,
}

impl<K> fmt::Debug for TransactionJournal<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionJournal")
            .field("path", &self.path)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl<K: TransactionId> TransactionJournal<K> {
    /// Opens the journal at `path` and rebuilds the open-transaction index.
    ///
    /// An entry whose checksum holds but whose body cannot be decoded is
    /// reported as [`JournalCorrupted`](crate::QueueError::JournalCorrupted).
    pub fn open(path: impl AsRef<Path>, max_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (file, raw_entries) = JournalFile::open(&path)?;

        let mut state = JournalState {
            file:          Some(file),
            open:          Vec::new(),
            recovery_scan: false,
        };
        let total = raw_entries.len();
        for raw in raw_entries {
            let entry = JournalEntry::<K>::decode(&raw.body).context(JournalCorruptedSnafu {
                path:   &path,
                offset: raw.offset,
                reason: "malformed entry body",
            })?;
            state.index(entry);
        }

        info!(
            path = ?path,
            entries = total,
            open_transactions = state.open.len(),
            "Opened transaction journal"
        );
        Ok(Self {
            path,
            max_size,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Current file length in bytes.
    pub fn file_len(&self) -> u64 { self.state.lock().file.as_ref().map_or(0, JournalFile::len) }

    fn closed_error() -> crate::QueueError {
        InvalidLifecycleSnafu {
            operation: "write to the transaction journal",
            state:     "closed",
        }
        .build()
    }
}

impl<K: TransactionId> TxJournal<K> for TransactionJournal<K> {
    fn log(&self, entry: JournalEntry<K>) -> Result<()> {
        let body = entry.encode();
        let mut state = self.state.lock();
        let file = state.file.as_mut().ok_or_else(Self::closed_error)?;
        file.append(&body)
            .map_err(|e| JournalWriteSnafu { tx: entry.tx.to_string() }.into_error(e))?;

        let terminal = entry.op.is_terminal();
        state.index(entry);

        if terminal && state.open.is_empty() {
            if let Some(file) = state.file.as_mut() {
                if file.len() > self.max_size {
                    let len = file.len();
                    file.truncate()?;
                    debug!(path = ?self.path, len, "Truncated idle transaction journal");
                }
            }
        }
        Ok(())
    }

    fn entries_for(&self, tx: &K) -> Vec<JournalEntry<K>> {
        self.state
            .lock()
            .open
            .iter()
            .find(|open| open.tx == *tx)
            .map(|open| open.entries.clone())
            .unwrap_or_default()
    }

    fn open_transactions(&self) -> Vec<OpenTransaction<K>> { self.state.lock().open.clone() }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.open.clear();
        let file = state.file.as_mut().ok_or_else(Self::closed_error)?;
        file.truncate()?;
        debug!(path = ?self.path, "Cleared transaction journal");
        Ok(())
    }

    fn retain(&self, keep: &dyn Fn(&OpenTransaction<K>) -> bool) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.open.retain(|open| keep(open));
        let bodies: Vec<Vec<u8>> = state
            .open
            .iter()
            .flat_map(|open| open.entries.iter().map(JournalEntry::encode))
            .collect();
        let file = state.file.as_mut().ok_or_else(Self::closed_error)?;
        file.rewrite(bodies.iter().map(Vec::as_slice))?;
        debug!(
            path = ?self.path,
            retained = state.open.len(),
            len = file.len(),
            "Compacted transaction journal"
        );
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        match self.state.lock().file.as_ref() {
            Some(file) => file.sync(),
            None => Ok(()),
        }
    }

    fn close(&self) -> Result<()> {
        let file = self.state.lock().file.take();
        if let Some(file) = file {
            file.sync()?;
            debug!(path = ?file.path(), "Closed transaction journal");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn open(temp_dir: &TempDir, max_size: u64) -> LocalTxJournal {
        TransactionJournal::open(temp_dir.path().join("queue-tx-log").join("tx.log"), max_size).unwrap()
    }

    fn item(s: &str) -> Bytes { Bytes::copy_from_slice(s.as_bytes()) }

    #[test]
    fn test_entry_encoding() {
        let entries = [
            JournalEntry::new(LocalTxId(9), JournalOp::Add {
                queue: "in".into(),
                id:    7,
                item:  item("payload"),
            }),
            JournalEntry::new(LocalTxId(9), JournalOp::Remove {
                queue: "out/q".into(),
                id:    42,
                item:  item(""),
            }),
            JournalEntry::new(LocalTxId(9), JournalOp::Commit),
        ];
        for entry in entries {
            let decoded = JournalEntry::<LocalTxId>::decode(&entry.encode()).unwrap();
            assert_eq!(decoded, entry);
        }
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut body = JournalEntry::new(LocalTxId(1), JournalOp::Rollback).encode();
        body.push(0);
        assert!(JournalEntry::<LocalTxId>::decode(&body).is_none());
        assert!(JournalEntry::<LocalTxId>::decode(&[99, 0, 0, 0, 0, 0, 0, 0, 0]).is_none());
    }

    #[test]
    fn test_index_tracks_open_transactions() {
        let temp_dir = TempDir::new().unwrap();
        let journal = open(&temp_dir, u64::MAX);
        let (a, b) = (LocalTxId(1), LocalTxId(2));

        journal.log_add(&a, "q", 0, item("x")).unwrap();
        journal.log_remove(&b, "q", 0, item("y")).unwrap();
        journal.log_add(&a, "q", 1, item("z")).unwrap();
        assert_eq!(journal.entries_for(&a).len(), 2);
        assert_eq!(journal.open_transactions().len(), 2);

        journal.log_commit(&a).unwrap();
        assert!(journal.entries_for(&a).is_empty());
        let open = journal.open_transactions();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].tx, b);
    }

    #[test]
    fn test_open_transactions_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let journal = open(&temp_dir, u64::MAX);
            journal.log_add(&LocalTxId(1), "q", 0, item("committed")).unwrap();
            journal.log_commit(&LocalTxId(1)).unwrap();
            journal.log_add(&LocalTxId(2), "q", 1, item("pending")).unwrap();
        }
        let journal = open(&temp_dir, u64::MAX);
        let open = journal.open_transactions();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].tx, LocalTxId(2));
        assert_eq!(open[0].entries[0].op, JournalOp::Add {
            queue: "q".into(),
            id:    1,
            item:  item("pending"),
        });
    }

    #[test]
    fn test_idle_journal_is_truncated_past_max_size() {
        let temp_dir = TempDir::new().unwrap();
        let journal = open(&temp_dir, 64);
        for i in 0..4 {
            journal.log_add(&LocalTxId(i), "q", i, item("0123456789")).unwrap();
        }
        assert!(journal.file_len() > 64);
        for i in 0..3 {
            journal.log_commit(&LocalTxId(i)).unwrap();
        }
        // One transaction is still open, nothing is dropped.
        assert!(journal.file_len() > 64);
        journal.log_rollback(&LocalTxId(3)).unwrap();
        assert_eq!(journal.file_len(), 0);
    }

    #[test]
    fn test_retain_compacts_file() {
        let temp_dir = TempDir::new().unwrap();
        {
            let journal = open(&temp_dir, u64::MAX);
            journal.log_add(&LocalTxId(1), "q", 0, item("drop")).unwrap();
            journal.log_add(&LocalTxId(2), "q", 1, item("keep")).unwrap();
            journal.log_prepare(&LocalTxId(2)).unwrap();
            journal.retain(&OpenTransaction::is_prepared).unwrap();
            assert_eq!(journal.open_transactions().len(), 1);
        }
        let journal = open(&temp_dir, u64::MAX);
        let open = journal.open_transactions();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].tx, LocalTxId(2));
        assert!(open[0].is_prepared());
    }

    #[test]
    fn test_clear_and_close() {
        let temp_dir = TempDir::new().unwrap();
        let journal = open(&temp_dir, u64::MAX);
        journal.log_add(&LocalTxId(1), "q", 0, item("x")).unwrap();
        journal.clear().unwrap();
        assert!(journal.open_transactions().is_empty());
        assert_eq!(journal.file_len(), 0);

        journal.close().unwrap();
        let err = journal.log_commit(&LocalTxId(1)).unwrap_err();
        assert!(matches!(err, crate::QueueError::InvalidLifecycle { .. }));
    }
}
