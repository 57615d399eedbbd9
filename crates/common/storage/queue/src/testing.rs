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

//! Fault and timing decorators for tests.
//!
//! These wrap the real journal, backend and codec rather than replacing
//! them, so tests exercise the production paths with one behaviour changed.
//!
//! Compiled for this crate's own tests and behind the `testing` feature.

use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use snafu::IntoError;

use crate::{
    FlushMode, QueueItem, QueueStore, Result,
    codec::{Codec, SharedCodec},
    error::JournalWriteSnafu,
    journal::{JournalEntry, JournalOp, OpenTransaction, TransactionId, TxJournal},
    recovery::QueueProvider,
    store::{QueueKind, QueueStoreBackend, StoredItem},
};

/// Journal whose commit markers can be made to fail on demand.
pub struct FailingJournal<K> {
    inner:        Arc<dyn TxJournal<K>>,
    fail_commits: AtomicBool,
}

impl<K: TransactionId> FailingJournal<K> {
    pub fn new(inner: Arc<dyn TxJournal<K>>) -> Self {
        Self {
            inner,
            fail_commits: AtomicBool::new(false),
        }
    }

    pub fn fail_commits(&self, fail: bool) { self.fail_commits.store(fail, Ordering::SeqCst); }
}

impl<K: TransactionId> TxJournal<K> for FailingJournal<K> {
    fn log(&self, entry: JournalEntry<K>) -> Result<()> {
        if entry.op == JournalOp::Commit && self.fail_commits.load(Ordering::SeqCst) {
            return Err(JournalWriteSnafu {
                tx: entry.tx.to_string(),
            }
            .into_error(io::Error::other("injected commit failure")));
        }
        self.inner.log(entry)
    }

    fn entries_for(&self, tx: &K) -> Vec<JournalEntry<K>> { self.inner.entries_for(tx) }

    fn open_transactions(&self) -> Vec<OpenTransaction<K>> { self.inner.open_transactions() }

    fn clear(&self) -> Result<()> { self.inner.clear() }

    fn retain(&self, keep: &dyn Fn(&OpenTransaction<K>) -> bool) -> Result<()> { self.inner.retain(keep) }

    fn sync(&self) -> Result<()> { self.inner.sync() }

    fn close(&self) -> Result<()> { self.inner.close() }
}

/// Backend that sleeps before every append and removal.
pub struct DelayedBackend<T> {
    inner: Box<dyn QueueStoreBackend<T>>,
    delay: Duration,
}

impl<T> DelayedBackend<T> {
    pub fn new(inner: Box<dyn QueueStoreBackend<T>>, delay: Duration) -> Self { Self { inner, delay } }
}

impl<T: QueueItem> QueueStoreBackend<T> for DelayedBackend<T> {
    fn kind(&self) -> QueueKind { self.inner.kind() }

    fn size(&self) -> usize { self.inner.size() }

    fn next_id(&self) -> u64 { self.inner.next_id() }

    fn offer_last(&mut self, item: T) -> Result<bool> {
        thread::sleep(self.delay);
        self.inner.offer_last(item)
    }

    fn force_last(&mut self, item: T) -> Result<u64> {
        thread::sleep(self.delay);
        self.inner.force_last(item)
    }

    fn offer_first(&mut self, item: T) -> Result<u64> {
        thread::sleep(self.delay);
        self.inner.offer_first(item)
    }

    fn peek_first(&mut self) -> Result<Option<StoredItem<T>>> { self.inner.peek_first() }

    fn poll_first(&mut self) -> Result<Option<StoredItem<T>>> {
        thread::sleep(self.delay);
        self.inner.poll_first()
    }

    fn contains(&mut self, item: &T) -> Result<bool> { self.inner.contains(item) }

    fn remove(&mut self, item: &T) -> Result<bool> { self.inner.remove(item) }

    fn remove_id(&mut self, id: u64) -> Result<bool> {
        thread::sleep(self.delay);
        self.inner.remove_id(id)
    }

    fn clear(&mut self) -> Result<()> { self.inner.clear() }

    fn close(self: Box<Self>) -> Result<()> { self.inner.close() }

    fn dispose(self: Box<Self>) -> Result<()> { self.inner.dispose() }
}

/// Codec that counts decode calls.
pub struct CountingCodec<T> {
    inner:   SharedCodec<T>,
    decodes: Arc<AtomicUsize>,
}

impl<T> CountingCodec<T> {
    /// Returns the codec and a handle on its decode counter.
    pub fn new(inner: SharedCodec<T>) -> (Self, Arc<AtomicUsize>) {
        let decodes = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                decodes: Arc::clone(&decodes),
            },
            decodes,
        )
    }
}

impl<T> Codec<T> for CountingCodec<T> {
    fn encode(&self, item: &T) -> Result<Bytes> { self.inner.encode(item) }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        self.inner.decode(bytes)
    }
}

enum Storage<T> {
    Transient,
    Persistent { root: PathBuf, codec: SharedCodec<T> },
}

/// Queue provider over a fixed set of lazily opened queues.
pub struct StaticQueueProvider<T> {
    storage: Storage<T>,
    names:   Vec<String>,
    queues:  Mutex<HashMap<String, Arc<QueueStore<T>>>>,
}

impl<T: QueueItem> StaticQueueProvider<T> {
    pub fn transient<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_storage(Storage::Transient, names)
    }

    /// Persistent queues under `root`, one directory per name.
    pub fn persistent<I, S>(root: impl Into<PathBuf>, codec: SharedCodec<T>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_storage(
            Storage::Persistent {
                root: root.into(),
                codec,
            },
            names,
        )
    }

    fn with_storage<I, S>(storage: Storage<T>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            storage,
            names: names.into_iter().map(Into::into).collect(),
            queues: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: QueueItem> QueueProvider<T> for StaticQueueProvider<T> {
    fn get_queue(&self, name: &str) -> Result<Arc<QueueStore<T>>> {
        snafu::ensure!(
            self.names.iter().any(|known| known == name),
            crate::error::InternalSnafu {
                message: format!("unknown test queue {name}"),
            }
        );
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(name) {
            return Ok(Arc::clone(queue));
        }
        let queue = Arc::new(match &self.storage {
            Storage::Transient => QueueStore::transient(name, None),
            Storage::Persistent { root, codec } => QueueStore::persistent(
                name,
                root.join(name),
                None,
                Arc::clone(codec),
                1024 * 1024,
                FlushMode::Async,
            )?,
        });
        queues.insert(name.to_owned(), Arc::clone(&queue));
        Ok(queue)
    }

    fn dispose_queue(&self, name: &str) -> Result<()> {
        let queue = self.queues.lock().remove(name);
        match queue {
            Some(queue) => queue.dispose(),
            None => Ok(()),
        }
    }
}
