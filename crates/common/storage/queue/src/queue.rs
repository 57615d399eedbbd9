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

//! Thread-safe queue facade with capacity and blocking semantics.
//!
//! A [`QueueStore`] wraps one backend behind a mutex and two condition
//! variables (`not_empty`, `not_full`) that are signalled on every state
//! change. Blocking calls wait against an absolute deadline and re-check
//! their condition after every wake-up.
//!
//! ## Usage
//!
//! ```ignore
//! let queue = QueueStore::transient("jobs", Some(100));
//! queue.put("a".to_string())?;
//! let item = queue.poll(Duration::from_millis(10))?;
//! ```

use std::{
    fmt,
    path::Path,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use snafu::{OptionExt, ensure};
use tracing::debug;

use crate::{
    FlushMode, QueueItem, Result,
    codec::SharedCodec,
    error::{InternalSnafu, QueueDisposedSnafu},
    store::{DualFileQueueStore, InMemoryQueueStore, QueueKind, QueueStoreBackend, StoredItem},
    transaction::lock::TxLock,
};

type Backend<T> = Option<Box<dyn QueueStoreBackend<T>>>;

/// Converts a relative timeout to an absolute deadline; `None` when the
/// timeout is too large to represent, which waits forever.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> { Instant::now().checked_add(timeout) }

/// A named queue shared across threads.
pub struct QueueStore<T> {
    name:      String,
    kind:      QueueKind,
    capacity:  Option<usize>,
    backend:   Mutex<Backend<T>>,
    not_empty: Condvar,
    not_full:  Condvar,
    tx_lock:   TxLock,
}

impl<T> fmt::Debug for QueueStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueStore")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl<T> QueueStore<T> {
    pub fn name(&self) -> &str { &self.name }

    pub const fn kind(&self) -> QueueKind { self.kind }

    pub const fn is_persistent(&self) -> bool { self.kind.is_persistent() }

    pub const fn capacity(&self) -> Option<usize> { self.capacity }

    pub(crate) const fn tx_lock(&self) -> &TxLock { &self.tx_lock }
}

impl<T: QueueItem> QueueStore<T> {
    pub fn new(
        name: impl Into<String>,
        capacity: Option<usize>,
        backend: Box<dyn QueueStoreBackend<T>>,
    ) -> Self {
        let name = name.into();
        Self {
            kind: backend.kind(),
            capacity,
            backend: Mutex::new(Some(backend)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            tx_lock: TxLock::new(name.clone()),
            name,
        }
    }

    /// In-memory queue; contents are lost on close.
    pub fn transient(name: impl Into<String>, capacity: Option<usize>) -> Self {
        Self::new(name, capacity, Box::new(InMemoryQueueStore::new(capacity)))
    }

    /// Queue persisted in `dir` as rotating record files.
    pub fn persistent(
        name: impl Into<String>,
        dir: impl AsRef<Path>,
        capacity: Option<usize>,
        codec: SharedCodec<T>,
        max_file_size: u64,
        flush_mode: FlushMode,
    ) -> Result<Self> {
        let backend = DualFileQueueStore::open(dir, codec, max_file_size, flush_mode)?;
        Ok(Self::new(name, capacity, Box::new(backend)))
    }

    fn has_room(&self, size: usize) -> bool { self.capacity.is_none_or(|capacity| size < capacity) }

    fn live<'a>(&self, guard: &'a mut MutexGuard<'_, Backend<T>>) -> Result<&'a mut Box<dyn QueueStoreBackend<T>>> {
        guard.as_mut().context(QueueDisposedSnafu { name: &self.name })
    }

    fn wait(condvar: &Condvar, guard: &mut MutexGuard<'_, Backend<T>>, deadline: Option<Instant>) -> bool {
        match deadline {
            Some(deadline) => condvar.wait_until(guard, deadline).timed_out(),
            None => {
                condvar.wait(guard);
                false
            }
        }
    }

    /// Appends `item`, waiting up to `timeout` for capacity.
    ///
    /// Returns `false` if the queue stayed full. `priority` is accepted for
    /// API compatibility and ignored; ordering is strictly FIFO.
    pub fn offer(&self, item: T, _priority: i32, timeout: Duration) -> Result<bool> {
        self.offer_with(item, deadline_after(timeout), |_, _| Ok(()))
    }

    /// Appends `item`, waiting as long as it takes for capacity.
    pub fn put(&self, item: T) -> Result<()> {
        self.offer_with(item, None, |_, _| Ok(()))?;
        Ok(())
    }

    /// Like [`offer`](Self::offer) but runs `before_apply` under the queue
    /// lock right before the item is appended, passing the id the new
    /// record will get. If the hook fails nothing is appended and its error
    /// is returned.
    pub fn offer_with<F>(&self, item: T, deadline: Option<Instant>, before_apply: F) -> Result<bool>
    where
        F: FnOnce(u64, &T) -> Result<()>,
    {
        let mut guard = self.backend.lock();
        loop {
            let backend = self.live(&mut guard)?;
            if self.has_room(backend.size()) {
                before_apply(backend.next_id(), &item)?;
                let added = backend.offer_last(item)?;
                if added {
                    self.not_empty.notify_all();
                }
                return Ok(added);
            }
            if Self::wait(&self.not_full, &mut guard, deadline) {
                let backend = self.live(&mut guard)?;
                if !self.has_room(backend.size()) {
                    return Ok(false);
                }
            }
        }
    }

    /// Removes the head, waiting up to `timeout` for one to arrive.
    ///
    /// A zero timeout tries exactly once.
    pub fn poll(&self, timeout: Duration) -> Result<Option<T>> {
        self.poll_internal(deadline_after(timeout), None::<fn(&StoredItem<T>) -> Result<()>>)
    }

    /// Removes the head, waiting as long as it takes.
    pub fn take(&self) -> Result<T> {
        self.poll_internal(None, None::<fn(&StoredItem<T>) -> Result<()>>)?
            .context(InternalSnafu {
                message: "unbounded take returned without an item",
            })
    }

    /// Like [`poll`](Self::poll) but runs `before_remove` on the head under
    /// the queue lock right before it is removed. If the hook fails the
    /// head stays in place and its error is returned.
    pub fn poll_with<F>(&self, deadline: Option<Instant>, before_remove: F) -> Result<Option<T>>
    where
        F: FnOnce(&StoredItem<T>) -> Result<()>,
    {
        self.poll_internal(deadline, Some(before_remove))
    }

    fn poll_internal<F>(&self, deadline: Option<Instant>, mut before_remove: Option<F>) -> Result<Option<T>>
    where
        F: FnOnce(&StoredItem<T>) -> Result<()>,
    {
        let mut guard = self.backend.lock();
        loop {
            let backend = self.live(&mut guard)?;
            if backend.size() > 0 {
                let stored = match before_remove.take() {
                    Some(hook) => {
                        let head = backend.peek_first()?.context(InternalSnafu {
                            message: "non-empty queue has no head",
                        })?;
                        hook(&head)?;
                        backend.poll_first()?;
                        head
                    }
                    None => backend.poll_first()?.context(InternalSnafu {
                        message: "non-empty queue has no head",
                    })?,
                };
                self.not_full.notify_all();
                return Ok(Some(stored.item));
            }
            if Self::wait(&self.not_empty, &mut guard, deadline) {
                let backend = self.live(&mut guard)?;
                if backend.size() == 0 {
                    return Ok(None);
                }
            }
        }
    }

    /// Returns the head without removing it.
    pub fn peek(&self) -> Result<Option<T>> {
        let mut guard = self.backend.lock();
        Ok(self.live(&mut guard)?.peek_first()?.map(|stored| stored.item))
    }

    /// Puts `item` back at the head, ignoring capacity.
    pub fn untake(&self, item: T) -> Result<()> {
        self.untake_with(item, |_, _| Ok(()))?;
        Ok(())
    }

    /// Like [`untake`](Self::untake) with a hook run under the queue lock,
    /// given the id the record will get. Returns that id.
    pub fn untake_with<F>(&self, item: T, before_apply: F) -> Result<u64>
    where
        F: FnOnce(u64, &T) -> Result<()>,
    {
        let mut guard = self.backend.lock();
        let backend = self.live(&mut guard)?;
        before_apply(backend.next_id(), &item)?;
        let id = backend.offer_first(item)?;
        self.not_empty.notify_all();
        Ok(id)
    }

    /// Appends at the tail ignoring capacity. Used by recovery.
    pub fn put_now(&self, item: T) -> Result<()> {
        let mut guard = self.backend.lock();
        self.live(&mut guard)?.force_last(item)?;
        self.not_empty.notify_all();
        Ok(())
    }

    /// Removes the first item equal to `item`.
    pub fn remove(&self, item: &T) -> Result<bool> {
        let mut guard = self.backend.lock();
        let removed = self.live(&mut guard)?.remove(item)?;
        if removed {
            self.not_full.notify_all();
        }
        Ok(removed)
    }

    /// Removes the record with the given id, wherever it sits.
    pub fn remove_id(&self, id: u64) -> Result<bool> {
        let mut guard = self.backend.lock();
        let removed = self.live(&mut guard)?.remove_id(id)?;
        if removed {
            self.not_full.notify_all();
        }
        Ok(removed)
    }

    pub fn contains(&self, item: &T) -> Result<bool> {
        let mut guard = self.backend.lock();
        self.live(&mut guard)?.contains(item)
    }

    /// Number of items; zero once closed.
    pub fn size(&self) -> usize { self.backend.lock().as_ref().map_or(0, |backend| backend.size()) }

    pub fn is_empty(&self) -> bool { self.size() == 0 }

    pub fn clear(&self) -> Result<()> {
        let mut guard = self.backend.lock();
        self.live(&mut guard)?.clear()?;
        self.not_full.notify_all();
        Ok(())
    }

    /// Removes every item, handing each to `before_remove` under the queue
    /// lock first. Items already handed over are gone even if a later hook
    /// call fails.
    pub fn drain_with<F>(&self, mut before_remove: F) -> Result<usize>
    where
        F: FnMut(&StoredItem<T>) -> Result<()>,
    {
        let mut guard = self.backend.lock();
        let backend = self.live(&mut guard)?;
        let mut drained = 0;
        while let Some(head) = backend.peek_first()? {
            before_remove(&head)?;
            backend.poll_first()?;
            drained += 1;
        }
        if drained > 0 {
            self.not_full.notify_all();
        }
        Ok(drained)
    }

    pub fn is_closed(&self) -> bool { self.backend.lock().is_none() }

    /// Attaches a freshly opened backend to a closed queue, so handles
    /// taken before the close keep working. Fails if the queue is open.
    pub fn reopen(&self, backend: Box<dyn QueueStoreBackend<T>>) -> Result<()> {
        let mut guard = self.backend.lock();
        ensure!(
            guard.is_none(),
            InternalSnafu {
                message: format!("queue '{}' is already open", self.name),
            }
        );
        *guard = Some(backend);
        drop(guard);
        self.tx_lock.reset();
        self.wake_all();
        debug!(queue = %self.name, "Reopened queue store");
        Ok(())
    }

    /// Releases the backend, keeping persisted data. Blocked callers fail
    /// with [`QueueDisposed`](crate::QueueError::QueueDisposed).
    pub fn close(&self) -> Result<()> {
        let backend = self.backend.lock().take();
        self.wake_all();
        if let Some(backend) = backend {
            backend.close()?;
            debug!(queue = %self.name, "Closed queue store");
        }
        Ok(())
    }

    /// Releases the backend and deletes persisted data.
    pub fn dispose(&self) -> Result<()> {
        let backend = self.backend.lock().take();
        self.wake_all();
        if let Some(backend) = backend {
            backend.dispose()?;
            debug!(queue = %self.name, "Disposed queue store");
        }
        Ok(())
    }

    fn wake_all(&self) {
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}
