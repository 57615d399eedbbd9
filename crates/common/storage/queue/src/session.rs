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

//! Client sessions and queue handles.
//!
//! A [`QueueSession`] owns at most one local transaction at a time. Every
//! [`Queue`] handle obtained from it routes operations through that
//! transaction while one is active and straight to the store otherwise.
//! Handles from an [`XaQueueSession`](crate::XaQueueSession) do the same
//! with the branch associated by `start`.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use snafu::{OptionExt, ensure};
use tracing::{debug, warn};

use crate::{
    QueueItem, QueueStore, Result,
    codec::SharedCodec,
    error::{InternalSnafu, InvalidLifecycleSnafu, NoActiveTransactionSnafu, TransactionAlreadyActiveSnafu},
    journal::{LocalTxId, TxJournal},
    recovery::QueueProvider,
    transaction::{LocalTransactionContext, QueueTransactionContext},
    xa::XaSessionState,
};

pub(crate) struct LocalSessionState<T: QueueItem> {
    provider: Arc<dyn QueueProvider<T>>,
    journal:  Arc<dyn TxJournal<LocalTxId>>,
    codec:    SharedCodec<T>,
    timeout:  Duration,
    tx_ids:   Arc<AtomicU64>,
    current:  Mutex<Option<LocalTransactionContext<T>>>,
    began_in: AtomicU64,
}

impl<T: QueueItem> LocalSessionState<T> {
    /// Drops a transaction begun before the manager last stopped. Recovery
    /// has already repaired its journaled work, so it is not rolled back.
    fn discard_stale(&self, current: &mut Option<LocalTransactionContext<T>>) -> bool {
        if current.is_none() || self.began_in.load(Ordering::SeqCst) == self.provider.generation() {
            return false;
        }
        if let Some(context) = current.take() {
            warn!(tx = %context.tx(), "Discarding transaction interrupted by a manager stop");
        }
        true
    }

    fn ensure_current(&self, current: &mut Option<LocalTransactionContext<T>>) -> Result<()> {
        ensure!(!self.discard_stale(current), InvalidLifecycleSnafu {
            operation: "complete a transaction begun before stop",
            state:     "restarted",
        });
        Ok(())
    }
}

/// A client session with local transaction demarcation.
pub struct QueueSession<T: QueueItem> {
    state: Arc<LocalSessionState<T>>,
}

impl<T: QueueItem> QueueSession<T> {
    pub(crate) fn new(
        provider: Arc<dyn QueueProvider<T>>,
        journal: Arc<dyn TxJournal<LocalTxId>>,
        codec: SharedCodec<T>,
        timeout: Duration,
        tx_ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            state: Arc::new(LocalSessionState {
                provider,
                journal,
                codec,
                timeout,
                tx_ids,
                current: Mutex::new(None),
                began_in: AtomicU64::new(0),
            }),
        }
    }

    /// Handle on the named queue bound to this session.
    pub fn get_queue(&self, name: &str) -> Result<Queue<T>> {
        let store = self.state.provider.get_queue(name)?;
        Ok(Queue {
            store,
            binding: Binding::Local(Arc::clone(&self.state)),
        })
    }

    pub fn begin(&self) -> Result<()> {
        let mut current = self.state.current.lock();
        self.state.discard_stale(&mut current);
        ensure!(current.is_none(), TransactionAlreadyActiveSnafu);
        self.state.began_in.store(self.state.provider.generation(), Ordering::SeqCst);
        let tx = LocalTxId(self.state.tx_ids.fetch_add(1, Ordering::SeqCst));
        debug!(tx = %tx, "Began local transaction");
        *current = Some(LocalTransactionContext::new(
            tx,
            Arc::clone(&self.state.journal),
            Arc::clone(&self.state.codec),
            self.state.timeout,
        ));
        Ok(())
    }

    /// Commits the active transaction. If the commit cannot be journaled the
    /// transaction stays active; [`rollback`](Self::rollback) still works.
    pub fn commit(&self) -> Result<()> {
        let mut current = self.state.current.lock();
        self.state.ensure_current(&mut current)?;
        let context = current.as_mut().context(NoActiveTransactionSnafu)?;
        context.do_commit()?;
        *current = None;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        let mut current = self.state.current.lock();
        self.state.ensure_current(&mut current)?;
        let mut context = current.take().context(NoActiveTransactionSnafu)?;
        drop(current);
        context.do_rollback()
    }

    pub fn is_in_transaction(&self) -> bool { self.state.current.lock().is_some() }
}

impl<T: QueueItem> Drop for QueueSession<T> {
    fn drop(&mut self) {
        let mut current = self.state.current.lock();
        self.state.discard_stale(&mut current);
        let abandoned = current.take();
        drop(current);
        if let Some(mut context) = abandoned {
            warn!(tx = %context.tx(), "Session dropped with an active transaction, rolling back");
            if let Err(e) = context.do_rollback() {
                warn!(tx = %context.tx(), error = %e, "Rollback of abandoned transaction failed");
            }
        }
    }
}

enum Binding<T: QueueItem> {
    Local(Arc<LocalSessionState<T>>),
    Xa(Arc<XaSessionState<T>>),
}

/// A queue as seen from one session.
pub struct Queue<T: QueueItem> {
    store:   Arc<QueueStore<T>>,
    binding: Binding<T>,
}

impl<T: QueueItem> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").field("store", &self.store).finish_non_exhaustive()
    }
}

impl<T: QueueItem> Queue<T> {
    pub(crate) const fn xa(store: Arc<QueueStore<T>>, state: Arc<XaSessionState<T>>) -> Self {
        Self {
            store,
            binding: Binding::Xa(state),
        }
    }

    fn dispatch<R>(
        &self,
        in_tx: impl FnOnce(&mut dyn QueueTransactionContext<T>, &Arc<QueueStore<T>>) -> Result<R>,
        direct: impl FnOnce(&QueueStore<T>) -> Result<R>,
    ) -> Result<R> {
        match &self.binding {
            Binding::Local(state) => {
                let mut current = state.current.lock();
                state.ensure_current(&mut current)?;
                if let Some(context) = current.as_mut() {
                    return in_tx(context as &mut dyn QueueTransactionContext<T>, &self.store);
                }
                drop(current);
                direct(&self.store)
            }
            Binding::Xa(state) => state
                .with_branch(|context| in_tx(context, &self.store))
                .unwrap_or_else(|| direct(&self.store)),
        }
    }

    fn provider(&self) -> &dyn QueueProvider<T> {
        match &self.binding {
            Binding::Local(state) => state.provider.as_ref(),
            Binding::Xa(state) => state.provider(),
        }
    }

    pub fn name(&self) -> &str { self.store.name() }

    /// Appends `item`, waiting as long as it takes for capacity.
    pub fn put(&self, item: T) -> Result<()> {
        let added = self.dispatch(
            |context, store| context.offer(store, item.clone(), Duration::MAX),
            |store| store.put(item.clone()).map(|()| true),
        )?;
        ensure!(added, InternalSnafu {
            message: "unbounded put returned without adding",
        });
        Ok(())
    }

    /// Removes the head, waiting as long as it takes.
    pub fn take(&self) -> Result<T> {
        self.dispatch(
            |context, store| {
                context.poll(store, Duration::MAX)?.context(InternalSnafu {
                    message: "unbounded take returned without an item",
                })
            },
            QueueStore::take,
        )
    }

    /// Appends `item`; `false` if the queue stayed full for `timeout`.
    pub fn offer(&self, item: T, timeout: Duration) -> Result<bool> {
        self.dispatch(
            |context, store| context.offer(store, item.clone(), timeout),
            |store| store.offer(item.clone(), 0, timeout),
        )
    }

    /// Removes the head; `None` if the queue stayed empty for `timeout`.
    pub fn poll(&self, timeout: Duration) -> Result<Option<T>> {
        self.dispatch(
            |context, store| context.poll(store, timeout),
            |store| store.poll(timeout),
        )
    }

    /// Reads the head without removing it. Never transactional.
    pub fn peek(&self) -> Result<Option<T>> { self.store.peek() }

    /// Puts `item` back at the head.
    pub fn untake(&self, item: T) -> Result<()> {
        self.dispatch(
            |context, store| context.untake(store, item.clone()),
            |store| store.untake(item.clone()),
        )
    }

    pub fn size(&self) -> usize { self.store.size() }

    pub fn is_empty(&self) -> bool { self.store.is_empty() }

    pub fn contains(&self, item: &T) -> Result<bool> { self.store.contains(item) }

    /// Removes every item. Inside a transaction each removal is journaled and
    /// a rollback restores the queue in its original order.
    pub fn clear(&self) -> Result<()> {
        self.dispatch(
            |context, store| context.clear(store).map(|_| ()),
            QueueStore::clear,
        )
    }

    /// Deletes the queue and its persisted data.
    pub fn dispose(self) -> Result<()> { self.provider().dispose_queue(self.store.name()) }
}
