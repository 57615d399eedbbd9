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

use std::{sync::Arc, time::Duration};

use super::{
    PersistentTransactionContext, QueueTransactionContext, TransientTransactionContext, TxStatus, ensure_open,
    lock::LockOwner,
};
use crate::{
    QueueItem, QueueStore, Result,
    codec::SharedCodec,
    journal::{TransactionId, TxJournal},
    store::QueueKind,
};

/// Routes each operation to the persistent or transient context according
/// to the kind of queue it targets.
///
/// Both inner contexts share one lock owner, so a queue locked by either is
/// re-entrant for the whole transaction.
pub struct QueueTypeTransactionContextAdapter<K: TransactionId, T> {
    tx:         K,
    persistent: PersistentTransactionContext<K, T>,
    transient:  TransientTransactionContext<K, T>,
    status:     TxStatus,
}

impl<K: TransactionId, T: QueueItem> QueueTypeTransactionContextAdapter<K, T> {
    pub fn new(tx: K, journal: Arc<dyn TxJournal<K>>, codec: SharedCodec<T>, lock_timeout: Duration) -> Self {
        let owner = LockOwner::next();
        Self {
            persistent: PersistentTransactionContext::new(tx.clone(), journal, codec, owner, lock_timeout),
            transient: TransientTransactionContext::new(tx.clone(), owner, lock_timeout),
            tx,
            status: TxStatus::Open,
        }
    }

    /// Wraps a persistent context rebuilt from the journal.
    pub(crate) fn recovered(persistent: PersistentTransactionContext<K, T>) -> Self {
        let tx = persistent.tx().clone();
        Self {
            transient: TransientTransactionContext::new(tx.clone(), LockOwner::next(), Duration::ZERO),
            persistent,
            tx,
            status: TxStatus::Open,
        }
    }

    pub const fn tx(&self) -> &K { &self.tx }

    /// Whether any queue was changed by this transaction.
    pub fn has_work(&self) -> bool { self.persistent.is_journaled() || self.transient.has_work() }

    /// Journals the prepare marker for the persistent part. Returns `false`
    /// when the transaction changed nothing and can be treated as read-only.
    pub fn prepare(&mut self) -> Result<bool> {
        ensure_open(&self.tx, self.status)?;
        let journaled = self.persistent.prepare()?;
        Ok(journaled || self.transient.has_work())
    }

    fn context_for(&mut self, queue: &QueueStore<T>) -> &mut dyn QueueTransactionContext<T> {
        match queue.kind() {
            QueueKind::Persistent => &mut self.persistent,
            QueueKind::Transient => &mut self.transient,
        }
    }
}

impl<K: TransactionId, T: QueueItem> QueueTransactionContext<T> for QueueTypeTransactionContextAdapter<K, T> {
    fn offer(&mut self, queue: &Arc<QueueStore<T>>, item: T, timeout: Duration) -> Result<bool> {
        self.context_for(queue).offer(queue, item, timeout)
    }

    fn poll(&mut self, queue: &Arc<QueueStore<T>>, timeout: Duration) -> Result<Option<T>> {
        self.context_for(queue).poll(queue, timeout)
    }

    fn untake(&mut self, queue: &Arc<QueueStore<T>>, item: T) -> Result<()> {
        self.context_for(queue).untake(queue, item)
    }

    fn clear(&mut self, queue: &Arc<QueueStore<T>>) -> Result<usize> { self.context_for(queue).clear(queue) }

    fn do_commit(&mut self) -> Result<()> {
        ensure_open(&self.tx, self.status)?;
        self.persistent.do_commit()?;
        self.transient.do_commit()?;
        self.status = TxStatus::Committed;
        Ok(())
    }

    fn do_rollback(&mut self) -> Result<()> {
        ensure_open(&self.tx, self.status)?;
        let persistent = self.persistent.do_rollback();
        let transient = self.transient.do_rollback();
        self.status = TxStatus::RolledBack;
        persistent.and(transient)
    }

    fn status(&self) -> TxStatus { self.status }
}
