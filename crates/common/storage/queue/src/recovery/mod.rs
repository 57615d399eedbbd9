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

//! Crash recovery of incomplete transactions.
//!
//! Runs inside the manager's `start()` before any transactional client is
//! admitted. For every transaction the journal holds without a terminal
//! marker:
//! 1. An `ADD` and a `REMOVE` of the same record on the same queue cancel out
//! 2. Remaining `ADD`s are undone by removing that record, if it was applied
//! 3. Remaining `REMOVE`s are restored by appending the item at the tail
//!
//! Restored items therefore come back as the logically last items of their
//! queue. Prepared XA branches are the exception: they stay applied and are
//! handed back to the coordinator as in-doubt.

mod local;
mod xa;

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

pub use self::{
    local::LocalTxQueueTransactionRecoverer,
    xa::{XaRecovery, XaTransactionRecoverer},
};
use crate::{
    QueueItem, QueueStore, Result,
    codec::SharedCodec,
    journal::{JournalOp, OpenTransaction, TransactionId},
};

/// The subset of queue operations recovery needs.
pub trait RecoverableQueueStore<T>: Send + Sync {
    fn name(&self) -> &str;

    /// Appends at the tail regardless of capacity.
    fn put_now(&self, item: T) -> Result<()>;

    /// Removes the record with the given id, if present.
    fn remove_id(&self, id: u64) -> Result<bool>;
}

impl<T: QueueItem> RecoverableQueueStore<T> for QueueStore<T> {
    fn name(&self) -> &str { Self::name(self) }

    fn put_now(&self, item: T) -> Result<()> { Self::put_now(self, item) }

    fn remove_id(&self, id: u64) -> Result<bool> { Self::remove_id(self, id) }
}

/// Looks queues up by name, opening them when needed.
pub trait QueueProvider<T: QueueItem>: Send + Sync {
    fn get_queue(&self, name: &str) -> Result<Arc<QueueStore<T>>>;

    fn get_recoverable_queue(&self, name: &str) -> Result<Arc<dyn RecoverableQueueStore<T>>> {
        let queue: Arc<dyn RecoverableQueueStore<T>> = self.get_queue(name)?;
        Ok(queue)
    }

    /// Disposes the named queue and forgets it.
    fn dispose_queue(&self, name: &str) -> Result<()>;

    /// Bumped every time the provider stops. Transactions begun in an
    /// earlier generation belong to recovery.
    fn generation(&self) -> u64 { 0 }
}

/// What a recovery pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Incomplete transactions found in the journal.
    pub transactions: usize,
    /// Items appended back after an unfinished poll.
    pub restored:     usize,
    /// Items taken out after an unfinished offer.
    pub removed:      usize,
    /// `ADD`/`REMOVE` pairs that cancelled out.
    pub cancelled:    usize,
    /// Prepared XA branches left in doubt.
    pub in_doubt:     usize,
}

/// Reverts the applied effects of one open transaction.
pub(crate) fn undo_transaction<K: TransactionId, T: QueueItem>(
    provider: &dyn QueueProvider<T>,
    codec: &SharedCodec<T>,
    open: &OpenTransaction<K>,
    summary: &mut RecoverySummary,
) -> Result<()> {
    let mut adds: Vec<Option<(&str, u64)>> = Vec::new();
    let mut removes: Vec<(&str, u64, &Bytes)> = Vec::new();
    for entry in &open.entries {
        match &entry.op {
            JournalOp::Add { queue, id, .. } => adds.push(Some((queue.as_str(), *id))),
            JournalOp::Remove { queue, id, item } => removes.push((queue.as_str(), *id, item)),
            JournalOp::Prepare | JournalOp::Commit | JournalOp::Rollback => {}
        }
    }

    let mut restores = Vec::with_capacity(removes.len());
    for (queue, id, payload) in removes {
        match adds.iter_mut().find(|add| **add == Some((queue, id))) {
            Some(add) => {
                *add = None;
                summary.cancelled += 1;
            }
            None => restores.push((queue, payload)),
        }
    }

    for (queue, id) in adds.into_iter().rev().flatten() {
        if provider.get_recoverable_queue(queue)?.remove_id(id)? {
            summary.removed += 1;
        } else {
            warn!(tx = %open.tx, queue, id, "Journaled add was never applied or is already gone");
        }
    }
    for (queue, payload) in restores {
        let item = codec.decode(payload)?;
        provider.get_recoverable_queue(queue)?.put_now(item)?;
        summary.restored += 1;
    }

    debug!(tx = %open.tx, entries = open.entries.len(), "Undid incomplete transaction");
    Ok(())
}
