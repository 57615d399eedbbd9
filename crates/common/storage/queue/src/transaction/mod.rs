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

//! Transaction contexts.
//!
//! A context applies its work to the queues right away and remembers how
//! to undo it. Persistent queues additionally journal each operation under
//! the queue lock before it is applied, so that a crash at any point can be
//! repaired by the recoverer. Every queue a context touches is locked for
//! the context's lifetime.
//!
//! ```text
//!   begin ──▶ OPEN ──do_commit──▶ COMMITTED
//!              │
//!              └──do_rollback──▶ ROLLED_BACK
//! ```

mod adapter;
pub mod lock;
mod persistent;
mod transient;

use std::{sync::Arc, time::Duration};

use tracing::warn;

pub use self::{
    adapter::QueueTypeTransactionContextAdapter, persistent::PersistentTransactionContext,
    transient::TransientTransactionContext,
};
use self::lock::LockOwner;
use crate::{
    QueueItem, QueueStore, Result,
    error::TransactionNotActiveSnafu,
    journal::LocalTxId,
    xa::Xid,
};

/// Context of a local transaction.
pub type LocalTransactionContext<T> = QueueTypeTransactionContextAdapter<LocalTxId, T>;
/// Context of an XA branch.
pub type XaTransactionContext<T> = QueueTypeTransactionContextAdapter<Xid, T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum TxStatus {
    #[display("open")]
    Open,
    #[display("committed")]
    Committed,
    #[display("rolled back")]
    RolledBack,
}

/// Queue operations performed inside a transaction.
pub trait QueueTransactionContext<T>: Send {
    /// Appends `item`, waiting up to `timeout` for capacity.
    fn offer(&mut self, queue: &Arc<QueueStore<T>>, item: T, timeout: Duration) -> Result<bool>;

    /// Removes the head, waiting up to `timeout`.
    fn poll(&mut self, queue: &Arc<QueueStore<T>>, timeout: Duration) -> Result<Option<T>>;

    /// Puts `item` back at the head.
    fn untake(&mut self, queue: &Arc<QueueStore<T>>, item: T) -> Result<()>;

    /// Removes every item of `queue`. Rolling back puts them back in their
    /// original order. Returns how many items were removed.
    fn clear(&mut self, queue: &Arc<QueueStore<T>>) -> Result<usize>;

    fn do_commit(&mut self) -> Result<()>;

    fn do_rollback(&mut self) -> Result<()>;

    fn status(&self) -> TxStatus;
}

/// Applied change and the queue it was applied to. An added item is
/// identified by its record id, so undoing it never touches an equal item
/// that was already queued.
pub(crate) enum PendingOp<T> {
    Added { queue: Arc<QueueStore<T>>, id: u64, item: T },
    Removed { queue: Arc<QueueStore<T>>, item: T },
}

impl<T> PendingOp<T> {
    pub(crate) const fn queue(&self) -> &Arc<QueueStore<T>> {
        match self {
            Self::Added { queue, .. } | Self::Removed { queue, .. } => queue,
        }
    }
}

/// Reverts applied changes, newest first.
pub(crate) fn undo<T: QueueItem>(ops: Vec<PendingOp<T>>) -> Result<()> {
    for op in ops.into_iter().rev() {
        match op {
            PendingOp::Added { queue, id, item } => {
                if !queue.remove_id(id)? {
                    warn!(queue = %queue.name(), id, item = ?item, "Item added by the transaction was already gone");
                }
            }
            PendingOp::Removed { queue, item } => queue.untake(item)?,
        }
    }
    Ok(())
}

/// Queue locks held by one transaction.
pub(crate) struct LockSet<T> {
    owner:   LockOwner,
    timeout: Duration,
    held:    Vec<Arc<QueueStore<T>>>,
}

impl<T: QueueItem> LockSet<T> {
    pub(crate) const fn new(owner: LockOwner, timeout: Duration) -> Self {
        Self {
            owner,
            timeout,
            held: Vec::new(),
        }
    }

    pub(crate) fn acquire(&mut self, queue: &Arc<QueueStore<T>>) -> Result<()> {
        if self.held.iter().any(|held| Arc::ptr_eq(held, queue)) {
            return Ok(());
        }
        queue.tx_lock().acquire(self.owner, self.timeout)?;
        self.held.push(Arc::clone(queue));
        Ok(())
    }
}

impl<T> LockSet<T> {
    pub(crate) fn release_all(&mut self) {
        for queue in self.held.drain(..) {
            queue.tx_lock().release(self.owner);
        }
    }
}

impl<T> Drop for LockSet<T> {
    fn drop(&mut self) { self.release_all(); }
}

pub(crate) fn ensure_open(tx: &impl std::fmt::Display, status: TxStatus) -> Result<()> {
    if status == TxStatus::Open {
        Ok(())
    } else {
        TransactionNotActiveSnafu {
            tx:     tx.to_string(),
            status: status.to_string(),
        }
        .fail()
    }
}
