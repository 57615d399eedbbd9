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

use std::{fmt, sync::Arc, time::Duration};

use tracing::debug;

use super::{LockSet, PendingOp, QueueTransactionContext, TxStatus, ensure_open, lock::LockOwner, undo};
use crate::{QueueItem, QueueStore, Result, queue::deadline_after};

/// Unjournaled context for transient queues. Its effects are lost with the
/// process, so there is nothing to recover.
pub struct TransientTransactionContext<K, T> {
    tx:      K,
    locks:   LockSet<T>,
    pending: Vec<PendingOp<T>>,
    status:  TxStatus,
}

impl<K: fmt::Display + Send, T: QueueItem> TransientTransactionContext<K, T> {
    pub const fn new(tx: K, owner: LockOwner, lock_timeout: Duration) -> Self {
        Self {
            tx,
            locks: LockSet::new(owner, lock_timeout),
            pending: Vec::new(),
            status: TxStatus::Open,
        }
    }

    pub fn has_work(&self) -> bool { !self.pending.is_empty() }
}

impl<K: fmt::Display + Send, T: QueueItem> QueueTransactionContext<T> for TransientTransactionContext<K, T> {
    fn offer(&mut self, queue: &Arc<QueueStore<T>>, item: T, timeout: Duration) -> Result<bool> {
        ensure_open(&self.tx, self.status)?;
        self.locks.acquire(queue)?;
        let mut assigned = None;
        let added = queue.offer_with(item.clone(), deadline_after(timeout), |id, _| {
            assigned = Some(id);
            Ok(())
        })?;
        if let (true, Some(id)) = (added, assigned) {
            self.pending.push(PendingOp::Added {
                queue: Arc::clone(queue),
                id,
                item,
            });
        }
        Ok(added)
    }

    fn poll(&mut self, queue: &Arc<QueueStore<T>>, timeout: Duration) -> Result<Option<T>> {
        ensure_open(&self.tx, self.status)?;
        self.locks.acquire(queue)?;
        let polled = queue.poll(timeout)?;
        if let Some(item) = &polled {
            self.pending.push(PendingOp::Removed {
                queue: Arc::clone(queue),
                item:  item.clone(),
            });
        }
        Ok(polled)
    }

    fn untake(&mut self, queue: &Arc<QueueStore<T>>, item: T) -> Result<()> {
        ensure_open(&self.tx, self.status)?;
        self.locks.acquire(queue)?;
        let id = queue.untake_with(item.clone(), |_, _| Ok(()))?;
        self.pending.push(PendingOp::Added {
            queue: Arc::clone(queue),
            id,
            item,
        });
        Ok(())
    }

    fn clear(&mut self, queue: &Arc<QueueStore<T>>) -> Result<usize> {
        ensure_open(&self.tx, self.status)?;
        self.locks.acquire(queue)?;
        let mut drained = Vec::new();
        let result = queue.drain_with(|head| {
            drained.push(head.item.clone());
            Ok(())
        });
        let count = drained.len();
        self.pending.extend(drained.into_iter().map(|item| PendingOp::Removed {
            queue: Arc::clone(queue),
            item,
        }));
        result?;
        Ok(count)
    }

    fn do_commit(&mut self) -> Result<()> {
        ensure_open(&self.tx, self.status)?;
        self.pending.clear();
        self.status = TxStatus::Committed;
        self.locks.release_all();
        debug!(tx = %self.tx, "Committed transient transaction context");
        Ok(())
    }

    fn do_rollback(&mut self) -> Result<()> {
        ensure_open(&self.tx, self.status)?;
        undo(std::mem::take(&mut self.pending))?;
        self.status = TxStatus::RolledBack;
        self.locks.release_all();
        debug!(tx = %self.tx, "Rolled back transient transaction context");
        Ok(())
    }

    fn status(&self) -> TxStatus { self.status }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::LocalTxId;

    fn context(tx: u64) -> TransientTransactionContext<LocalTxId, i32> {
        TransientTransactionContext::new(LocalTxId(tx), LockOwner::next(), Duration::from_millis(50))
    }

    #[test]
    fn test_commit_keeps_effects() {
        let queue = Arc::new(QueueStore::transient("t", None));
        let mut ctx = context(1);
        ctx.offer(&queue, 1, Duration::ZERO).unwrap();
        ctx.offer(&queue, 2, Duration::ZERO).unwrap();
        assert!(ctx.has_work());
        ctx.do_commit().unwrap();
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.tx_lock().holder(), None);
    }

    #[test]
    fn test_rollback_reverts_in_reverse_order() {
        let queue = Arc::new(QueueStore::transient("t", None));
        queue.put(1).unwrap();
        queue.put(2).unwrap();

        let mut ctx = context(1);
        assert_eq!(ctx.poll(&queue, Duration::ZERO).unwrap(), Some(1));
        assert_eq!(ctx.poll(&queue, Duration::ZERO).unwrap(), Some(2));
        ctx.offer(&queue, 3, Duration::ZERO).unwrap();
        ctx.do_rollback().unwrap();

        assert_eq!(queue.poll(Duration::ZERO).unwrap(), Some(1));
        assert_eq!(queue.poll(Duration::ZERO).unwrap(), Some(2));
        assert_eq!(queue.poll(Duration::ZERO).unwrap(), None);
    }

    #[test]
    fn test_rollback_keeps_duplicate_order() {
        let queue = Arc::new(QueueStore::transient("t", None));
        queue.put(1).unwrap();
        queue.put(2).unwrap();

        let mut ctx = context(1);
        ctx.offer(&queue, 1, Duration::ZERO).unwrap();
        ctx.do_rollback().unwrap();

        assert_eq!(queue.poll(Duration::ZERO).unwrap(), Some(1));
        assert_eq!(queue.poll(Duration::ZERO).unwrap(), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear_commit_and_rollback() {
        let queue = Arc::new(QueueStore::transient("t", None));
        queue.put(1).unwrap();
        queue.put(2).unwrap();

        let mut rolled_back = context(1);
        assert_eq!(rolled_back.clear(&queue).unwrap(), 2);
        assert!(queue.is_empty());
        rolled_back.do_rollback().unwrap();
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.peek().unwrap(), Some(1));

        let mut committed = context(2);
        committed.clear(&queue).unwrap();
        committed.do_commit().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_offer_is_not_recorded() {
        let queue = Arc::new(QueueStore::transient("t", Some(1)));
        queue.put(0).unwrap();
        let mut ctx = context(1);
        assert!(!ctx.offer(&queue, 1, Duration::ZERO).unwrap());
        assert!(!ctx.has_work());
        ctx.do_rollback().unwrap();
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_poll_on_empty_queue_times_out() {
        let queue = Arc::new(QueueStore::<i32>::transient("t", None));
        let mut ctx = context(1);
        assert_eq!(ctx.poll(&queue, Duration::from_millis(10)).unwrap(), None);
    }
}
