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

use tracing::debug;

use super::{LockSet, PendingOp, QueueTransactionContext, TxStatus, ensure_open, lock::LockOwner, undo};
use crate::{
    QueueItem, QueueStore, Result,
    codec::SharedCodec,
    journal::{TransactionId, TxJournal},
    queue::deadline_after,
};

/// Journaled context for persistent queues.
pub struct PersistentTransactionContext<K: TransactionId, T> {
    tx:        K,
    journal:   Arc<dyn TxJournal<K>>,
    codec:     SharedCodec<T>,
    locks:     LockSet<T>,
    pending:   Vec<PendingOp<T>>,
    journaled: bool,
    status:    TxStatus,
}

impl<K: TransactionId, T: QueueItem> PersistentTransactionContext<K, T> {
    pub fn new(
        tx: K,
        journal: Arc<dyn TxJournal<K>>,
        codec: SharedCodec<T>,
        owner: LockOwner,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            tx,
            journal,
            codec,
            locks: LockSet::new(owner, lock_timeout),
            pending: Vec::new(),
            journaled: false,
            status: TxStatus::Open,
        }
    }

    /// Rebuilds a context whose effects are already applied and journaled,
    /// as found in the journal after a restart.
    ///
    /// The queues it touched are locked again, as they were before the
    /// restart, until the context commits or rolls back. Fails with
    /// [`LockTimeout`](crate::QueueError::LockTimeout) if another
    /// transaction holds one of them.
    pub(crate) fn recovered(
        tx: K,
        journal: Arc<dyn TxJournal<K>>,
        codec: SharedCodec<T>,
        pending: Vec<PendingOp<T>>,
    ) -> Result<Self> {
        let mut locks = LockSet::new(LockOwner::next(), Duration::ZERO);
        for op in &pending {
            locks.acquire(op.queue())?;
        }
        Ok(Self {
            tx,
            journal,
            codec,
            locks,
            pending,
            journaled: true,
            status: TxStatus::Open,
        })
    }

    pub const fn tx(&self) -> &K { &self.tx }

    /// Whether any entry for this transaction reached the journal.
    pub const fn is_journaled(&self) -> bool { self.journaled }

    /// Journals the prepare marker. Returns `false`, writing nothing, when
    /// the transaction did no journaled work.
    pub fn prepare(&mut self) -> Result<bool> {
        ensure_open(&self.tx, self.status)?;
        if !self.journaled {
            return Ok(false);
        }
        self.journal.log_prepare(&self.tx)?;
        Ok(true)
    }
}

impl<K: TransactionId, T: QueueItem> QueueTransactionContext<T> for PersistentTransactionContext<K, T> {
    fn offer(&mut self, queue: &Arc<QueueStore<T>>, item: T, timeout: Duration) -> Result<bool> {
        ensure_open(&self.tx, self.status)?;
        self.locks.acquire(queue)?;
        let payload = self.codec.encode(&item)?;

        let (journal, tx) = (&self.journal, &self.tx);
        let mut logged = None;
        let result = queue.offer_with(item.clone(), deadline_after(timeout), |id, _| {
            journal.log_add(tx, queue.name(), id, payload)?;
            logged = Some(id);
            Ok(())
        });
        self.journaled |= logged.is_some();

        let added = result?;
        if let (true, Some(id)) = (added, logged) {
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

        let (journal, tx, codec) = (&self.journal, &self.tx, &self.codec);
        let mut logged = false;
        let result = queue.poll_with(deadline_after(timeout), |head| {
            let payload = codec.encode(&head.item)?;
            journal.log_remove(tx, queue.name(), head.id, payload)?;
            logged = true;
            Ok(())
        });
        self.journaled |= logged;

        let polled = result?;
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
        let payload = self.codec.encode(&item)?;

        let (journal, tx) = (&self.journal, &self.tx);
        let mut logged = false;
        let result = queue.untake_with(item.clone(), |id, _| {
            journal.log_add(tx, queue.name(), id, payload)?;
            logged = true;
            Ok(())
        });
        self.journaled |= logged;

        let id = result?;
        self.pending.push(PendingOp::Added {
            queue: Arc::clone(queue),
            id,
            item,
        });
        Ok(())
    }

    /// Journals a REMOVE for every item before it leaves the queue.
    fn clear(&mut self, queue: &Arc<QueueStore<T>>) -> Result<usize> {
        ensure_open(&self.tx, self.status)?;
        self.locks.acquire(queue)?;

        let (journal, tx, codec) = (&self.journal, &self.tx, &self.codec);
        let mut drained = Vec::new();
        let result = queue.drain_with(|head| {
            let payload = codec.encode(&head.item)?;
            journal.log_remove(tx, queue.name(), head.id, payload)?;
            drained.push(head.item.clone());
            Ok(())
        });
        self.journaled |= !drained.is_empty();

        let count = drained.len();
        self.pending.extend(drained.into_iter().map(|item| PendingOp::Removed {
            queue: Arc::clone(queue),
            item,
        }));
        result?;
        debug!(tx = %self.tx, queue = %queue.name(), count, "Cleared queue in transaction");
        Ok(count)
    }

    /// Journals the commit marker. If that fails the context stays open
    /// with its effects applied, so the caller can retry or roll back.
    fn do_commit(&mut self) -> Result<()> {
        ensure_open(&self.tx, self.status)?;
        if self.journaled {
            self.journal.log_commit(&self.tx)?;
        }
        self.pending.clear();
        self.status = TxStatus::Committed;
        self.locks.release_all();
        debug!(tx = %self.tx, "Committed persistent transaction context");
        Ok(())
    }

    fn do_rollback(&mut self) -> Result<()> {
        ensure_open(&self.tx, self.status)?;
        undo(std::mem::take(&mut self.pending))?;
        if self.journaled {
            self.journal.log_rollback(&self.tx)?;
        }
        self.status = TxStatus::RolledBack;
        self.locks.release_all();
        debug!(tx = %self.tx, "Rolled back persistent transaction context");
        Ok(())
    }

    fn status(&self) -> TxStatus { self.status }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        FlushMode,
        codec::BincodeCodec,
        journal::{JournalOp, LocalTxId, LocalTxJournal},
        testing::FailingJournal,
    };

    struct TestFixture {
        _temp_dir: TempDir,
        journal:   Arc<LocalTxJournal>,
        queue:     Arc<QueueStore<String>>,
    }

    impl TestFixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let journal = Arc::new(LocalTxJournal::open(temp_dir.path().join("tx.log"), u64::MAX).unwrap());
            let queue = Arc::new(
                QueueStore::persistent(
                    "q",
                    temp_dir.path().join("q"),
                    None,
                    Arc::new(BincodeCodec),
                    1024,
                    FlushMode::Sync,
                )
                .unwrap(),
            );
            Self {
                _temp_dir: temp_dir,
                journal,
                queue,
            }
        }

        fn context(&self, tx: u64, journal: Arc<dyn TxJournal<LocalTxId>>) -> PersistentTransactionContext<LocalTxId, String> {
            PersistentTransactionContext::new(
                LocalTxId(tx),
                journal,
                Arc::new(BincodeCodec),
                LockOwner::next(),
                Duration::from_millis(100),
            )
        }
    }

    #[test]
    fn test_offer_journals_and_applies() {
        let fixture = TestFixture::new();
        let mut ctx = fixture.context(1, fixture.journal.clone());

        assert!(ctx.offer(&fixture.queue, "a".into(), Duration::ZERO).unwrap());
        assert_eq!(fixture.queue.size(), 1);
        let entries = fixture.journal.entries_for(&LocalTxId(1));
        assert_eq!(entries.len(), 1);
        assert!(matches!(&entries[0].op, JournalOp::Add { queue, .. } if queue == "q"));

        ctx.do_commit().unwrap();
        assert_eq!(ctx.status(), TxStatus::Committed);
        assert!(fixture.journal.open_transactions().is_empty());
        assert_eq!(fixture.queue.tx_lock().holder(), None);
    }

    #[test]
    fn test_rollback_restores_queue() {
        let fixture = TestFixture::new();
        fixture.queue.put("existing".into()).unwrap();

        let mut ctx = fixture.context(1, fixture.journal.clone());
        assert_eq!(ctx.poll(&fixture.queue, Duration::ZERO).unwrap(), Some("existing".into()));
        ctx.offer(&fixture.queue, "new".into(), Duration::ZERO).unwrap();
        assert_eq!(fixture.queue.size(), 1);

        ctx.do_rollback().unwrap();
        assert_eq!(ctx.status(), TxStatus::RolledBack);
        assert_eq!(fixture.queue.size(), 1);
        assert_eq!(fixture.queue.take().unwrap(), "existing");
        assert!(fixture.journal.open_transactions().is_empty());
    }

    #[test]
    fn test_untake_is_journaled_as_add() {
        let fixture = TestFixture::new();
        fixture.queue.put("b".into()).unwrap();
        let mut ctx = fixture.context(1, fixture.journal.clone());
        ctx.untake(&fixture.queue, "a".into()).unwrap();
        assert_eq!(fixture.queue.peek().unwrap(), Some("a".into()));
        assert!(matches!(
            fixture.journal.entries_for(&LocalTxId(1))[0].op,
            JournalOp::Add { .. }
        ));
        ctx.do_rollback().unwrap();
        assert_eq!(fixture.queue.peek().unwrap(), Some("b".into()));
    }

    #[test]
    fn test_failed_commit_leaves_context_open() {
        let fixture = TestFixture::new();
        let failing = Arc::new(FailingJournal::<LocalTxId>::new(fixture.journal.clone()));
        let mut ctx = fixture.context(1, failing.clone());

        ctx.offer(&fixture.queue, "x".into(), Duration::ZERO).unwrap();
        failing.fail_commits(true);
        assert!(matches!(ctx.do_commit(), Err(crate::QueueError::JournalWrite { .. })));
        assert_eq!(ctx.status(), TxStatus::Open);
        assert_eq!(fixture.queue.size(), 1);

        failing.fail_commits(false);
        ctx.do_commit().unwrap();
    }

    #[test]
    fn test_closed_context_rejects_work() {
        let fixture = TestFixture::new();
        let mut ctx = fixture.context(1, fixture.journal.clone());
        ctx.do_commit().unwrap();
        let err = ctx.offer(&fixture.queue, "late".into(), Duration::ZERO).unwrap_err();
        assert!(matches!(err, crate::QueueError::TransactionNotActive { .. }));
        assert!(ctx.do_rollback().is_err());
    }

    #[test]
    fn test_second_transaction_times_out_on_lock() {
        let fixture = TestFixture::new();
        let mut first = fixture.context(1, fixture.journal.clone());
        let mut second = fixture.context(2, fixture.journal.clone());

        first.offer(&fixture.queue, "a".into(), Duration::ZERO).unwrap();
        let err = second.offer(&fixture.queue, "b".into(), Duration::ZERO).unwrap_err();
        assert!(matches!(err, crate::QueueError::LockTimeout { .. }));
        assert_eq!(second.status(), TxStatus::Open);

        first.do_commit().unwrap();
        assert!(second.offer(&fixture.queue, "b".into(), Duration::ZERO).unwrap());
    }

    #[test]
    fn test_rollback_removes_the_added_record_not_an_equal_one() {
        let fixture = TestFixture::new();
        fixture.queue.put("a".into()).unwrap();
        fixture.queue.put("b".into()).unwrap();

        let mut ctx = fixture.context(1, fixture.journal.clone());
        ctx.offer(&fixture.queue, "a".into(), Duration::ZERO).unwrap();
        ctx.do_rollback().unwrap();

        assert_eq!(fixture.queue.take().unwrap(), "a");
        assert_eq!(fixture.queue.take().unwrap(), "b");
        assert!(fixture.queue.is_empty());
    }

    #[test]
    fn test_clear_is_journaled_and_undone_in_order() {
        let fixture = TestFixture::new();
        for item in ["a", "b", "c"] {
            fixture.queue.put(item.into()).unwrap();
        }

        let mut ctx = fixture.context(1, fixture.journal.clone());
        assert_eq!(ctx.clear(&fixture.queue).unwrap(), 3);
        assert!(fixture.queue.is_empty());
        let entries = fixture.journal.entries_for(&LocalTxId(1));
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| matches!(e.op, JournalOp::Remove { .. })));

        ctx.do_rollback().unwrap();
        assert_eq!(fixture.queue.take().unwrap(), "a");
        assert_eq!(fixture.queue.take().unwrap(), "b");
        assert_eq!(fixture.queue.take().unwrap(), "c");
    }

    #[test]
    fn test_recovered_context_holds_its_queue_locks() {
        let fixture = TestFixture::new();
        let mut id = 0;
        fixture
            .queue
            .offer_with("prepared".into(), None, |assigned, _| {
                id = assigned;
                Ok(())
            })
            .unwrap();
        let pending = vec![PendingOp::Added {
            queue: Arc::clone(&fixture.queue),
            id,
            item: "prepared".to_string(),
        }];
        let journal: Arc<dyn TxJournal<LocalTxId>> = fixture.journal.clone();
        let mut recovered =
            PersistentTransactionContext::recovered(LocalTxId(1), journal, Arc::new(BincodeCodec), pending).unwrap();

        let mut other = fixture.context(2, fixture.journal.clone());
        let err = other.poll(&fixture.queue, Duration::ZERO).unwrap_err();
        assert!(matches!(err, crate::QueueError::LockTimeout { .. }));

        recovered.do_rollback().unwrap();
        assert!(fixture.queue.is_empty());
        assert_eq!(other.poll(&fixture.queue, Duration::ZERO).unwrap(), None);
    }

    #[test]
    fn test_prepare_without_work_is_read_only() {
        let fixture = TestFixture::new();
        let mut ctx = fixture.context(1, fixture.journal.clone());
        assert!(!ctx.prepare().unwrap());
        ctx.offer(&fixture.queue, "a".into(), Duration::ZERO).unwrap();
        assert!(ctx.prepare().unwrap());
    }
}
