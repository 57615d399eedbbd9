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

use std::sync::Arc;

use tracing::info;

use super::{QueueProvider, RecoverySummary, undo_transaction};
use crate::{
    QueueItem, Result,
    codec::SharedCodec,
    journal::{JournalOp, OpenTransaction, TxJournal, XaTxJournal},
    transaction::{PendingOp, PersistentTransactionContext, XaTransactionContext},
    xa::Xid,
};

/// Outcome of an XA recovery pass.
pub struct XaRecovery<T: QueueItem> {
    pub summary:  RecoverySummary,
    /// Prepared branches awaiting the coordinator's decision.
    pub in_doubt: Vec<XaTransactionContext<T>>,
}

/// Undoes unprepared XA branches and rebuilds contexts for prepared ones.
pub struct XaTransactionRecoverer<T> {
    journal: Arc<XaTxJournal>,
    codec:   SharedCodec<T>,
}

impl<T: QueueItem> XaTransactionRecoverer<T> {
    pub fn new(journal: Arc<XaTxJournal>, codec: SharedCodec<T>) -> Self { Self { journal, codec } }

    pub fn recover(&self, provider: &dyn QueueProvider<T>) -> Result<XaRecovery<T>> {
        let open = self.journal.open_transactions();
        let mut summary = RecoverySummary {
            transactions: open.len(),
            ..RecoverySummary::default()
        };
        let mut in_doubt = Vec::new();
        for transaction in &open {
            if transaction.is_prepared() {
                in_doubt.push(self.rebuild(provider, transaction)?);
            } else {
                undo_transaction(provider, &self.codec, transaction, &mut summary)?;
            }
        }
        summary.in_doubt = in_doubt.len();
        self.journal.retain(&OpenTransaction::is_prepared)?;

        info!(
            transactions = summary.transactions,
            restored = summary.restored,
            removed = summary.removed,
            in_doubt = summary.in_doubt,
            "Recovered XA transactions"
        );
        Ok(XaRecovery { summary, in_doubt })
    }

    fn rebuild(
        &self,
        provider: &dyn QueueProvider<T>,
        transaction: &OpenTransaction<Xid>,
    ) -> Result<XaTransactionContext<T>> {
        let mut pending = Vec::with_capacity(transaction.entries.len());
        for entry in &transaction.entries {
            match &entry.op {
                JournalOp::Add { queue, id, item } => pending.push(PendingOp::Added {
                    queue: provider.get_queue(queue)?,
                    id:    *id,
                    item:  self.codec.decode(item)?,
                }),
                JournalOp::Remove { queue, item, .. } => pending.push(PendingOp::Removed {
                    queue: provider.get_queue(queue)?,
                    item:  self.codec.decode(item)?,
                }),
                JournalOp::Prepare | JournalOp::Commit | JournalOp::Rollback => {}
            }
        }
        let journal: Arc<dyn TxJournal<Xid>> = self.journal.clone();
        let context =
            PersistentTransactionContext::recovered(transaction.tx.clone(), journal, self.codec.clone(), pending)?;
        Ok(XaTransactionContext::recovered(context))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        codec::BincodeCodec,
        testing::StaticQueueProvider,
        transaction::{QueueTransactionContext, TxStatus},
    };

    fn xid(n: u8) -> Xid { Xid::new(7, vec![n], vec![1]) }

    #[test]
    fn test_prepared_branches_stay_in_doubt() {
        let temp_dir = TempDir::new().unwrap();
        let journal = Arc::new(XaTxJournal::open(temp_dir.path().join("tx.log"), u64::MAX).unwrap());
        let codec: SharedCodec<String> = Arc::new(BincodeCodec);
        let provider = StaticQueueProvider::transient(["q"]);
        let queue = provider.get_queue("q").unwrap();

        // Both branches applied their offers before the crash.
        queue.put("prepared".into()).unwrap();
        queue.put("unprepared".into()).unwrap();
        journal.log_add(&xid(1), "q", 0, codec.encode(&"prepared".to_owned()).unwrap()).unwrap();
        journal.log_prepare(&xid(1)).unwrap();
        journal.log_add(&xid(2), "q", 1, codec.encode(&"unprepared".to_owned()).unwrap()).unwrap();

        let recoverer = XaTransactionRecoverer::new(journal.clone(), codec);
        let XaRecovery { summary, mut in_doubt } = recoverer.recover(&provider).unwrap();

        assert_eq!(summary.in_doubt, 1);
        assert_eq!(summary.removed, 1);
        assert_eq!(queue.size(), 1);
        assert_eq!(journal.prepared_transactions(), vec![xid(1)]);
        assert_eq!(journal.open_transactions().len(), 1);

        let mut context = in_doubt.remove(0);
        assert_eq!(context.tx(), &xid(1));
        assert!(queue.tx_lock().holder().is_some());
        context.do_rollback().unwrap();
        assert_eq!(queue.tx_lock().holder(), None);
        assert_eq!(context.status(), TxStatus::RolledBack);
        assert!(queue.is_empty());
        assert!(journal.open_transactions().is_empty());
    }
}
