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
    journal::{LocalTxId, TxJournal},
};

/// Undoes every incomplete local transaction, then empties the journal.
pub struct LocalTxQueueTransactionRecoverer<T> {
    journal: Arc<dyn TxJournal<LocalTxId>>,
    codec:   SharedCodec<T>,
}

impl<T: QueueItem> LocalTxQueueTransactionRecoverer<T> {
    pub fn new(journal: Arc<dyn TxJournal<LocalTxId>>, codec: SharedCodec<T>) -> Self { Self { journal, codec } }

    pub fn recover_incomplete_transactions(&self, provider: &dyn QueueProvider<T>) -> Result<RecoverySummary> {
        let open = self.journal.open_transactions();
        let mut summary = RecoverySummary {
            transactions: open.len(),
            ..RecoverySummary::default()
        };
        for transaction in &open {
            undo_transaction(provider, &self.codec, transaction, &mut summary)?;
        }
        self.journal.clear()?;

        info!(
            transactions = summary.transactions,
            restored = summary.restored,
            removed = summary.removed,
            cancelled = summary.cancelled,
            "Recovered local transactions"
        );
        Ok(summary)
    }
}
