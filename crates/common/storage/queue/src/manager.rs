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

//! The queue manager: registry, journals, recovery and sessions.
//!
//! ```text
//!   CREATED ──initialise──▶ INITIALISED ──start──▶ STARTED ──stop──▶ STOPPED
//!      │                                   ▲                           │
//!      └───────────────start───────────────┘◀──────────start───────────┘
//!
//!   any state ──dispose──▶ DISPOSED
//! ```
//!
//! `start()` runs local and XA recovery before it returns, so sessions are
//! only handed out once every incomplete transaction has been repaired.

use std::{
    collections::HashMap,
    fs,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use snafu::{ResultExt, ensure};
use tracing::{debug, info};

use crate::{
    QueueConfig, QueueItem, QueueManagerConfig, QueueStore, Result,
    codec::{BincodeCodec, SharedCodec},
    error::{InvalidLifecycleSnafu, IoSnafu, RegistrationConflictSnafu},
    journal::{LocalTxJournal, TxJournal, XaTxJournal},
    path,
    recovery::{LocalTxQueueTransactionRecoverer, QueueProvider, RecoverySummary, XaTransactionRecoverer},
    session::QueueSession,
    store::{DualFileQueueStore, InMemoryQueueStore, QueueStoreBackend},
    xa::{XaQueueSession, XaResourceManager},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum LifecycleState {
    #[display("created")]
    Created,
    #[display("initialised")]
    Initialised,
    #[display("recovering")]
    Recovering,
    #[display("started")]
    Started,
    #[display("stopped")]
    Stopped,
    #[display("disposed")]
    Disposed,
}

/// Recovery outcome reported by [`TransactionalQueueManager::start`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartReport {
    pub local: RecoverySummary,
    pub xa:    RecoverySummary,
}

struct Journals<T: QueueItem> {
    local: Arc<LocalTxJournal>,
    xa:    Arc<XaTxJournal>,
    xa_rm: Arc<XaResourceManager<T>>,
}

impl<T: QueueItem> Clone for Journals<T> {
    fn clone(&self) -> Self {
        Self {
            local: Arc::clone(&self.local),
            xa:    Arc::clone(&self.xa),
            xa_rm: Arc::clone(&self.xa_rm),
        }
    }
}

struct ManagerInner<T: QueueItem> {
    config:        QueueManagerConfig,
    codec:         SharedCodec<T>,
    default_queue: Mutex<QueueConfig>,
    overrides:     Mutex<HashMap<String, QueueConfig>>,
    queues:        Mutex<HashMap<String, Arc<QueueStore<T>>>>,
    journals:      Mutex<Option<Journals<T>>>,
    state:         Mutex<LifecycleState>,
    tx_ids:        Arc<AtomicU64>,
    generation:    AtomicU64,
}

impl<T: QueueItem> ManagerInner<T> {
    fn queue_config(&self, name: &str) -> QueueConfig {
        self.overrides
            .lock()
            .get(name)
            .copied()
            .unwrap_or_else(|| *self.default_queue.lock())
    }

    fn ensure_state(&self, operation: &'static str, allowed: &[LifecycleState]) -> Result<LifecycleState> {
        let state = *self.state.lock();
        ensure!(allowed.contains(&state), InvalidLifecycleSnafu {
            operation,
            state: state.to_string(),
        });
        Ok(state)
    }

    fn journals(&self) -> Result<Journals<T>> {
        self.journals.lock().clone().ok_or_else(|| {
            InvalidLifecycleSnafu {
                operation: "use the transaction journals",
                state:     self.state.lock().to_string(),
            }
            .build()
        })
    }

    fn open_backend(
        &self,
        name: &str,
        persistent: bool,
        capacity: Option<usize>,
    ) -> Result<Box<dyn QueueStoreBackend<T>>> {
        if !persistent {
            return Ok(Box::new(InMemoryQueueStore::new(capacity)));
        }
        let backend = DualFileQueueStore::open(
            path::queue_dir(&self.config.working_directory, name),
            Arc::clone(&self.codec),
            self.config.max_file_size,
            self.config.flush_mode,
        )?;
        Ok(Box::new(backend))
    }

    fn open_store(&self, name: &str) -> Result<QueueStore<T>> {
        let config = self.queue_config(name);
        let backend = self.open_backend(name, config.persistent, config.capacity)?;
        Ok(QueueStore::new(name, config.capacity, backend))
    }

    /// Reattaches a backend to a registered queue closed by `stop()`.
    fn reopen_if_closed(&self, queue: &QueueStore<T>) -> Result<()> {
        if queue.is_closed() {
            let backend = self.open_backend(queue.name(), queue.is_persistent(), queue.capacity())?;
            queue.reopen(backend)?;
        }
        Ok(())
    }

    fn reopen_closed_queues(&self) -> Result<()> {
        let queues: Vec<_> = self.queues.lock().values().cloned().collect();
        for queue in queues {
            self.reopen_if_closed(&queue)?;
        }
        Ok(())
    }

    /// Closes every registered queue. Handles stay valid and come back to
    /// life on the next `start()`.
    fn close_queues(&self) -> Result<()> {
        let queues: Vec<_> = self.queues.lock().values().cloned().collect();
        for queue in queues {
            queue.close()?;
        }
        Ok(())
    }

    fn drop_all_queues(&self) -> Result<()> {
        let queues: Vec<_> = self.queues.lock().drain().map(|(_, queue)| queue).collect();
        for queue in queues {
            queue.close()?;
        }
        Ok(())
    }
}

const QUEUE_ACCESS_STATES: &[LifecycleState] = &[
    LifecycleState::Initialised,
    LifecycleState::Recovering,
    LifecycleState::Started,
];

impl<T: QueueItem> QueueProvider<T> for ManagerInner<T> {
    fn get_queue(&self, name: &str) -> Result<Arc<QueueStore<T>>> {
        self.ensure_state("get a queue", QUEUE_ACCESS_STATES)?;
        path::validate_queue_name(name)?;
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(name) {
            self.reopen_if_closed(queue)?;
            return Ok(Arc::clone(queue));
        }
        let queue = Arc::new(self.open_store(name)?);
        queues.insert(name.to_owned(), Arc::clone(&queue));
        debug!(queue = %name, kind = %queue.kind(), "Opened queue");
        Ok(queue)
    }

    fn dispose_queue(&self, name: &str) -> Result<()> {
        self.ensure_state("dispose a queue", QUEUE_ACCESS_STATES)?;
        let registered = self.queues.lock().remove(name);
        let queue = match registered {
            Some(queue) => queue,
            None => Arc::new(self.open_store(name)?),
        };
        queue.dispose()?;
        info!(queue = %name, "Disposed queue");
        Ok(())
    }

    fn generation(&self) -> u64 { self.generation.load(Ordering::SeqCst) }
}

/// Entry point of the engine.
///
/// Cloning is cheap; clones share one registry and one pair of journals.
pub struct TransactionalQueueManager<T: QueueItem> {
    inner: Arc<ManagerInner<T>>,
}

impl<T: QueueItem> Clone for TransactionalQueueManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> TransactionalQueueManager<T>
where
    T: QueueItem + Serialize + DeserializeOwned,
{
    /// Manager storing items with [`BincodeCodec`].
    pub fn with_bincode(config: QueueManagerConfig) -> Self { Self::new(config, Arc::new(BincodeCodec)) }
}

impl<T: QueueItem> TransactionalQueueManager<T> {
    pub fn new(config: QueueManagerConfig, codec: SharedCodec<T>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                default_queue: Mutex::new(config.default_queue),
                config,
                codec,
                overrides: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                journals: Mutex::new(None),
                state: Mutex::new(LifecycleState::Created),
                tx_ids: Arc::new(AtomicU64::new(1)),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &QueueManagerConfig { &self.inner.config }

    pub fn state(&self) -> LifecycleState { *self.inner.state.lock() }

    /// Creates the working directory and opens both journals.
    pub fn initialise(&self) -> Result<()> {
        self.inner.ensure_state("initialise", &[LifecycleState::Created])?;
        let workdir = &self.inner.config.working_directory;
        fs::create_dir_all(path::queue_store_root(workdir)).context(IoSnafu {
            path: path::queue_store_root(workdir),
        })?;

        let max_size = self.inner.config.max_journal_size;
        let local = Arc::new(LocalTxJournal::open(path::local_journal_path(workdir), max_size)?);
        let xa = Arc::new(XaTxJournal::open(path::xa_journal_path(workdir), max_size)?);
        let xa_rm = Arc::new(XaResourceManager::new(Arc::clone(&xa), Arc::clone(&self.inner.codec)));
        *self.inner.journals.lock() = Some(Journals { local, xa, xa_rm });
        *self.inner.state.lock() = LifecycleState::Initialised;

        info!(workdir = ?workdir, "Initialised queue manager");
        Ok(())
    }

    /// Recovers incomplete transactions and admits clients. Initialises
    /// first when needed.
    pub fn start(&self) -> Result<StartReport> {
        let previous = self.inner.ensure_state("start", &[
            LifecycleState::Created,
            LifecycleState::Initialised,
            LifecycleState::Stopped,
        ])?;
        if previous == LifecycleState::Created {
            self.initialise()?;
        }
        let resume_state = if previous == LifecycleState::Stopped {
            LifecycleState::Stopped
        } else {
            LifecycleState::Initialised
        };

        *self.inner.state.lock() = LifecycleState::Recovering;
        let report = self.inner.reopen_closed_queues().and_then(|()| self.recover());
        *self.inner.state.lock() = if report.is_ok() {
            LifecycleState::Started
        } else {
            resume_state
        };
        let report = report?;

        info!(
            local_transactions = report.local.transactions,
            xa_transactions = report.xa.transactions,
            in_doubt = report.xa.in_doubt,
            "Started queue manager"
        );
        Ok(report)
    }

    fn recover(&self) -> Result<StartReport> {
        let journals = self.inner.journals()?;
        let provider: &dyn QueueProvider<T> = &*self.inner;

        let local = LocalTxQueueTransactionRecoverer::new(journals.local.clone(), Arc::clone(&self.inner.codec))
            .recover_incomplete_transactions(provider)?;
        let xa = XaTransactionRecoverer::new(journals.xa.clone(), Arc::clone(&self.inner.codec)).recover(provider)?;
        journals.xa_rm.adopt_in_doubt(xa.in_doubt);

        Ok(StartReport {
            local,
            xa: xa.summary,
        })
    }

    /// Closes every open queue and syncs the journals. Incomplete
    /// transactions are left for the next `start()` to recover. Queue
    /// handles stay registered and are reopened by `start()`.
    pub fn stop(&self) -> Result<()> {
        self.inner.ensure_state("stop", &[LifecycleState::Started])?;
        *self.inner.state.lock() = LifecycleState::Stopped;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let journals = self.inner.journals()?;
        journals.xa_rm.abandon_all();
        self.inner.close_queues()?;
        journals.local.sync()?;
        journals.xa.sync()?;
        info!("Stopped queue manager");
        Ok(())
    }

    /// Releases everything. Persisted queues and journals stay on disk.
    pub fn dispose(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), LifecycleState::Disposed);
        if previous == LifecycleState::Disposed {
            return Ok(());
        }
        self.inner.drop_all_queues()?;
        if let Some(journals) = self.inner.journals.lock().take() {
            journals.xa_rm.abandon_all();
            journals.local.close()?;
            journals.xa.close()?;
        }
        info!(previous = %previous, "Disposed queue manager");
        Ok(())
    }

    /// Replaces the configuration used by queues without an override.
    pub fn set_default_queue_config(&self, config: QueueConfig) { *self.inner.default_queue.lock() = config; }

    /// Overrides the configuration of one queue. A registered queue keeps
    /// its settings until it is disposed.
    pub fn set_queue_config(&self, name: impl Into<String>, config: QueueConfig) {
        self.inner.overrides.lock().insert(name.into(), config);
    }

    pub fn queue_config(&self, name: &str) -> QueueConfig { self.inner.queue_config(name) }

    /// Opens a queue that must not be open yet.
    pub fn create_queue(&self, name: &str) -> Result<Arc<QueueStore<T>>> {
        ensure!(!self.inner.queues.lock().contains_key(name), RegistrationConflictSnafu {
            name,
        });
        self.inner.get_queue(name)
    }

    /// Returns the named queue, opening it on first use.
    pub fn get_queue(&self, name: &str) -> Result<Arc<QueueStore<T>>> { self.inner.get_queue(name) }

    pub fn dispose_queue(&self, name: &str) -> Result<()> { self.inner.dispose_queue(name) }

    /// Names of the registered queues.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.queues.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_queue_session(&self) -> Result<QueueSession<T>> {
        self.inner.ensure_state("open a session", &[LifecycleState::Started])?;
        let journals = self.inner.journals()?;
        let local: Arc<dyn TxJournal<_>> = journals.local;
        Ok(QueueSession::new(
            Arc::clone(&self.inner) as Arc<dyn QueueProvider<T>>,
            local,
            Arc::clone(&self.inner.codec),
            self.inner.config.transaction_timeout,
            Arc::clone(&self.inner.tx_ids),
        ))
    }

    pub fn get_xa_session(&self) -> Result<XaQueueSession<T>> {
        self.inner.ensure_state("open an XA session", &[LifecycleState::Started])?;
        let journals = self.inner.journals()?;
        Ok(XaQueueSession::new(
            journals.xa_rm,
            Arc::clone(&self.inner) as Arc<dyn QueueProvider<T>>,
            self.inner.config.transaction_timeout,
        ))
    }

    /// Local transaction ids handed out so far.
    pub fn transactions_begun(&self) -> u64 { self.inner.tx_ids.load(Ordering::SeqCst) - 1 }
}
