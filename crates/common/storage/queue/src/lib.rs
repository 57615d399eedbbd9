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

//! Persistent transactional FIFO queues.
//!
//! Items live in named queues, either transient (in memory) or persistent
//! (a pair of rotating record files per queue). Local transactions and XA
//! branches journal every change before applying it, and the manager's
//! `start()` repairs whatever a crash left half done.
//!
//! ```ignore
//! let manager = TransactionalQueueManager::<String>::with_bincode(QueueManagerConfig::default());
//! manager.start()?;
//! let session = manager.get_queue_session()?;
//! let jobs = session.get_queue("jobs")?;
//! session.begin()?;
//! jobs.put("build".to_string())?;
//! session.commit()?;
//! ```

pub mod codec;
pub mod config;
pub mod control_file;
mod crc;
pub mod error;
pub mod journal;
pub mod manager;
pub mod path;
pub mod queue;
pub mod record_file;
pub mod recovery;
pub mod session;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transaction;
pub mod xa;

pub use codec::{BincodeCodec, Codec, QueueItem, SharedCodec};
pub use config::{FlushMode, QueueConfig, QueueManagerConfig};
pub use error::{QueueError, Result};
pub use manager::{LifecycleState, StartReport, TransactionalQueueManager};
pub use queue::QueueStore;
pub use session::{Queue, QueueSession};
pub use store::QueueKind;
pub use xa::{XaErrorCode, XaFlags, XaQueueSession, XaResource, XaVote, Xid};
