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

use std::{io, path::PathBuf, time::Duration};

use snafu::Snafu;

use crate::xa::XaErrorCode;

/// Result type for queue operations.
pub type Result<T, E = QueueError> = std::result::Result<T, E>;

/// Queue engine errors.
///
/// Capacity exhaustion and plain timeouts are not errors: `offer` answers
/// `false` and `poll` answers `None`.
#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    #[snafu(display("IO error on {}", path.display()))]
    Io {
        source: io::Error,
        path:   PathBuf,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Corrupt frame in {} at offset {offset}: {reason}", path.display()))]
    CorruptFrame {
        path:   PathBuf,
        offset: u64,
        reason: String,
    },

    #[snafu(display("Control file {} corrupted: {reason}", path.display()))]
    ControlFileCorrupted { path: PathBuf, reason: String },

    #[snafu(display("Transaction journal {} corrupted at offset {offset}: {reason}", path.display()))]
    JournalCorrupted {
        path:   PathBuf,
        offset: u64,
        reason: String,
    },

    #[snafu(display("Failed to write journal entry for transaction {tx}"))]
    JournalWrite {
        tx:     String,
        source: io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Timed out after {timeout:?} waiting for the transaction lock on queue {queue}"))]
    LockTimeout { queue: String, timeout: Duration },

    #[snafu(display("Queue {name} is already registered"))]
    RegistrationConflict { name: String },

    #[snafu(display("Invalid queue name {name:?}: {reason}"))]
    InvalidQueueName { name: String, reason: &'static str },

    #[snafu(display("Queue {name} has been closed or disposed"))]
    QueueDisposed { name: String },

    #[snafu(display("Cannot {operation} while the queue manager is {state}"))]
    InvalidLifecycle {
        operation: &'static str,
        state:     String,
    },

    #[snafu(display("A transaction is already active on this session"))]
    TransactionAlreadyActive,

    #[snafu(display("No transaction is active on this session"))]
    NoActiveTransaction,

    #[snafu(display("Transaction {tx} is {status} and accepts no further work"))]
    TransactionNotActive { tx: String, status: String },

    #[snafu(display("XA error {code}: {message}"))]
    Xa { code: XaErrorCode, message: String },

    #[snafu(display("Failed to encode/decode queue item: {message}"))]
    Codec { message: String },

    #[snafu(display("Internal error: {message}"))]
    Internal { message: String },
}

impl QueueError {
    /// XA error code carried by this error, if any.
    pub const fn xa_code(&self) -> Option<XaErrorCode> {
        match self {
            Self::Xa { code, .. } => Some(*code),
            _ => None,
        }
    }
}
