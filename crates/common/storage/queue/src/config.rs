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

use std::{path::PathBuf, time::Duration};

use bon::Builder;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

use crate::store::QueueKind;

/// Size at which the write file of a persistent queue rotates (64 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;
/// Size past which an idle transaction journal is truncated (16 MiB).
pub const DEFAULT_MAX_JOURNAL_SIZE: u64 = 16 * 1024 * 1024;
/// Upper bound on waiting for a per-queue transaction lock.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// When appended bytes are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Leave flushing to the OS page cache.
    Async,
    /// `fsync` after every record append and cursor update.
    #[default]
    Sync,
}

impl FlushMode {
    pub const fn is_sync(self) -> bool { matches!(self, Self::Sync) }
}

/// Per-queue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SmartDefault, Builder)]
#[builder(finish_fn = build)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of items; `None` means unbounded.
    pub capacity:   Option<usize>,
    /// Whether items survive a restart.
    #[default(true)]
    #[builder(default = true)]
    pub persistent: bool,
}

impl QueueConfig {
    pub const fn kind(&self) -> QueueKind { QueueKind::from_persistent(self.persistent) }
}

/// Configuration of a [`TransactionalQueueManager`](crate::TransactionalQueueManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault, Builder)]
#[builder(finish_fn = build)]
#[serde(default)]
pub struct QueueManagerConfig {
    /// Root directory for queue stores and journals.
    #[default(PathBuf::from("./.durq"))]
    #[builder(into, default = PathBuf::from("./.durq"))]
    pub working_directory:   PathBuf,
    /// Configuration applied to queues without an explicit override.
    #[builder(default)]
    pub default_queue:       QueueConfig,
    /// Write file length that triggers a rotation.
    #[default(DEFAULT_MAX_FILE_SIZE)]
    #[builder(default = DEFAULT_MAX_FILE_SIZE)]
    pub max_file_size:       u64,
    /// Journal length past which it is truncated once idle.
    #[default(DEFAULT_MAX_JOURNAL_SIZE)]
    #[builder(default = DEFAULT_MAX_JOURNAL_SIZE)]
    pub max_journal_size:    u64,
    /// Bound on acquiring a per-queue transaction lock.
    #[default(DEFAULT_TRANSACTION_TIMEOUT)]
    #[builder(default = DEFAULT_TRANSACTION_TIMEOUT)]
    pub transaction_timeout: Duration,
    #[builder(default)]
    pub flush_mode:          FlushMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueManagerConfig::default();
        assert_eq!(config.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert_eq!(config.max_journal_size, DEFAULT_MAX_JOURNAL_SIZE);
        assert_eq!(config.transaction_timeout, DEFAULT_TRANSACTION_TIMEOUT);
        assert_eq!(config.flush_mode, FlushMode::Sync);
        assert!(config.default_queue.persistent);
        assert_eq!(config.default_queue.capacity, None);
    }

    #[test]
    fn test_builder_matches_default() {
        let built = QueueManagerConfig::builder().build();
        assert_eq!(built, QueueManagerConfig::default());

        let queue = QueueConfig::builder().capacity(4).persistent(false).build();
        assert_eq!(queue.capacity, Some(4));
        assert_eq!(queue.kind(), QueueKind::Transient);
    }

    #[test]
    fn test_deserialize_partial() {
        let json = r#"{"working_directory":"/tmp/q","default_queue":{"capacity":2},"flush_mode":"async"}"#;
        let config: QueueManagerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.working_directory, PathBuf::from("/tmp/q"));
        assert_eq!(config.default_queue.capacity, Some(2));
        assert!(config.default_queue.persistent);
        assert_eq!(config.flush_mode, FlushMode::Async);
        assert_eq!(config.max_file_size, DEFAULT_MAX_FILE_SIZE);
    }
}
