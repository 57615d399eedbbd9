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

//! Queue store backends.
//!
//! A [`QueueStore`](crate::QueueStore) owns exactly one backend, chosen once
//! from its [`QueueKind`]: an in-memory deque for transient queues or a pair
//! of rotating record files for persistent ones.

mod dual_file;
mod memory;

use serde::{Deserialize, Serialize};

pub use self::{dual_file::DualFileQueueStore, memory::InMemoryQueueStore};
use crate::Result;

/// Whether a queue's items survive a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    #[display("persistent")]
    Persistent,
    #[display("transient")]
    Transient,
}

impl QueueKind {
    pub const fn from_persistent(persistent: bool) -> Self {
        if persistent { Self::Persistent } else { Self::Transient }
    }

    pub const fn is_persistent(self) -> bool { matches!(self, Self::Persistent) }
}

/// An item together with the id of the record holding it.
///
/// Ids are unique within one store and never reused, so a journal entry
/// can name the exact record a transaction touched even when equal items
/// sit in the same queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem<T> {
    pub id:   u64,
    pub item: T,
}

/// Storage behind a queue facade.
///
/// Implementations are not synchronized; the facade serializes every call
/// under its own lock.
pub trait QueueStoreBackend<T>: Send {
    fn kind(&self) -> QueueKind;

    fn size(&self) -> usize;

    /// Id the next inserted record will get.
    fn next_id(&self) -> u64;

    /// Appends at the tail under id [`next_id`](Self::next_id). `false`
    /// means the backend is at capacity.
    fn offer_last(&mut self, item: T) -> Result<bool>;

    /// Appends at the tail, ignoring capacity, and returns the new id.
    fn force_last(&mut self, item: T) -> Result<u64>;

    /// Inserts at the head, ignoring capacity, and returns the new id.
    fn offer_first(&mut self, item: T) -> Result<u64>;

    fn peek_first(&mut self) -> Result<Option<StoredItem<T>>>;

    fn poll_first(&mut self) -> Result<Option<StoredItem<T>>>;

    fn contains(&mut self, item: &T) -> Result<bool>;

    /// Removes the first item equal to `item`.
    fn remove(&mut self, item: &T) -> Result<bool>;

    /// Removes the record with the given id.
    fn remove_id(&mut self, id: u64) -> Result<bool>;

    fn clear(&mut self) -> Result<()>;

    /// Flushes and releases resources, keeping persisted data.
    fn close(self: Box<Self>) -> Result<()>;

    /// Releases resources and deletes persisted data.
    fn dispose(self: Box<Self>) -> Result<()>;
}
