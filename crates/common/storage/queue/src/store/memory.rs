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

use std::collections::VecDeque;

use super::{QueueKind, QueueStoreBackend, StoredItem};
use crate::{QueueItem, Result};

/// Capacity-bounded deque for transient queues.
#[derive(Debug)]
pub struct InMemoryQueueStore<T> {
    items:    VecDeque<StoredItem<T>>,
    capacity: Option<usize>,
    next_id:  u64,
}

impl<T> InMemoryQueueStore<T> {
    pub const fn new(capacity: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
            next_id: 0,
        }
    }

    fn wrap(&mut self, item: T) -> StoredItem<T> {
        let id = self.next_id;
        self.next_id += 1;
        StoredItem { id, item }
    }
}

impl<T: QueueItem> QueueStoreBackend<T> for InMemoryQueueStore<T> {
    fn kind(&self) -> QueueKind { QueueKind::Transient }

    fn size(&self) -> usize { self.items.len() }

    fn next_id(&self) -> u64 { self.next_id }

    fn offer_last(&mut self, item: T) -> Result<bool> {
        if self.capacity.is_some_and(|capacity| self.items.len() >= capacity) {
            return Ok(false);
        }
        let stored = self.wrap(item);
        self.items.push_back(stored);
        Ok(true)
    }

    fn force_last(&mut self, item: T) -> Result<u64> {
        let stored = self.wrap(item);
        let id = stored.id;
        self.items.push_back(stored);
        Ok(id)
    }

    fn offer_first(&mut self, item: T) -> Result<u64> {
        let stored = self.wrap(item);
        let id = stored.id;
        self.items.push_front(stored);
        Ok(id)
    }

    fn peek_first(&mut self) -> Result<Option<StoredItem<T>>> { Ok(self.items.front().cloned()) }

    fn poll_first(&mut self) -> Result<Option<StoredItem<T>>> { Ok(self.items.pop_front()) }

    fn contains(&mut self, item: &T) -> Result<bool> {
        Ok(self.items.iter().any(|stored| stored.item == *item))
    }

    fn remove(&mut self, item: &T) -> Result<bool> {
        match self.items.iter().position(|stored| stored.item == *item) {
            Some(index) => Ok(self.items.remove(index).is_some()),
            None => Ok(false),
        }
    }

    fn remove_id(&mut self, id: u64) -> Result<bool> {
        match self.items.iter().position(|stored| stored.id == id) {
            Some(index) => Ok(self.items.remove(index).is_some()),
            None => Ok(false),
        }
    }

    fn clear(&mut self) -> Result<()> {
        self.items.clear();
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> { Ok(()) }

    fn dispose(self: Box<Self>) -> Result<()> { Ok(()) }
}
