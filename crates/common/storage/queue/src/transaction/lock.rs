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

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{Result, error::LockTimeoutSnafu};

static NEXT_LOCK_OWNER: AtomicU64 = AtomicU64::new(1);

/// Identity of a transaction holding queue locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("lock-owner-{_0}")]
pub struct LockOwner(u64);

impl LockOwner {
    pub fn next() -> Self { Self(NEXT_LOCK_OWNER.fetch_add(1, Ordering::Relaxed)) }
}

/// Re-entrant per-queue lock held by one transaction at a time.
#[derive(Debug)]
pub struct TxLock {
    queue:    String,
    holder:   Mutex<Option<LockOwner>>,
    released: Condvar,
}

impl TxLock {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue:    queue.into(),
            holder:   Mutex::new(None),
            released: Condvar::new(),
        }
    }

    /// Acquires the lock for `owner`, waiting at most `timeout`.
    ///
    /// Acquiring a lock already held by `owner` succeeds immediately.
    pub fn acquire(&self, owner: LockOwner, timeout: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        let mut holder = self.holder.lock();
        loop {
            match *holder {
                None => {
                    *holder = Some(owner);
                    return Ok(());
                }
                Some(current) if current == owner => return Ok(()),
                Some(_) => {}
            }
            let timed_out = match deadline {
                Some(deadline) => self.released.wait_until(&mut holder, deadline).timed_out(),
                None => {
                    self.released.wait(&mut holder);
                    false
                }
            };
            if timed_out && holder.is_some_and(|current| current != owner) {
                return LockTimeoutSnafu {
                    queue: &self.queue,
                    timeout,
                }
                .fail();
            }
        }
    }

    /// Releases the lock if `owner` holds it.
    pub fn release(&self, owner: LockOwner) {
        let mut holder = self.holder.lock();
        if *holder == Some(owner) {
            *holder = None;
            self.released.notify_all();
        }
    }

    pub fn holder(&self) -> Option<LockOwner> { *self.holder.lock() }

    /// Forgets the holder. Used when a queue is reopened, since the
    /// transactions of the previous incarnation were handed to recovery.
    pub(crate) fn reset(&self) {
        *self.holder.lock() = None;
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_reentrant_acquire() {
        let lock = TxLock::new("q");
        let owner = LockOwner::next();
        lock.acquire(owner, Duration::ZERO).unwrap();
        lock.acquire(owner, Duration::ZERO).unwrap();
        assert_eq!(lock.holder(), Some(owner));
        lock.release(owner);
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn test_acquire_times_out() {
        let lock = TxLock::new("q");
        lock.acquire(LockOwner::next(), Duration::ZERO).unwrap();

        let start = Instant::now();
        let err = lock
            .acquire(LockOwner::next(), Duration::from_millis(50))
            .unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(matches!(err, crate::QueueError::LockTimeout { .. }));
    }

    #[test]
    fn test_release_wakes_waiter() {
        let lock = Arc::new(TxLock::new("q"));
        let first = LockOwner::next();
        lock.acquire(first, Duration::ZERO).unwrap();

        let (tx, rx) = crossbeam::channel::bounded(1);
        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let second = LockOwner::next();
                tx.send(()).unwrap();
                lock.acquire(second, Duration::from_secs(5)).unwrap();
                second
            })
        };
        rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        lock.release(first);

        let second = waiter.join().unwrap();
        assert_eq!(lock.holder(), Some(second));
    }

    #[test]
    fn test_release_by_non_holder_is_ignored() {
        let lock = TxLock::new("q");
        let owner = LockOwner::next();
        lock.acquire(owner, Duration::ZERO).unwrap();
        lock.release(LockOwner::next());
        assert_eq!(lock.holder(), Some(owner));
    }
}
