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
    sync::{Arc, atomic::Ordering},
    thread,
    time::{Duration, Instant},
};

use durq_queue::{
    BincodeCodec, FlushMode, QueueConfig, QueueError, QueueManagerConfig, QueueStore, SharedCodec,
    TransactionalQueueManager, XaFlags, XaResource, XaVote, Xid,
    journal::{LocalTxId, LocalTxJournal, TxJournal},
    path,
    testing::{CountingCodec, FailingJournal},
    transaction::{LocalTransactionContext, QueueTransactionContext},
};
use tempfile::TempDir;
use test_case::test_case;

struct TestFixture {
    temp_dir: TempDir,
    manager:  TransactionalQueueManager<String>,
}

impl TestFixture {
    fn new() -> Self { Self::with_file_size(64 * 1024) }

    fn with_file_size(max_file_size: u64) -> Self {
        durq_common_telemetry::init_default_ut_logging();
        let temp_dir = TempDir::new().unwrap();
        let manager = Self::manager(&temp_dir, max_file_size);
        manager.start().unwrap();
        Self { temp_dir, manager }
    }

    fn manager(temp_dir: &TempDir, max_file_size: u64) -> TransactionalQueueManager<String> {
        TransactionalQueueManager::with_bincode(
            QueueManagerConfig::builder()
                .working_directory(temp_dir.path())
                .max_file_size(max_file_size)
                .transaction_timeout(Duration::from_millis(200))
                .flush_mode(FlushMode::Sync)
                .build(),
        )
    }

    /// Drops the running manager without completing anything and starts a
    /// fresh one on the same directory.
    fn crash_and_restart(&mut self) {
        self.manager.dispose().unwrap();
        self.manager = Self::manager(&self.temp_dir, self.manager.config().max_file_size);
        self.manager.start().unwrap();
    }

    fn drain(&self, name: &str) -> Vec<String> {
        let queue = self.manager.get_queue(name).unwrap();
        std::iter::from_fn(|| queue.poll(Duration::ZERO).unwrap()).collect()
    }
}

fn items(prefix: &str, n: usize) -> Vec<String> { (0..n).map(|i| format!("{prefix}-{i:03}")).collect() }

#[test]
fn test_fifo_across_rotation_and_restart() {
    let mut fixture = TestFixture::with_file_size(256);
    let queue = fixture.manager.get_queue("fifo").unwrap();
    let expected = items("m", 60);

    for item in &expected[..40] {
        queue.put(item.clone()).unwrap();
    }
    let mut seen: Vec<String> = (0..15).map(|_| queue.take().unwrap()).collect();
    for item in &expected[40..] {
        queue.put(item.clone()).unwrap();
    }

    fixture.crash_and_restart();
    seen.extend(fixture.drain("fifo"));
    assert_eq!(seen, expected);
}

#[test]
fn test_capacity_bounds_offer() {
    let fixture = TestFixture::new();
    fixture
        .manager
        .set_queue_config("small", QueueConfig::builder().capacity(2).build());
    let session = fixture.manager.get_queue_session().unwrap();
    let queue = session.get_queue("small").unwrap();

    assert!(queue.offer("a".into(), Duration::ZERO).unwrap());
    assert!(queue.offer("b".into(), Duration::ZERO).unwrap());
    assert!(!queue.offer("c".into(), Duration::from_millis(20)).unwrap());
    assert_eq!(queue.size(), 2);
}

#[test]
fn test_over_capacity_put_blocks_until_take() {
    let fixture = TestFixture::new();
    fixture
        .manager
        .set_queue_config("one", QueueConfig::builder().capacity(1).build());
    let queue = fixture.manager.get_queue("one").unwrap();
    queue.put("first".into()).unwrap();

    let (tx, rx) = crossbeam::channel::bounded(1);
    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            queue.put("second".into()).unwrap();
            tx.send(()).unwrap();
        })
    };
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    assert_eq!(queue.take().unwrap(), "first");
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    producer.join().unwrap();
    assert_eq!(queue.take().unwrap(), "second");
}

#[test]
fn test_untake_is_served_first() {
    let fixture = TestFixture::new();
    let session = fixture.manager.get_queue_session().unwrap();
    let queue = session.get_queue("u").unwrap();
    queue.put("b".into()).unwrap();
    queue.put("c".into()).unwrap();
    queue.untake("a".into()).unwrap();

    assert_eq!(fixture.drain("u"), vec!["a", "b", "c"]);
}

#[test]
fn test_session_put_take_commit() {
    let fixture = TestFixture::new();
    let session = fixture.manager.get_queue_session().unwrap();
    let queue = session.get_queue("orders").unwrap();

    session.begin().unwrap();
    queue.put("o-1".into()).unwrap();
    queue.put("o-2".into()).unwrap();
    session.commit().unwrap();
    assert!(!session.is_in_transaction());

    session.begin().unwrap();
    assert_eq!(queue.take().unwrap(), "o-1");
    session.commit().unwrap();
    assert_eq!(queue.size(), 1);
}

#[test]
fn test_rollback_of_put_and_take() {
    let fixture = TestFixture::new();
    let session = fixture.manager.get_queue_session().unwrap();
    let queue = session.get_queue("r").unwrap();
    queue.put("existing".into()).unwrap();

    session.begin().unwrap();
    queue.put("phantom".into()).unwrap();
    assert_eq!(queue.take().unwrap(), "existing");
    session.rollback().unwrap();

    assert_eq!(fixture.drain("r"), vec!["existing"]);
}

#[test]
fn test_session_errors() {
    let fixture = TestFixture::new();
    let session = fixture.manager.get_queue_session().unwrap();
    assert!(matches!(session.commit(), Err(QueueError::NoActiveTransaction)));
    assert!(matches!(session.rollback(), Err(QueueError::NoActiveTransaction)));
    session.begin().unwrap();
    assert!(matches!(session.begin(), Err(QueueError::TransactionAlreadyActive)));
}

#[test]
fn test_blocking_take_is_woken_by_put() {
    let fixture = TestFixture::new();
    let queue = fixture.manager.get_queue("wake").unwrap();

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.take().unwrap())
    };
    thread::sleep(Duration::from_millis(50));
    let session = fixture.manager.get_queue_session().unwrap();
    session.begin().unwrap();
    session.get_queue("wake").unwrap().put("ping".into()).unwrap();
    session.commit().unwrap();

    assert_eq!(consumer.join().unwrap(), "ping");
}

#[test]
fn test_multiple_queue_transaction() {
    let mut fixture = TestFixture::new();
    fixture
        .manager
        .set_queue_config("scratch", QueueConfig::builder().persistent(false).build());
    let session = fixture.manager.get_queue_session().unwrap();
    let inbox = session.get_queue("inbox").unwrap();
    let outbox = session.get_queue("outbox").unwrap();
    let scratch = session.get_queue("scratch").unwrap();
    inbox.put("job".into()).unwrap();

    session.begin().unwrap();
    let job = inbox.take().unwrap();
    outbox.put(format!("{job}-done")).unwrap();
    scratch.put("note".into()).unwrap();
    session.commit().unwrap();

    assert!(inbox.is_empty());
    assert_eq!(scratch.size(), 1);
    drop((inbox, outbox, scratch, session));

    fixture.crash_and_restart();
    assert!(fixture.drain("inbox").is_empty());
    assert_eq!(fixture.drain("outbox"), vec!["job-done"]);
    assert!(fixture.drain("scratch").is_empty());
}

#[test]
fn test_warm_and_cold_restart_keep_order() {
    let mut fixture = TestFixture::new();
    let expected = items("p", 10);
    let session = fixture.manager.get_queue_session().unwrap();
    let queue = session.get_queue("keep").unwrap();
    for item in &expected[..5] {
        queue.put(item.clone()).unwrap();
    }

    fixture.manager.stop().unwrap();
    fixture.manager.start().unwrap();
    assert_eq!(queue.size(), 5);
    for item in &expected[5..] {
        queue.put(item.clone()).unwrap();
    }
    assert_eq!(queue.size(), 10);
    drop((queue, session));

    fixture.crash_and_restart();
    assert_eq!(fixture.drain("keep"), expected);
}

#[test]
fn test_uncommitted_poll_is_restored_last() {
    let mut fixture = TestFixture::new();
    let queue = fixture.manager.get_queue("crash").unwrap();
    for item in ["a", "b", "c"] {
        queue.put(item.into()).unwrap();
    }

    let session = fixture.manager.get_queue_session().unwrap();
    session.begin().unwrap();
    assert_eq!(session.get_queue("crash").unwrap().take().unwrap(), "a");
    // Simulated crash: the session never commits or rolls back.
    std::mem::forget(session);

    fixture.crash_and_restart();
    assert_eq!(fixture.drain("crash"), vec!["b", "c", "a"]);
}

#[test]
fn test_failed_commit_is_undone_by_recovery() {
    durq_common_telemetry::init_default_ut_logging();
    let temp_dir = TempDir::new().unwrap();
    let codec: SharedCodec<String> = Arc::new(BincodeCodec);
    {
        let journal: Arc<dyn TxJournal<LocalTxId>> =
            Arc::new(LocalTxJournal::open(path::local_journal_path(temp_dir.path()), u64::MAX).unwrap());
        let failing = Arc::new(FailingJournal::new(journal.clone()));
        let queue = Arc::new(
            QueueStore::persistent(
                "q",
                path::queue_dir(temp_dir.path(), "q"),
                None,
                codec.clone(),
                64 * 1024,
                FlushMode::Sync,
            )
            .unwrap(),
        );

        let mut context =
            LocalTransactionContext::new(LocalTxId(1), failing.clone(), codec.clone(), Duration::from_millis(100));
        assert!(context.offer(&queue, "ghost".into(), Duration::ZERO).unwrap());
        failing.fail_commits(true);
        assert!(context.do_commit().is_err());
        assert_eq!(queue.size(), 1);

        queue.close().unwrap();
        journal.close().unwrap();
    }

    let manager = TestFixture::manager(&temp_dir, 64 * 1024);
    let report = manager.start().unwrap();
    assert_eq!(report.local.transactions, 1);
    assert_eq!(report.local.removed, 1);
    assert!(manager.get_queue("q").unwrap().is_empty());
}

#[test]
fn test_timeouts_are_respected() {
    let fixture = TestFixture::new();
    fixture
        .manager
        .set_queue_config("t", QueueConfig::builder().capacity(1).build());
    let session = fixture.manager.get_queue_session().unwrap();
    let queue = session.get_queue("t").unwrap();
    let timeout = Duration::from_millis(50);
    let tolerance = Duration::from_millis(20);

    let started = Instant::now();
    assert_eq!(queue.poll(timeout).unwrap(), None);
    let elapsed = started.elapsed();
    assert!(elapsed >= timeout && elapsed < timeout + tolerance, "poll took {elapsed:?}");

    assert_eq!(queue.peek().unwrap(), None);

    queue.put("full".into()).unwrap();
    let started = Instant::now();
    assert!(!queue.offer("over".into(), timeout).unwrap());
    let elapsed = started.elapsed();
    assert!(elapsed >= timeout && elapsed < timeout + tolerance, "offer took {elapsed:?}");
}

#[test]
fn test_escaped_names_stay_distinct() {
    let fixture = TestFixture::new();
    fixture.manager.get_queue("a/b").unwrap().put("slash".into()).unwrap();
    fixture.manager.get_queue("a%2Fb").unwrap().put("percent".into()).unwrap();

    assert_eq!(fixture.drain("a/b"), vec!["slash"]);
    assert_eq!(fixture.drain("a%2Fb"), vec!["percent"]);
    assert!(fixture.temp_dir.path().join("queuestore").join("a%2Fb").is_dir());
    assert!(fixture.temp_dir.path().join("queuestore").join("a%252Fb").is_dir());
}

#[test]
fn test_contains_decodes_lazily() {
    let temp_dir = TempDir::new().unwrap();
    let (codec, decodes) = CountingCodec::<String>::new(Arc::new(BincodeCodec));
    let queue = QueueStore::persistent("lazy", temp_dir.path(), None, Arc::new(codec), 64 * 1024, FlushMode::Async)
        .unwrap();
    let all = items("x", 20);
    for item in &all {
        queue.put(item.clone()).unwrap();
    }

    decodes.store(0, Ordering::SeqCst);
    assert!(queue.contains(&all[0]).unwrap());
    assert_eq!(decodes.load(Ordering::SeqCst), 1);

    decodes.store(0, Ordering::SeqCst);
    assert!(!queue.contains(&"missing".to_owned()).unwrap());
    assert!(decodes.load(Ordering::SeqCst) <= all.len());
}

#[test]
fn test_xa_two_phase_commit() {
    let fixture = TestFixture::new();
    let xa = fixture.manager.get_xa_session().unwrap();
    let queue = xa.get_queue("xa").unwrap();
    let xid = Xid::new(1, b"global-1".to_vec(), b"branch".to_vec());

    xa.start(&xid, XaFlags::NO_FLAGS).unwrap();
    queue.put("two-phase".into()).unwrap();
    xa.end(&xid, XaFlags::SUCCESS).unwrap();
    assert_eq!(xa.prepare(&xid).unwrap(), XaVote::Ok);
    xa.commit(&xid, false).unwrap();

    assert_eq!(xa.recover(XaFlags::START_RSCAN | XaFlags::END_RSCAN).unwrap(), Vec::<Xid>::new());
    assert_eq!(fixture.drain("xa"), vec!["two-phase"]);
}

#[test]
fn test_xa_in_doubt_branch_survives_restart() {
    let mut fixture = TestFixture::new();
    let committed = Xid::new(1, b"g-commit".to_vec(), b"b".to_vec());
    let rolled_back = Xid::new(1, b"g-rollback".to_vec(), b"b".to_vec());
    let unprepared = Xid::new(1, b"g-unprepared".to_vec(), b"b".to_vec());
    let branches = [
        (&committed, "xa-keep", "keep"),
        (&rolled_back, "xa-undo", "undo"),
        (&unprepared, "xa-lost", "lost"),
    ];
    {
        // Each branch holds its queue's lock until it completes, so the
        // branches work on separate queues.
        let xa = fixture.manager.get_xa_session().unwrap();
        for (xid, name, item) in branches {
            xa.start(xid, XaFlags::NO_FLAGS).unwrap();
            xa.get_queue(name).unwrap().put(item.into()).unwrap();
            xa.end(xid, XaFlags::SUCCESS).unwrap();
        }
        xa.prepare(&committed).unwrap();
        xa.prepare(&rolled_back).unwrap();
    }

    fixture.crash_and_restart();
    assert_eq!(fixture.manager.get_queue("xa-keep").unwrap().size(), 1);
    assert_eq!(fixture.manager.get_queue("xa-undo").unwrap().size(), 1);
    assert!(fixture.manager.get_queue("xa-lost").unwrap().is_empty());

    let xa = fixture.manager.get_xa_session().unwrap();
    let mut in_doubt = xa.recover(XaFlags::START_RSCAN).unwrap();
    in_doubt.sort();
    let mut expected = vec![committed.clone(), rolled_back.clone()];
    expected.sort();
    assert_eq!(in_doubt, expected);
    assert!(xa.recover(XaFlags::END_RSCAN).unwrap().is_empty());

    // The adopted branch still locks its queue against local transactions.
    let session = fixture.manager.get_queue_session().unwrap();
    let keep = session.get_queue("xa-keep").unwrap();
    session.begin().unwrap();
    assert!(matches!(keep.put("blocked".into()), Err(QueueError::LockTimeout { .. })));
    session.rollback().unwrap();

    xa.commit(&committed, false).unwrap();
    xa.rollback(&rolled_back).unwrap();

    session.begin().unwrap();
    keep.put("after".into()).unwrap();
    session.commit().unwrap();
    drop((keep, session));

    assert_eq!(fixture.drain("xa-keep"), vec!["keep", "after"]);
    assert!(fixture.drain("xa-undo").is_empty());
}

#[test]
fn test_clear_in_transaction() {
    let fixture = TestFixture::new();
    let session = fixture.manager.get_queue_session().unwrap();
    let queue = session.get_queue("clear").unwrap();

    session.begin().unwrap();
    queue.put("String1".into()).unwrap();
    session.commit().unwrap();
    assert_eq!(queue.size(), 1);

    session.begin().unwrap();
    queue.clear().unwrap();
    assert!(queue.is_empty());
    session.rollback().unwrap();
    assert_eq!(queue.size(), 1);

    session.begin().unwrap();
    queue.clear().unwrap();
    session.commit().unwrap();
    assert!(queue.is_empty());
}

#[test]
fn test_uncommitted_clear_is_restored_by_recovery() {
    let mut fixture = TestFixture::new();
    let queue = fixture.manager.get_queue("wiped").unwrap();
    for item in ["a", "b", "c"] {
        queue.put(item.into()).unwrap();
    }

    let session = fixture.manager.get_queue_session().unwrap();
    session.begin().unwrap();
    session.get_queue("wiped").unwrap().clear().unwrap();
    std::mem::forget(session);

    fixture.crash_and_restart();
    assert_eq!(fixture.drain("wiped"), vec!["a", "b", "c"]);
}

#[test_case("a/b" ; "slash")]
#[test_case("a\\b" ; "backslash")]
#[test_case("a:b" ; "colon")]
#[test_case("a*b" ; "asterisk")]
#[test_case("a?b" ; "question_mark")]
#[test_case("a\"b" ; "double_quote")]
#[test_case("a<b" ; "less_than")]
#[test_case("a>b" ; "greater_than")]
#[test_case("a|b" ; "pipe")]
#[test_case("a(b)" ; "parentheses")]
#[test_case("a b" ; "space")]
#[test_case("a$b" ; "dollar")]
#[test_case("a%b" ; "percent")]
#[test_case("a#b" ; "hash")]
#[test_case("a@b" ; "at")]
#[test_case("a!b" ; "bang")]
#[test_case("a^b" ; "caret")]
#[test_case("a+b" ; "plus")]
#[test_case("a&b" ; "ampersand")]
fn test_special_names_create_and_dispose(name: &str) {
    let fixture = TestFixture::new();
    let dir = path::queue_dir(fixture.temp_dir.path(), name);

    let queue = fixture.manager.create_queue(name).unwrap();
    queue.put("x".into()).unwrap();
    assert!(dir.is_dir());
    assert_eq!(dir.parent(), Some(path::queue_store_root(fixture.temp_dir.path()).as_path()));

    fixture.manager.dispose_queue(name).unwrap();
    assert!(!dir.exists());
    assert!(fixture.manager.queue_names().is_empty());
}
