use std::sync::Arc;
use std::thread;
use std::time::Duration;

use aspen_db::{Database, DbError, Options};

use crate::test_utils::setup;

fn options(dir: &tempfile::TempDir) -> Options {
    Options::new(dir.path().join("test-db"))
        .page_size(1024)
        .checkpoint_rate(Duration::from_secs(0))
        // Long enough that only the detector, not the timeout, can end the
        // cycle.
        .lock_timeout(Duration::from_secs(10))
}

/// Txn A holds k1 and wants k2; txn B holds k2 and wants k1. Exactly the
/// party that closes the cycle gets the deadlock error naming both keys,
/// and the other proceeds.
#[test]
fn test_deadlock_detection() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open(options(&dir)).unwrap());
    let tree = db.open_tree(b"t1").unwrap();
    tree.put(b"k1", b"1").unwrap();
    tree.put(b"k2", b"2").unwrap();

    // step 1: A locks k1, B locks k2
    let tx_a = db.begin().unwrap();
    tree.store(&tx_a, b"k1", b"a1").unwrap();
    let tx_b = db.begin().unwrap();
    tree.store(&tx_b, b"k2", b"b2").unwrap();

    // step 2: A blocks on k2 in another thread
    let db_2 = Arc::clone(&db);
    let a_thread = thread::spawn(move || {
        let tree = db_2.open_tree(b"t1").unwrap();
        let result = tree.load(&tx_a, b"k2");
        // Whatever happened, A lets go so the test always terminates.
        let _ = tx_a.reset();
        result
    });
    thread::sleep(Duration::from_millis(100));

    // step 3: B closes the cycle and is told about it
    let b_result = tree.load(&tx_b, b"k1");
    let a_result = a_thread.join().unwrap();

    let deadlocked = [&a_result, &b_result]
        .iter()
        .filter(|r| matches!(r, Err(DbError::Deadlock { .. })))
        .count();
    assert_eq!(
        deadlocked, 1,
        "exactly one side sees the deadlock: A={:?}, B={:?}",
        a_result, b_result
    );

    if let Err(DbError::Deadlock { participants, keys }) = &b_result {
        assert_eq!(participants.len(), 2);
        assert!(keys.iter().any(|k| k.contains("k1")));
        assert!(keys.iter().any(|k| k.contains("k2")));
    }

    // step 4: the surviving side can finish
    tx_b.reset().unwrap();
    assert_eq!(tree.get(b"k1").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tree.get(b"k2").unwrap(), Some(b"2".to_vec()));
}

/// Lock waits without a cycle end in a timeout, not a deadlock report.
#[test]
fn test_plain_contention_times_out() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(
        Options::new(dir.path().join("test-db"))
            .page_size(1024)
            .checkpoint_rate(Duration::from_secs(0))
            .lock_timeout(Duration::from_millis(100)),
    )
    .unwrap();
    let tree = db.open_tree(b"t1").unwrap();
    tree.put(b"k", b"v").unwrap();

    let holder = db.begin().unwrap();
    tree.store(&holder, b"k", b"held").unwrap();

    let waiter = db.begin().unwrap();
    match tree.load(&waiter, b"k") {
        Err(DbError::LockTimeout(_)) => {}
        other => panic!("expected LockTimeout, got {:?}", other),
    }
    waiter.reset().unwrap();
    holder.reset().unwrap();
}
