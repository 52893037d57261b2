use std::sync::Arc;
use std::thread;

use aspen_db::{Database, DurabilityMode};

use crate::test_utils::{key, new_db_with, setup, test_options, value};

/// Writers running with NO_SYNC durability, then a simulated crash: every
/// commit whose flush completed is recovered whole, and the in-flight
/// transaction disappears entirely.
#[test]
fn test_crash_recovery_no_sync() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let writers = 4u64;
    let per_writer = 200u64;

    {
        let db = Arc::new(new_db_with(&dir, DurabilityMode::NoSync));
        let tree = db.open_tree(b"t1").unwrap();

        // step 1: committed writes from several threads
        let mut handles = Vec::new();
        for w in 0..writers {
            let db = Arc::clone(&db);
            handles.push(thread::spawn(move || {
                let tree = db.open_tree(b"t1").unwrap();
                for i in 0..per_writer {
                    let n = w * per_writer + i;
                    tree.put(&key(n), &value(n)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // step 2: one transaction left in flight at crash time
        let tx = db.begin().unwrap();
        for i in 0..50u64 {
            tree.store(&tx, &key(1_000_000 + i), b"doomed").unwrap();
        }
        // A later commit flushes the shared redo buffer, so the in-flight
        // records are on disk too; recovery must still discard them.
        tree.put(&key(9_999_999), b"flusher").unwrap();

        // step 3: crash
        db.simulate_crash();
        std::mem::forget(tx);
        drop(tree);
        drop(db);
    }

    // step 4: recovery
    let db = Database::open(test_options(&dir).durability_mode(DurabilityMode::NoSync)).unwrap();
    let tree = db.open_tree(b"t1").unwrap();
    tree.check_integrity().unwrap();

    for n in 0..writers * per_writer {
        assert_eq!(
            tree.get(&key(n)).unwrap(),
            Some(value(n)),
            "committed key {} lost",
            n
        );
    }
    assert_eq!(tree.get(&key(9_999_999)).unwrap(), Some(b"flusher".to_vec()));
    for i in 0..50u64 {
        assert_eq!(
            tree.get(&key(1_000_000 + i)).unwrap(),
            None,
            "uncommitted key {} survived",
            i
        );
    }
}

/// A crash right after a checkpoint recovers from the checkpoint alone.
#[test]
fn test_crash_after_checkpoint() {
    setup();
    let dir = tempfile::tempdir().unwrap();

    {
        let db = new_db_with(&dir, DurabilityMode::NoSync);
        let tree = db.open_tree(b"t1").unwrap();
        for i in 0..500u64 {
            tree.put(&key(i), &value(i)).unwrap();
        }
        db.checkpoint().unwrap();

        // Post-checkpoint writes ride the redo log only.
        for i in 500..700u64 {
            tree.put(&key(i), &value(i)).unwrap();
        }
        db.simulate_crash();
    }

    let db = Database::open(test_options(&dir)).unwrap();
    let tree = db.open_tree(b"t1").unwrap();
    tree.check_integrity().unwrap();
    assert_eq!(tree.count().unwrap(), 700);
}

/// Committed deletes stay deleted across a crash; the ghost protocol must
/// not resurrect them.
#[test]
fn test_crash_recovers_deletes() {
    setup();
    let dir = tempfile::tempdir().unwrap();

    {
        let db = new_db_with(&dir, DurabilityMode::NoSync);
        let tree = db.open_tree(b"t1").unwrap();
        for i in 0..100u64 {
            tree.put(&key(i), &value(i)).unwrap();
        }
        db.checkpoint().unwrap();
        for i in 0..50u64 {
            tree.remove(&key(i)).unwrap();
        }
        db.simulate_crash();
    }

    let db = Database::open(test_options(&dir)).unwrap();
    let tree = db.open_tree(b"t1").unwrap();
    for i in 0..50u64 {
        assert_eq!(tree.get(&key(i)).unwrap(), None, "deleted key {} returned", i);
    }
    for i in 50..100u64 {
        assert_eq!(tree.get(&key(i)).unwrap(), Some(value(i)));
    }
}

/// Two crash/recover cycles in a row: recovery output must itself be
/// recoverable.
#[test]
fn test_double_crash() {
    setup();
    let dir = tempfile::tempdir().unwrap();

    {
        let db = new_db_with(&dir, DurabilityMode::NoSync);
        let tree = db.open_tree(b"t1").unwrap();
        for i in 0..200u64 {
            tree.put(&key(i), &value(i)).unwrap();
        }
        db.simulate_crash();
    }
    {
        let db =
            Database::open(test_options(&dir).durability_mode(DurabilityMode::NoSync)).unwrap();
        let tree = db.open_tree(b"t1").unwrap();
        assert_eq!(tree.count().unwrap(), 200);
        for i in 200..400u64 {
            tree.put(&key(i), &value(i)).unwrap();
        }
        db.simulate_crash();
    }
    {
        let db = Database::open(test_options(&dir)).unwrap();
        let tree = db.open_tree(b"t1").unwrap();
        tree.check_integrity().unwrap();
        assert_eq!(tree.count().unwrap(), 400);
    }
}
