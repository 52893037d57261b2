use aspen_db::{Database, DbError};

use crate::test_utils::{key, new_db, setup, test_options, value};

/// Open an empty database, store one pair, read it back, and read it back
/// again after a close/open cycle.
#[test]
fn test_round_trip_small_value() {
    setup();
    let dir = tempfile::tempdir().unwrap();

    // step 1: store and load within one process lifetime
    {
        let db = new_db(&dir);
        let t1 = db.open_tree(b"t1").unwrap();
        t1.put(b"k", b"v").unwrap();
        assert_eq!(t1.get(b"k").unwrap(), Some(b"v".to_vec()));
        db.close().unwrap();
    }

    // step 2: reopen and load again
    {
        let db = Database::open(test_options(&dir)).unwrap();
        let t1 = db.open_tree(b"t1").unwrap();
        assert_eq!(t1.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}

/// A reset transaction leaves nothing behind.
#[test]
fn test_rollback() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"t1").unwrap();

    // step 1: store under an explicit transaction
    let tx = db.begin().unwrap();
    tree.store(&tx, b"k", b"a").unwrap();

    // step 2: the transaction itself still sees the write
    assert_eq!(tree.load(&tx, b"k").unwrap(), Some(b"a".to_vec()));

    // step 3: roll back
    tx.reset().unwrap();

    // step 4: an auto-commit load sees nothing
    assert_eq!(tree.get(b"k").unwrap(), None);
}

#[test]
fn test_update_and_delete() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"t1").unwrap();

    tree.put(b"k", b"v1").unwrap();
    tree.put(b"k", b"v2").unwrap();
    assert_eq!(tree.get(b"k").unwrap(), Some(b"v2".to_vec()));

    tree.remove(b"k").unwrap();
    assert_eq!(tree.get(b"k").unwrap(), None);
    assert_eq!(tree.count().unwrap(), 0);
}

/// Enough data to grow a multi-level tree, surviving close/open.
#[test]
fn test_many_keys_persist() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let rows = 3_000u64;

    {
        let db = new_db(&dir);
        let tree = db.open_tree(b"bulk").unwrap();
        for i in 0..rows {
            tree.put(&key(i), &value(i)).unwrap();
        }
        tree.check_integrity().unwrap();
        assert_eq!(tree.count().unwrap(), rows);
        db.close().unwrap();
    }

    {
        let db = Database::open(test_options(&dir)).unwrap();
        let tree = db.open_tree(b"bulk").unwrap();
        tree.check_integrity().unwrap();
        assert_eq!(tree.count().unwrap(), rows);
        for i in (0..rows).step_by(97) {
            assert_eq!(tree.get(&key(i)).unwrap(), Some(value(i)), "key {}", i);
        }
    }
}

/// Committed changes are visible to later transactions; uncommitted ones
/// hold their locks, so a conflicting reader times out instead of seeing
/// them.
#[test]
fn test_isolation_by_locking() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"t1").unwrap();

    tree.put(b"k", b"committed").unwrap();

    let writer = db.begin().unwrap();
    tree.store(&writer, b"k", b"pending").unwrap();

    // A concurrent reader cannot lock the key while the writer holds it.
    let reader = db.begin().unwrap();
    match tree.load(&reader, b"k") {
        Err(DbError::LockTimeout(_)) => {}
        other => panic!("expected a lock timeout, got {:?}", other),
    }
    reader.reset().unwrap();

    writer.commit().unwrap();
    assert_eq!(tree.get(b"k").unwrap(), Some(b"pending".to_vec()));
}

/// Cursor iteration sees a consistent ordered view and skips ghosts left by
/// an uncommitted delete.
#[test]
fn test_cursor_scan_with_ghosts() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"t1").unwrap();

    for i in 0..10u64 {
        tree.put(&key(i), &value(i)).unwrap();
    }

    let tx = db.begin().unwrap();
    tree.delete(&tx, &key(4)).unwrap();

    // The pending delete is a ghost: traversal skips it.
    let mut cursor = tree.cursor();
    let mut seen = Vec::new();
    let mut at = cursor.first().unwrap().map(|k| k.to_vec());
    while let Some(k) = at {
        seen.push(k.clone());
        at = cursor.next().unwrap().map(|k| k.to_vec());
    }
    assert_eq!(seen.len(), 9);
    assert!(!seen.contains(&key(4)));

    // Rolling back revives the key for everyone.
    tx.reset().unwrap();
    assert_eq!(tree.count().unwrap(), 10);
    assert_eq!(tree.get(&key(4)).unwrap(), Some(value(4)));
}

/// Operations after close fail fast with the closed error.
#[test]
fn test_closed_database_fails_fast() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"t1").unwrap();
    tree.put(b"k", b"v").unwrap();
    db.close().unwrap();

    match tree.put(b"k2", b"v2") {
        Err(DbError::Closed(_)) => {}
        other => panic!("expected Closed, got {:?}", other),
    }
    match db.open_tree(b"t2") {
        Err(DbError::Closed(_)) => {}
        other => panic!("expected Closed, got {:?}", other.map(|_| ())),
    }
}
