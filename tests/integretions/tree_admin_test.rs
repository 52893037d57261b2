use std::fs;

use aspen_db::{Database, DbError};

use crate::test_utils::{key, new_db, redo_segment_count, setup, test_options, value};

/// Named trees are independent keyspaces and reopen by name.
#[test]
fn test_multiple_named_trees() {
    setup();
    let dir = tempfile::tempdir().unwrap();

    {
        let db = new_db(&dir);
        let a = db.open_tree(b"alpha").unwrap();
        let b = db.open_tree(b"beta").unwrap();
        a.put(b"k", b"from-a").unwrap();
        b.put(b"k", b"from-b").unwrap();
        assert_ne!(a.id(), b.id());
        db.close().unwrap();
    }

    let db = Database::open(test_options(&dir)).unwrap();
    let a = db.open_tree(b"alpha").unwrap();
    let b = db.open_tree(b"beta").unwrap();
    assert_eq!(a.get(b"k").unwrap(), Some(b"from-a".to_vec()));
    assert_eq!(b.get(b"k").unwrap(), Some(b"from-b".to_vec()));
}

/// Dropping a tree releases its pages and forgets its name; reopening the
/// name yields a fresh empty tree with a different id.
#[test]
fn test_drop_tree() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);

    let tree = db.open_tree(b"doomed").unwrap();
    for i in 0..500u64 {
        tree.put(&key(i), &value(i)).unwrap();
    }
    let old_id = tree.id();
    db.checkpoint().unwrap();

    let free_before = db.stats().free_pages;
    db.drop_tree(b"doomed").unwrap();

    // The old handle is dead.
    match tree.get(&key(0)) {
        Err(DbError::Closed(_)) => {}
        other => panic!("expected Closed from a dropped tree, got {:?}", other),
    }

    // The pages return once the deferral clears.
    db.checkpoint().unwrap();
    db.checkpoint().unwrap();
    assert!(db.stats().free_pages > free_before);

    // The name maps to a brand-new tree now.
    let reborn = db.open_tree(b"doomed").unwrap();
    assert_ne!(reborn.id(), old_id);
    assert_eq!(reborn.count().unwrap(), 0);
}

/// Tree ids pass the reserved-range test and differ between trees.
#[test]
fn test_tree_ids_are_scrambled_user_ids() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);

    let mut ids = Vec::new();
    for i in 0..10u32 {
        let tree = db.open_tree(format!("tree-{}", i).as_bytes()).unwrap();
        assert!(tree.id() >= 0x100, "id {:#x} is in the reserved range", tree.id());
        ids.push(tree.id());
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 10, "tree ids must be unique");
}

/// Checkpoints rotate redo segments and retire the old ones; the directory
/// never accumulates more than the active pair.
#[test]
fn test_checkpoint_segment_rotation() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"t1").unwrap();

    for round in 0..6u64 {
        for i in 0..200u64 {
            tree.put(&key(round * 200 + i), &value(i)).unwrap();
        }
        db.checkpoint().unwrap();
        let segments = redo_segment_count(&dir);
        assert!(
            segments <= 2,
            "{} redo segments on disk after round {}",
            segments,
            round
        );
    }
}

/// destroy() wipes an existing database and starts over.
#[test]
fn test_destroy() {
    setup();
    let dir = tempfile::tempdir().unwrap();

    {
        let db = new_db(&dir);
        let tree = db.open_tree(b"t1").unwrap();
        tree.put(b"k", b"v").unwrap();
        db.close().unwrap();
    }

    let db = Database::destroy(test_options(&dir)).unwrap();
    let tree = db.open_tree(b"t1").unwrap();
    assert_eq!(tree.get(b"k").unwrap(), None);
}

/// restore_from_snapshot() lays a copied base file down and opens it.
#[test]
fn test_restore_from_snapshot() {
    setup();
    let source_dir = tempfile::tempdir().unwrap();

    {
        let db = new_db(&source_dir);
        let tree = db.open_tree(b"t1").unwrap();
        for i in 0..100u64 {
            tree.put(&key(i), &value(i)).unwrap();
        }
        db.close().unwrap();
    }

    let snapshot = fs::read(source_dir.path().join("test-db")).unwrap();

    let target_dir = tempfile::tempdir().unwrap();
    let db = Database::restore_from_snapshot(
        test_options(&target_dir),
        snapshot.as_slice(),
    )
    .unwrap();
    let tree = db.open_tree(b"t1").unwrap();
    assert_eq!(tree.count().unwrap(), 100);
    assert_eq!(tree.get(&key(42)).unwrap(), Some(value(42)));
}

/// The info file snapshots the effective configuration.
#[test]
fn test_info_and_lock_files() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);

    let info = fs::read_to_string(dir.path().join("test-db.info")).unwrap();
    assert!(info.contains("pageSize = 1024"));
    assert!(info.contains("durabilityMode"));
    assert!(dir.path().join("test-db.lock").exists());

    // A second open of the same files is refused while this one lives.
    match Database::open(test_options(&dir)) {
        Err(DbError::Config(_)) => {}
        other => panic!("expected Config error, got {:?}", other.map(|_| ())),
    }
    drop(db);

    // And allowed after it is gone.
    Database::open(test_options(&dir)).unwrap();
}

/// Page accounting stays coherent across a write/checkpoint cycle.
#[test]
fn test_stats() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"t1").unwrap();

    for i in 0..500u64 {
        tree.put(&key(i), &value(i)).unwrap();
    }
    let stats = db.stats();
    assert!(stats.total_pages > 2);
    assert!(stats.dirty_pages > 0);
    assert!(stats.cached_nodes > 0);

    db.checkpoint().unwrap();
    assert_eq!(db.stats().dirty_pages, 0, "checkpoint flushed everything");
}
