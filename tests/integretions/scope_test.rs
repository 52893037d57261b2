use crate::test_utils::{new_db, setup};

/// Nested scopes: an exited scope unwinds only its own work.
#[test]
fn test_scope_exit_is_partial_rollback() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"t1").unwrap();

    let tx = db.begin().unwrap();

    // step 1: outer scope writes a
    tree.store(&tx, b"a", b"outer").unwrap();

    // step 2: inner scope writes b and reworks a
    tx.enter().unwrap();
    tree.store(&tx, b"b", b"inner").unwrap();
    tree.store(&tx, b"a", b"inner-rework").unwrap();

    // step 3: abandon the inner scope
    tx.exit().unwrap();

    // step 4: the outer work is intact, the inner work is gone
    assert_eq!(tree.load(&tx, b"a").unwrap(), Some(b"outer".to_vec()));
    assert_eq!(tree.load(&tx, b"b").unwrap(), None);

    tx.commit().unwrap();
    assert_eq!(tree.get(b"a").unwrap(), Some(b"outer".to_vec()));
    assert_eq!(tree.get(b"b").unwrap(), None);
}

/// A committed inner scope folds into its parent, and dies with it on
/// rollback.
#[test]
fn test_scope_commit_folds_into_parent() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"t1").unwrap();

    // Round 1: inner commit, outer commit - both writes land.
    let tx = db.begin().unwrap();
    tree.store(&tx, b"a", b"1").unwrap();
    tx.enter().unwrap();
    tree.store(&tx, b"b", b"2").unwrap();
    tx.commit().unwrap(); // inner
    tx.commit().unwrap(); // outer
    assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tree.get(b"b").unwrap(), Some(b"2".to_vec()));

    // Round 2: inner commit, outer rollback - both writes vanish.
    let tx = db.begin().unwrap();
    tree.store(&tx, b"c", b"3").unwrap();
    tx.enter().unwrap();
    tree.store(&tx, b"d", b"4").unwrap();
    tx.commit().unwrap(); // inner
    tx.reset().unwrap(); // outer rollback
    assert_eq!(tree.get(b"c").unwrap(), None);
    assert_eq!(tree.get(b"d").unwrap(), None);
}

/// Scopes stack deeper than one level.
#[test]
fn test_deeply_nested_scopes() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"t1").unwrap();

    let tx = db.begin().unwrap();
    for depth in 0..5u64 {
        tx.enter().unwrap();
        tree.store(&tx, format!("depth-{}", depth).as_bytes(), b"x")
            .unwrap();
    }
    // Unwind the two innermost levels, keep the rest.
    tx.exit().unwrap();
    tx.exit().unwrap();
    for _ in 0..3 {
        tx.commit().unwrap();
    }
    tx.commit().unwrap(); // terminal

    assert_eq!(tree.get(b"depth-0").unwrap(), Some(b"x".to_vec()));
    assert_eq!(tree.get(b"depth-1").unwrap(), Some(b"x".to_vec()));
    assert_eq!(tree.get(b"depth-2").unwrap(), Some(b"x".to_vec()));
    assert_eq!(tree.get(b"depth-3").unwrap(), None);
    assert_eq!(tree.get(b"depth-4").unwrap(), None);
}

/// Deleting a key this transaction itself inserted rolls all the way back
/// to absence.
#[test]
fn test_insert_then_delete_then_rollback() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"t1").unwrap();

    tree.put(b"pre", b"existing").unwrap();

    let tx = db.begin().unwrap();
    tree.store(&tx, b"new", b"v").unwrap();
    tree.delete(&tx, b"new").unwrap();
    tree.delete(&tx, b"pre").unwrap();
    tx.reset().unwrap();

    assert_eq!(tree.get(b"new").unwrap(), None);
    assert_eq!(tree.get(b"pre").unwrap(), Some(b"existing".to_vec()));
    assert_eq!(tree.count().unwrap(), 1);
}
