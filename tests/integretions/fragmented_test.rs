use aspen_db::Database;

use crate::test_utils::{new_db, setup, test_options};

fn big_value(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 131 % 251) as u8).collect()
}

/// A megabyte value fragments across pages, reads back byte-identical, and
/// its pages return to the allocator after delete plus a checkpoint.
#[test]
fn test_fragmented_value_lifecycle() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"blobs").unwrap();
    let page_size = 1024usize;

    // step 1: store a value three orders of magnitude over the inline cap
    let big = big_value(1_000_000);
    tree.put(b"big", &big).unwrap();

    // step 2: load it back whole
    let loaded = tree.get(b"big").unwrap().unwrap();
    assert_eq!(loaded.len(), 1_000_000);
    assert_eq!(loaded, big);

    // step 3: make it durable, then delete it
    db.checkpoint().unwrap();
    let free_before = db.stats().free_pages;
    tree.remove(b"big").unwrap();

    // step 4: the pages come back after the deferred frees clear
    db.checkpoint().unwrap();
    db.checkpoint().unwrap();
    let freed = db.stats().free_pages - free_before;
    assert!(
        freed >= 1_000_000 / page_size,
        "only {} pages freed, expected at least {}",
        freed,
        1_000_000 / page_size
    );
}

/// Fragmented values survive close and reopen.
#[test]
fn test_fragmented_value_persists() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let big = big_value(300_000);

    {
        let db = new_db(&dir);
        let tree = db.open_tree(b"blobs").unwrap();
        tree.put(b"big", &big).unwrap();
        db.close().unwrap();
    }

    let db = Database::open(test_options(&dir)).unwrap();
    let tree = db.open_tree(b"blobs").unwrap();
    assert_eq!(tree.get(b"big").unwrap().unwrap(), big);
}

/// Rolling back a transactional overwrite of a fragmented value restores
/// the original bytes; committing it releases the replaced pages.
#[test]
fn test_fragmented_value_rollback() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"blobs").unwrap();

    let original = big_value(100_000);
    tree.put(b"big", &original).unwrap();

    // step 1: overwrite under a transaction, then roll back
    let tx = db.begin().unwrap();
    let replacement = vec![0xaau8; 100_000];
    tree.store(&tx, b"big", &replacement).unwrap();
    tx.reset().unwrap();
    assert_eq!(tree.get(b"big").unwrap().unwrap(), original);

    // step 2: the same overwrite, committed
    let tx = db.begin().unwrap();
    tree.store(&tx, b"big", &replacement).unwrap();
    tx.commit().unwrap();
    assert_eq!(tree.get(b"big").unwrap().unwrap(), replacement);
}

/// A mix of sizes crossing the inline boundary in both directions.
#[test]
fn test_inline_fragmented_boundary() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"t").unwrap();

    // page size 1024 puts the inline cap at 256 bytes
    for len in &[0usize, 1, 255, 256, 257, 1024, 5000] {
        let v = big_value(*len);
        tree.put(b"k", &v).unwrap();
        assert_eq!(tree.get(b"k").unwrap().unwrap(), v, "length {}", len);
    }
    tree.check_integrity().unwrap();
}
