use crate::test_utils::{new_db, setup};

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Random-access reads over inline and fragmented values.
#[test]
fn test_read_value_range() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"t").unwrap();

    let small = patterned(100);
    let large = patterned(50_000);
    tree.put(b"small", &small).unwrap();
    tree.put(b"large", &large).unwrap();

    let tx = db.begin().unwrap();

    assert_eq!(
        tree.value_length(&tx, b"small").unwrap(),
        Some(small.len() as u64)
    );
    assert_eq!(
        tree.value_length(&tx, b"large").unwrap(),
        Some(large.len() as u64)
    );
    assert_eq!(tree.value_length(&tx, b"missing").unwrap(), None);

    let mut buf = vec![0u8; 64];
    let n = tree.read_value_range(&tx, b"small", 50, &mut buf).unwrap();
    assert_eq!(n, 50, "short read at the value end");
    assert_eq!(&buf[..n], &small[50..]);

    let n = tree.read_value_range(&tx, b"large", 30_000, &mut buf).unwrap();
    assert_eq!(n, 64);
    assert_eq!(&buf[..n], &large[30_000..30_064]);

    assert_eq!(
        tree.read_value_range(&tx, b"large", 60_000, &mut buf).unwrap(),
        0
    );
    tx.commit().unwrap();
}

/// Transactional range writes patch in place, roll back with the
/// transaction, and never change the value's length.
#[test]
fn test_write_value_range() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"t").unwrap();

    let mut expected = patterned(20_000);
    tree.put(b"v", &expected).unwrap();

    // step 1: committed patch
    let tx = db.begin().unwrap();
    tree.write_value_range(&tx, b"v", 5_000, &[0xeeu8; 300]).unwrap();
    tx.commit().unwrap();
    expected[5_000..5_300].copy_from_slice(&[0xeeu8; 300]);
    assert_eq!(tree.get(b"v").unwrap().unwrap(), expected);

    // step 2: rolled-back patch
    let tx = db.begin().unwrap();
    tree.write_value_range(&tx, b"v", 0, &[0x11u8; 100]).unwrap();
    tx.reset().unwrap();
    assert_eq!(tree.get(b"v").unwrap().unwrap(), expected);

    // step 3: growing the value this way is refused
    let tx = db.begin().unwrap();
    assert!(tree
        .write_value_range(&tx, b"v", 19_990, &[1u8; 100])
        .is_err());
    tx.reset().unwrap();
}

/// Blank sparse values: created without data pages, readable as zeroes,
/// filled by patches that allocate only what they touch.
#[test]
fn test_sparse_blank_value() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir);
    let tree = db.open_tree(b"t").unwrap();

    // step 1: a 10 MiB blank costs almost nothing
    let before = db.stats().total_pages;
    tree.create_blank_value(b"sparse", 10 << 20).unwrap();
    let after = db.stats().total_pages;
    assert!(
        after - before < 20,
        "blank value allocated {} pages",
        after - before
    );

    // step 2: unwritten regions read as zero
    let tx = db.begin().unwrap();
    let mut buf = vec![0xffu8; 512];
    let n = tree
        .read_value_range(&tx, b"sparse", 5 << 20, &mut buf)
        .unwrap();
    assert_eq!(n, 512);
    assert!(buf.iter().all(|&b| b == 0));
    tx.commit().unwrap();

    // step 3: a patch deep inside the value
    tree.patch_value(b"sparse", 5 << 20, b"hello sparse world").unwrap();
    let tx = db.begin().unwrap();
    let mut buf = vec![0u8; 18];
    tree.read_value_range(&tx, b"sparse", 5 << 20, &mut buf).unwrap();
    assert_eq!(&buf, b"hello sparse world");
    tx.commit().unwrap();
}
