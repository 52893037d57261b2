use std::convert::TryInto;
use std::sync::Arc;
use std::thread;

use aspen_db::Database;
use rand::Rng;

use crate::test_utils::{key, new_db, setup, value};

// Insert one row under an auto-commit transaction and report it back.
fn inserter(db: &Arc<Database>, s: &crossbeam::channel::Sender<u64>) {
    let mut rng = rand::thread_rng();
    let n: u64 = rng.gen_range(0, u64::max_value());

    let tree = db.open_tree(b"t1").unwrap();
    tree.put(&key(n), &value(n)).unwrap();

    s.send(n).unwrap();
}

// Delete a row some inserter reported.
fn deleter(db: &Arc<Database>, r: &crossbeam::channel::Receiver<u64>) {
    let n = r.recv().unwrap();
    let tree = db.open_tree(b"t1").unwrap();
    tree.remove(&key(n)).unwrap();
}

/// Lots of inserts and deletes simultaneously; the tree must stay ordered
/// and structurally sound throughout, and the surviving row count must be
/// exact.
#[test]
fn test_concurrent_insert_delete() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(new_db(&dir));
    let tree = db.open_tree(b"t1").unwrap();

    let seed_rows = 500u64;
    for i in 0..seed_rows {
        tree.put(&key(i), &value(i)).unwrap();
    }
    tree.check_integrity().unwrap();

    let (sender, receiver) = crossbeam::channel::unbounded();

    // test 1: concurrent inserts
    {
        let mut handles = Vec::new();
        for _ in 0..200 {
            let local_db = Arc::clone(&db);
            let local_sender = sender.clone();
            handles.push(thread::spawn(move || inserter(&local_db, &local_sender)));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        tree.check_integrity().unwrap();
        assert_eq!(tree.count().unwrap(), seed_rows + 200);
    }

    // test 2: concurrent deletes of the rows just inserted
    {
        let mut handles = Vec::new();
        for _ in 0..200 {
            let local_db = Arc::clone(&db);
            let local_receiver = receiver.clone();
            handles.push(thread::spawn(move || deleter(&local_db, &local_receiver)));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        tree.check_integrity().unwrap();
        assert_eq!(tree.count().unwrap(), seed_rows);
    }

    // test 3: mixed workload with a checkpoint running in the middle
    {
        let mut handles = Vec::new();
        for _ in 0..100 {
            let local_db = Arc::clone(&db);
            let local_sender = sender.clone();
            handles.push(thread::spawn(move || inserter(&local_db, &local_sender)));
        }
        db.checkpoint().unwrap();
        for _ in 0..100 {
            let local_db = Arc::clone(&db);
            let local_receiver = receiver.clone();
            handles.push(thread::spawn(move || deleter(&local_db, &local_receiver)));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        tree.check_integrity().unwrap();
        assert_eq!(tree.count().unwrap(), seed_rows);
    }
}

/// Concurrent readers racing writers observe only whole committed values.
#[test]
fn test_readers_see_committed_values_only() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(new_db(&dir));
    let tree = db.open_tree(b"t1").unwrap();
    tree.put(b"k", &0u64.to_le_bytes()).unwrap();

    let writer_db = Arc::clone(&db);
    let writer = thread::spawn(move || {
        let tree = writer_db.open_tree(b"t1").unwrap();
        for i in 1..=100u64 {
            tree.put(b"k", &i.to_le_bytes()).unwrap();
        }
    });

    let mut last = 0u64;
    for _ in 0..200 {
        if let Some(v) = tree.get(b"k").unwrap() {
            let n = u64::from_le_bytes(v.as_slice().try_into().unwrap());
            assert!(n >= last, "value went backwards: {} after {}", n, last);
            last = n;
        }
    }
    writer.join().unwrap();
    assert_eq!(
        tree.get(b"k").unwrap(),
        Some(100u64.to_le_bytes().to_vec())
    );
}

/// Many threads hammering disjoint key ranges; everything lands.
#[test]
fn test_parallel_bulk_load() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(new_db(&dir));

    let threads = 8u64;
    let per_thread = 300u64;
    let mut handles = Vec::new();
    for t in 0..threads {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            let tree = db.open_tree(b"bulk").unwrap();
            for i in 0..per_thread {
                let n = t * per_thread + i;
                tree.put(&key(n), &value(n)).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let tree = db.open_tree(b"bulk").unwrap();
    tree.check_integrity().unwrap();
    assert_eq!(tree.count().unwrap(), threads * per_thread);
    for n in (0..threads * per_thread).step_by(53) {
        assert_eq!(tree.get(&key(n)).unwrap(), Some(value(n)));
    }
}
