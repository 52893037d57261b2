use std::time::Duration;

use aspen_db::{Database, DurabilityMode, Options};
use tempfile::TempDir;

/// # Conduct the initialization
///
/// - Setting up log configurations.
pub fn setup() {
    aspen_db::utils::init_log();
}

/// Options for a throwaway database: small pages so trees grow multiple
/// levels quickly, and no background checkpoint timer so tests control
/// checkpoints themselves.
pub fn test_options(dir: &TempDir) -> Options {
    Options::new(dir.path().join("test-db"))
        .page_size(1024)
        .cache_bytes(64 * 1024, 4 * 1024 * 1024)
        .checkpoint_rate(Duration::from_secs(0))
        .lock_timeout(Duration::from_millis(500))
}

pub fn new_db(dir: &TempDir) -> Database {
    Database::open(test_options(dir)).unwrap()
}

pub fn new_db_with(dir: &TempDir, durability: DurabilityMode) -> Database {
    Database::open(test_options(dir).durability_mode(durability)).unwrap()
}

pub fn key(i: u64) -> Vec<u8> {
    format!("key-{:010}", i).into_bytes()
}

pub fn value(i: u64) -> Vec<u8> {
    format!("value-{:010}", i).into_bytes()
}

/// Count the `<base>.redo.<N>` files currently on disk.
pub fn redo_segment_count(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .contains(".redo.")
        })
        .count()
}
