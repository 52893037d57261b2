#[path = "../test_utils/mod.rs"]
mod test_utils;

mod basic_test;
mod concurrent_test;
mod crash_test;
mod deadlock_test;
mod fragmented_test;
mod scope_test;
mod tree_admin_test;
mod value_stream_test;
