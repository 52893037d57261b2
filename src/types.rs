use std::cmp::Ordering;
use std::sync::{Arc, RwLock};

use crate::error::DbError;

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

pub type DbResult = Result<(), DbError>;

/// Page ids are 48-bit; ids 0 and 1 address the two commit headers and are
/// never handed out by the allocator.
pub type PageId = u64;

pub type TreeId = u64;

/// A transaction id of 0 denotes "no redo" (internal bogus transactions).
pub type TxnId = u64;

pub const MAX_PAGE_ID: PageId = (1 << 48) - 1;

/// The registry tree maps tree id to root page id.
pub const REGISTRY_TREE_ID: TreeId = 0;

/// The key-map tree stores name/id mappings and the tree-id scramble mask.
pub const KEY_MAP_TREE_ID: TreeId = 1;

/// User tree ids start here; everything below is reserved for the engine.
pub const MIN_USER_TREE_ID: TreeId = 0x100;

pub fn is_user_tree_id(id: TreeId) -> bool {
    id >= MIN_USER_TREE_ID
}

/// Keys order by unsigned byte-wise lexicographic comparison. This is the one
/// comparator in the engine; trees have no pluggable ordering.
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_order() {
        assert_eq!(compare_keys(b"", b""), Ordering::Equal);
        assert_eq!(compare_keys(b"a", b"ab"), Ordering::Less);
        assert_eq!(compare_keys(&[0xffu8], &[0x00, 0x00]), Ordering::Greater);
        assert_eq!(compare_keys(&[1, 2, 3], &[1, 2, 3]), Ordering::Equal);
    }

    #[test]
    fn test_reserved_tree_ids() {
        assert!(!is_user_tree_id(REGISTRY_TREE_ID));
        assert!(!is_user_tree_id(KEY_MAP_TREE_ID));
        assert!(!is_user_tree_id(0xff));
        assert!(is_user_tree_id(MIN_USER_TREE_ID));
    }
}
