pub mod cursor;
pub mod fragment;
pub mod node;
pub mod node_cache;
pub mod tree;

pub use cursor::Cursor;
pub use node::{CachedState, LeafValue, Node, NodeKind};
pub use node_cache::NodeCache;
pub use tree::BTree;
