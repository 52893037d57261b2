use crate::error::DbError;
use crate::types::{PageId, TxnId};
use crate::utils::{ByteReader, ByteWriter};

pub const TAG_LEAF: u8 = 1;
pub const TAG_INTERNAL: u8 = 2;
pub const TAG_UNDO: u8 = 5;
pub const TAG_STUB: u8 = 6;

const VALUE_INLINE: u8 = 0;
const VALUE_FRAGMENTED: u8 = 1;
const VALUE_GHOST: u8 = 2;

/// Commit-state coloring: a node is dirty with respect to the next checkpoint
/// iff its color equals the allocator's current color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedState {
    Clean,
    Dirty(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeafValue {
    Inline(Vec<u8>),
    /// Encoded fragment descriptor; see `btree::fragment`.
    Fragmented(Vec<u8>),
    /// Deleted by a not-yet-committed transaction. Kept so the key lock has
    /// an entry to attach to; traversal skips these, `find` does not.
    Ghost { txn_id: TxnId },
}

impl LeafValue {
    pub fn encoded_len(&self) -> usize {
        match self {
            LeafValue::Inline(v) => 1 + 4 + v.len(),
            LeafValue::Fragmented(d) => 1 + 2 + d.len(),
            LeafValue::Ghost { .. } => 1 + 8,
        }
    }

    pub fn is_ghost(&self) -> bool {
        matches!(self, LeafValue::Ghost { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: LeafValue,
}

impl LeafEntry {
    pub fn encoded_len(&self) -> usize {
        2 + self.key.len() + self.value.encoded_len()
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Leaf {
        entries: Vec<LeafEntry>,
    },
    /// `children.len() == keys.len() + 1`; child `i` holds keys strictly
    /// below `keys[i]`, the last child holds everything from the last key up.
    Internal {
        keys: Vec<Vec<u8>>,
        children: Vec<PageId>,
    },
    /// Placeholder left behind when a tree is reclaimed; any access through a
    /// stale handle fails instead of touching recycled pages.
    Stub,
}

/// In-memory wrapper over a page. The surrounding `Pod<Node>` RwLock is the
/// per-node latch; everything here is accessed under it.
#[derive(Debug)]
pub struct Node {
    pub id: PageId,
    pub kind: NodeKind,
    pub state: CachedState,
    /// Bumped on every structural change (entries shifting positions).
    /// Cursor frames compare epochs to decide whether to re-seek.
    pub epoch: u64,
    /// Root nodes are pinned and never evicted.
    pub pinned: bool,
    /// Set under the exclusive latch when the node leaves the cache
    /// (eviction or page deletion). A holder of a stale pod must re-fetch.
    pub detached: bool,
}

const LEAF_HEADER_LEN: usize = 1 + 2;
const INTERNAL_HEADER_LEN: usize = 1 + 2;

impl Node {
    pub fn new_leaf(id: PageId) -> Self {
        Self {
            id,
            kind: NodeKind::Leaf {
                entries: Vec::new(),
            },
            state: CachedState::Clean,
            epoch: 0,
            pinned: false,
            detached: false,
        }
    }

    pub fn new_internal(id: PageId, keys: Vec<Vec<u8>>, children: Vec<PageId>) -> Self {
        debug_assert_eq!(children.len(), keys.len() + 1);
        Self {
            id,
            kind: NodeKind::Internal { keys, children },
            state: CachedState::Clean,
            epoch: 0,
            pinned: false,
            detached: false,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }

    pub fn is_stub(&self) -> bool {
        matches!(self.kind, NodeKind::Stub)
    }

    /// Size of this node serialized, without padding.
    pub fn encoded_size(&self) -> usize {
        match &self.kind {
            NodeKind::Leaf { entries } => {
                LEAF_HEADER_LEN + entries.iter().map(LeafEntry::encoded_len).sum::<usize>()
            }
            NodeKind::Internal { keys, children } => {
                INTERNAL_HEADER_LEN
                    + keys.iter().map(|k| 2 + k.len()).sum::<usize>()
                    + 8 * children.len()
            }
            NodeKind::Stub => 1,
        }
    }

    pub fn encode(&self, page_size: usize) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(page_size);
        match &self.kind {
            NodeKind::Leaf { entries } => {
                w.write_u8(TAG_LEAF);
                w.write_u16(entries.len() as u16);
                for entry in entries {
                    w.write_bytes_u16(&entry.key);
                    match &entry.value {
                        LeafValue::Inline(v) => {
                            w.write_u8(VALUE_INLINE);
                            w.write_bytes_u32(v);
                        }
                        LeafValue::Fragmented(d) => {
                            w.write_u8(VALUE_FRAGMENTED);
                            w.write_bytes_u16(d);
                        }
                        LeafValue::Ghost { txn_id } => {
                            w.write_u8(VALUE_GHOST);
                            w.write_u64(*txn_id);
                        }
                    }
                }
            }
            NodeKind::Internal { keys, children } => {
                w.write_u8(TAG_INTERNAL);
                w.write_u16(keys.len() as u16);
                for key in keys {
                    w.write_bytes_u16(key);
                }
                for child in children {
                    w.write_u64(*child);
                }
            }
            NodeKind::Stub => {
                w.write_u8(TAG_STUB);
            }
        }
        w.into_padded_vec(page_size)
    }

    pub fn decode(id: PageId, buf: &[u8]) -> Result<Self, DbError> {
        let mut r = ByteReader::new(buf);
        let tag = r.read_u8()?;
        let kind = match tag {
            TAG_LEAF => {
                let count = r.read_u16()? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = r.read_bytes_u16()?.to_vec();
                    let value = match r.read_u8()? {
                        VALUE_INLINE => LeafValue::Inline(r.read_bytes_u32()?.to_vec()),
                        VALUE_FRAGMENTED => LeafValue::Fragmented(r.read_bytes_u16()?.to_vec()),
                        VALUE_GHOST => LeafValue::Ghost {
                            txn_id: r.read_u64()?,
                        },
                        other => {
                            return Err(DbError::corrupt(format!(
                                "page {}: unknown value tag {}",
                                id, other
                            )))
                        }
                    };
                    entries.push(LeafEntry { key, value });
                }
                NodeKind::Leaf { entries }
            }
            TAG_INTERNAL => {
                let count = r.read_u16()? as usize;
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(r.read_bytes_u16()?.to_vec());
                }
                let mut children = Vec::with_capacity(count + 1);
                for _ in 0..=count {
                    children.push(r.read_u64()?);
                }
                NodeKind::Internal { keys, children }
            }
            TAG_STUB => NodeKind::Stub,
            other => {
                return Err(DbError::corrupt(format!(
                    "page {}: unknown node tag {}",
                    id, other
                )))
            }
        };
        Ok(Self {
            id,
            kind,
            state: CachedState::Clean,
            epoch: 0,
            pinned: false,
            detached: false,
        })
    }

    /// Binary search a leaf. `Ok(pos)` when the key exists, `Err(pos)` with
    /// the insertion position otherwise.
    pub fn leaf_search(&self, key: &[u8]) -> Result<usize, usize> {
        match &self.kind {
            NodeKind::Leaf { entries } => {
                entries.binary_search_by(|e| e.key.as_slice().cmp(key))
            }
            _ => panic!("leaf_search on a non-leaf node"),
        }
    }

    pub fn leaf_entries(&self) -> &Vec<LeafEntry> {
        match &self.kind {
            NodeKind::Leaf { entries } => entries,
            _ => panic!("leaf_entries on a non-leaf node"),
        }
    }

    pub fn leaf_entries_mut(&mut self) -> &mut Vec<LeafEntry> {
        match &mut self.kind {
            NodeKind::Leaf { entries } => entries,
            _ => panic!("leaf_entries_mut on a non-leaf node"),
        }
    }

    /// Child index covering `key`.
    pub fn route(&self, key: &[u8]) -> usize {
        match &self.kind {
            NodeKind::Internal { keys, .. } => {
                // Number of separators <= key.
                match keys.binary_search_by(|k| k.as_slice().cmp(key)) {
                    Ok(pos) => pos + 1,
                    Err(pos) => pos,
                }
            }
            _ => panic!("route on a non-internal node"),
        }
    }

    pub fn child_at(&self, idx: usize) -> PageId {
        match &self.kind {
            NodeKind::Internal { children, .. } => children[idx],
            _ => panic!("child_at on a non-internal node"),
        }
    }

    pub fn child_count(&self) -> usize {
        match &self.kind {
            NodeKind::Internal { children, .. } => children.len(),
            _ => 0,
        }
    }

    pub fn set_child(&mut self, idx: usize, id: PageId) {
        match &mut self.kind {
            NodeKind::Internal { children, .. } => children[idx] = id,
            _ => panic!("set_child on a non-internal node"),
        }
    }

    /// Replace child `idx` with the two halves of its split.
    pub fn insert_split(&mut self, idx: usize, sep: Vec<u8>, left: PageId, right: PageId) {
        match &mut self.kind {
            NodeKind::Internal { keys, children } => {
                children[idx] = left;
                keys.insert(idx, sep);
                children.insert(idx + 1, right);
                self.epoch += 1;
            }
            _ => panic!("insert_split on a non-internal node"),
        }
    }

    /// Drop separator `idx` and the child to its right, after a merge moved
    /// that child's contents into the left sibling.
    pub fn remove_separator(&mut self, idx: usize) {
        match &mut self.kind {
            NodeKind::Internal { keys, children } => {
                keys.remove(idx);
                children.remove(idx + 1);
                self.epoch += 1;
            }
            _ => panic!("remove_separator on a non-internal node"),
        }
    }

    /// Split roughly in half by encoded size. Returns the separator key and
    /// the kind holding the upper half; the caller wraps it in a new node.
    pub fn split(&mut self) -> (Vec<u8>, NodeKind) {
        self.epoch += 1;
        match &mut self.kind {
            NodeKind::Leaf { entries } => {
                let total: usize = entries.iter().map(LeafEntry::encoded_len).sum();
                let mut acc = 0usize;
                let mut split_at = entries.len() - 1;
                for (i, e) in entries.iter().enumerate() {
                    acc += e.encoded_len();
                    if acc >= total / 2 {
                        split_at = (i + 1).min(entries.len() - 1).max(1);
                        break;
                    }
                }
                let upper = entries.split_off(split_at);
                let sep = upper[0].key.clone();
                (sep, NodeKind::Leaf { entries: upper })
            }
            NodeKind::Internal { keys, children } => {
                // The middle key moves up; it separates the halves without
                // remaining in either.
                let mid = keys.len() / 2;
                let sep = keys[mid].clone();
                let upper_keys = keys.split_off(mid + 1);
                keys.pop();
                let upper_children = children.split_off(mid + 1);
                (
                    sep,
                    NodeKind::Internal {
                        keys: upper_keys,
                        children: upper_children,
                    },
                )
            }
            NodeKind::Stub => panic!("split on a stub node"),
        }
    }
}
