use std::sync::{Arc, RwLock, Weak};

use crate::btree::fragment;
use crate::btree::node::{LeafValue, Node};
use crate::btree::tree::{BTree, LeafHit, SeekOp};
use crate::error::DbError;

/// The byte-string immediately after `key` in unsigned lexicographic order.
fn successor(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.extend_from_slice(key);
    out.push(0);
    out
}

struct Position {
    /// The reference key: the entry's key, or the requested key when
    /// `not_found` is set.
    key: Vec<u8>,
    /// Copied under the leaf latch at positioning time. `None` for ghosts
    /// and for not-found positions.
    value: Option<LeafValue>,
    leaf: Weak<RwLock<Node>>,
    epoch: u64,
    /// Entry index, or the insertion-complement position when `not_found`.
    pos: usize,
    not_found: bool,
}

/// A cursor over one tree. A frame binds to its leaf by weak pointer and
/// epoch: while the leaf is structurally untouched, movement is a local
/// index step; any structural change makes the cursor re-seek by its
/// reference key, which restores exactly the position or its
/// insertion-complement.
pub struct Cursor {
    tree: Arc<BTree>,
    position: Option<Position>,
}

impl Cursor {
    pub(crate) fn new(tree: Arc<BTree>) -> Self {
        Self {
            tree,
            position: None,
        }
    }

    pub fn reset(&mut self) {
        self.position = None;
    }

    /// The key the cursor is at, if positioned. For a not-found position
    /// this is the key that was searched.
    pub fn key(&self) -> Option<&[u8]> {
        self.position.as_ref().map(|p| p.key.as_slice())
    }

    pub fn is_positioned(&self) -> bool {
        self.position.is_some()
    }

    /// True when the cursor is parked on a key that was not present.
    pub fn not_found(&self) -> bool {
        self.position.as_ref().map(|p| p.not_found).unwrap_or(false)
    }

    /// Materialize the current value. Ghosts and not-found positions read
    /// as `None`.
    pub fn value(&self) -> Result<Option<Vec<u8>>, DbError> {
        match self.position.as_ref().and_then(|p| p.value.as_ref()) {
            None => Ok(None),
            Some(LeafValue::Ghost { .. }) => Ok(None),
            Some(LeafValue::Inline(v)) => Ok(Some(v.clone())),
            Some(LeafValue::Fragmented(desc)) => Ok(Some(fragment::reconstruct(
                self.tree.storage(),
                desc,
            )?)),
        }
    }

    pub(crate) fn raw_value(&self) -> Option<&LeafValue> {
        self.position.as_ref().and_then(|p| p.value.as_ref())
    }

    fn set_hit(&mut self, hit: LeafHit) {
        self.position = Some(Position {
            key: hit.key,
            value: Some(hit.value),
            leaf: hit.leaf,
            epoch: hit.epoch,
            pos: hit.pos,
            not_found: false,
        });
    }

    fn set_not_found(&mut self, key: Vec<u8>, at: Option<&LeafHit>) {
        self.position = Some(Position {
            key,
            value: None,
            leaf: at.map(|h| h.leaf.clone()).unwrap_or_default(),
            epoch: at.map(|h| h.epoch).unwrap_or(0),
            pos: at.map(|h| h.pos).unwrap_or(0),
            not_found: true,
        });
    }

    /// Move to the first non-ghost entry.
    pub fn first(&mut self) -> Result<Option<&[u8]>, DbError> {
        let hit = self.tree.seek(SeekOp::First)?;
        self.land_forward(hit)
    }

    pub fn last(&mut self) -> Result<Option<&[u8]>, DbError> {
        let hit = self.tree.seek(SeekOp::Last)?;
        self.land_backward(hit)
    }

    /// Position exactly at `key`. Ghost entries are retained (the position
    /// exists, the value reads as `None`) so a lock can be established; a
    /// missing key leaves a not-found position.
    pub fn find(&mut self, key: &[u8]) -> Result<bool, DbError> {
        let hit = self.tree.seek(SeekOp::Ge(key.to_vec()))?;
        match hit {
            Some(h) if h.key == key => {
                self.set_hit(h);
                Ok(true)
            }
            other => {
                self.set_not_found(key.to_vec(), other.as_ref());
                Ok(false)
            }
        }
    }

    /// `find`, but probe the currently bound leaf first. Correct whenever
    /// `find` is; faster when the target lands in the same leaf.
    pub fn find_nearby(&mut self, key: &[u8]) -> Result<bool, DbError> {
        if let Some(p) = &self.position {
            if let Some(pod) = p.leaf.upgrade() {
                let guard = pod.read().unwrap();
                if !guard.detached && guard.is_leaf() && guard.epoch == p.epoch {
                    if let Ok(pos) = guard.leaf_search(key) {
                        let entry = &guard.leaf_entries()[pos];
                        let hit = LeafHit {
                            key: entry.key.clone(),
                            value: entry.value.clone(),
                            leaf: Arc::downgrade(&pod),
                            epoch: guard.epoch,
                            pos,
                        };
                        drop(guard);
                        self.set_hit(hit);
                        return Ok(true);
                    }
                }
            }
        }
        self.find(key)
    }

    pub fn find_ge(&mut self, key: &[u8]) -> Result<Option<&[u8]>, DbError> {
        let hit = self.tree.seek(SeekOp::Ge(key.to_vec()))?;
        self.land_forward(hit)
    }

    pub fn find_gt(&mut self, key: &[u8]) -> Result<Option<&[u8]>, DbError> {
        let hit = self.tree.seek(SeekOp::Ge(successor(key)))?;
        self.land_forward(hit)
    }

    pub fn find_le(&mut self, key: &[u8]) -> Result<Option<&[u8]>, DbError> {
        let hit = self.tree.seek(SeekOp::Lt(successor(key)))?;
        self.land_backward(hit)
    }

    pub fn find_lt(&mut self, key: &[u8]) -> Result<Option<&[u8]>, DbError> {
        let hit = self.tree.seek(SeekOp::Lt(key.to_vec()))?;
        self.land_backward(hit)
    }

    /// Advance to the next non-ghost entry. While the bound leaf is
    /// unchanged this is a local step; otherwise the cursor re-seeks from
    /// its reference key.
    pub fn next(&mut self) -> Result<Option<&[u8]>, DbError> {
        let (ref_key, start_at) = match &self.position {
            None => return self.first(),
            Some(p) => (p.key.clone(), if p.not_found { p.pos } else { p.pos + 1 }),
        };

        // Fast path: same leaf, same epoch.
        if let Some(p) = &self.position {
            if let Some(pod) = p.leaf.upgrade() {
                let guard = pod.read().unwrap();
                if !guard.detached && guard.is_leaf() && guard.epoch == p.epoch {
                    let entries = guard.leaf_entries();
                    let mut pos = start_at;
                    while pos < entries.len() {
                        if !entries[pos].value.is_ghost() {
                            let hit = LeafHit {
                                key: entries[pos].key.clone(),
                                value: entries[pos].value.clone(),
                                leaf: Arc::downgrade(&pod),
                                epoch: guard.epoch,
                                pos,
                            };
                            drop(guard);
                            self.set_hit(hit);
                            return Ok(self.key());
                        }
                        pos += 1;
                    }
                    // Off this leaf's end; fall to the seek path.
                }
            }
        }

        let hit = self.tree.seek(SeekOp::Ge(successor(&ref_key)))?;
        self.land_forward(hit)
    }

    pub fn previous(&mut self) -> Result<Option<&[u8]>, DbError> {
        let ref_key = match &self.position {
            None => return self.last(),
            Some(p) => p.key.clone(),
        };

        if let Some(p) = &self.position {
            if !p.not_found {
                if let Some(pod) = p.leaf.upgrade() {
                    let guard = pod.read().unwrap();
                    if !guard.detached && guard.is_leaf() && guard.epoch == p.epoch {
                        let entries = guard.leaf_entries();
                        let mut pos = p.pos;
                        while pos > 0 {
                            pos -= 1;
                            if !entries[pos].value.is_ghost() {
                                let hit = LeafHit {
                                    key: entries[pos].key.clone(),
                                    value: entries[pos].value.clone(),
                                    leaf: Arc::downgrade(&pod),
                                    epoch: guard.epoch,
                                    pos,
                                };
                                drop(guard);
                                self.set_hit(hit);
                                return Ok(self.key());
                            }
                        }
                    }
                }
            }
        }

        let hit = self.tree.seek(SeekOp::Lt(ref_key))?;
        self.land_backward(hit)
    }

    /// Move `n` entries forward (positive) or backward (negative).
    pub fn skip(&mut self, n: i64) -> Result<Option<&[u8]>, DbError> {
        if n == 0 {
            return Ok(self.key());
        }
        let mut remaining = n.abs();
        while remaining > 0 {
            let moved = if n > 0 { self.next()? } else { self.previous()? };
            if moved.is_none() {
                self.reset();
                return Ok(None);
            }
            remaining -= 1;
        }
        Ok(self.key())
    }

    /// Jump to a random non-ghost entry.
    pub fn random(&mut self) -> Result<Option<&[u8]>, DbError> {
        match self.tree.random()? {
            Some(hit) => {
                self.set_hit(hit);
                Ok(self.key())
            }
            None => {
                self.reset();
                Ok(None)
            }
        }
    }

    fn land_forward(&mut self, mut hit: Option<LeafHit>) -> Result<Option<&[u8]>, DbError> {
        loop {
            match hit {
                None => {
                    self.reset();
                    return Ok(None);
                }
                Some(h) => {
                    if h.value.is_ghost() {
                        hit = self.tree.seek(SeekOp::Ge(successor(&h.key)))?;
                        continue;
                    }
                    self.set_hit(h);
                    return Ok(self.key());
                }
            }
        }
    }

    fn land_backward(&mut self, mut hit: Option<LeafHit>) -> Result<Option<&[u8]>, DbError> {
        loop {
            match hit {
                None => {
                    self.reset();
                    return Ok(None);
                }
                Some(h) => {
                    if h.value.is_ghost() {
                        hit = self.tree.seek(SeekOp::Lt(h.key.clone()))?;
                        continue;
                    }
                    self.set_hit(h);
                    return Ok(self.key());
                }
            }
        }
    }
}
