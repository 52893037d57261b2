use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use log::debug;
use rand::Rng;

use crate::btree::fragment;
use crate::btree::node::{LeafEntry, LeafValue, Node, NodeKind};
use crate::error::DbError;
use crate::storage::Storage;
use crate::types::{compare_keys, DbResult, PageId, Pod, TreeId, TxnId};

type WriteGuard<'a> = RwLockWriteGuard<'a, Node>;
type ReadGuard<'a> = RwLockReadGuard<'a, Node>;

/// A B+tree keyed by unsigned byte-wise lexicographic order.
///
/// The root node object is stable: splits push both halves down and
/// collapses pull the surviving child up, so the root pod never changes
/// while the tree is open. Its page id still moves under copy-on-write; the
/// database records the current id in the registry at each checkpoint.
pub struct BTree {
    pub tree_id: TreeId,
    storage: Arc<Storage>,
    root: RwLock<Pod<Node>>,
    /// Invoked when the root's page id moves under copy-on-write; the
    /// database hangs the registry update here. The registry tree itself
    /// has no hook: its root id is recorded in the commit header instead.
    root_moved: RwLock<Option<RootMovedHook>>,
}

type RootMovedHook = Box<dyn Fn(TreeId, PageId) -> DbResult + Send + Sync>;

/// What a mutation descent does at the leaf.
pub(crate) enum StoreAction {
    /// Insert or replace.
    Put(LeafValue),
    /// Delete; `ghost` carries the owning transaction for transactional
    /// deletes, `None` removes the entry outright.
    Delete { ghost: Option<TxnId> },
    /// Physically remove the entry if it is still this transaction's ghost.
    RemoveGhost { txn_id: TxnId },
}

/// What a mutation replaced, for undo images and fragment trash.
#[derive(Debug)]
pub(crate) struct StoreOutcome {
    pub prior: Option<LeafValue>,
    /// True when the action found nothing to do (delete of a missing key).
    pub no_op: bool,
}

enum Outcome {
    Done,
    Split { sep: Vec<u8>, left: PageId, right: PageId },
    Underflow,
    /// A latched node turned out to be detached; restart from the root.
    Retry,
}

/// Read-path target.
pub(crate) enum SeekOp {
    Ge(Vec<u8>),
    Lt(Vec<u8>),
    First,
    Last,
}

/// A positioned leaf entry, copied out under the leaf latch. The weak
/// reference plus epoch let a cursor resume cheaply while the leaf is
/// untouched, and re-seek by key after any structural change.
pub(crate) struct LeafHit {
    pub key: Vec<u8>,
    pub value: LeafValue,
    pub leaf: Weak<RwLock<Node>>,
    pub epoch: u64,
    pub pos: usize,
}

enum SeekOut {
    Hit(LeafHit),
    Miss { bound: Option<Vec<u8>> },
    Retry,
}

impl BTree {
    /// Keys above this fail with `LargeValue`; derived from the page size so
    /// a handful of worst-case entries always fit a node.
    pub fn max_key_len(&self) -> usize {
        self.storage.page_size() / 4
    }

    /// Values above this are stored fragmented.
    pub fn max_inline_len(&self) -> usize {
        self.storage.page_size() / 4
    }

    fn underflow_threshold(&self) -> usize {
        self.storage.page_size() / 2
    }

    /// Create a tree with a fresh empty root leaf.
    pub(crate) fn create(storage: Arc<Storage>, tree_id: TreeId) -> Result<Arc<Self>, DbError> {
        let root = storage.new_node(NodeKind::Leaf {
            entries: Vec::new(),
        })?;
        let id = {
            let mut node = root.write().unwrap();
            node.pinned = true;
            node.id
        };
        storage.cache.make_unevictable(id);
        debug!("created tree {} with root page {}", tree_id, id);
        Ok(Arc::new(Self {
            tree_id,
            storage,
            root: RwLock::new(root),
            root_moved: RwLock::new(None),
        }))
    }

    /// Open a tree whose root page is known (from the registry).
    pub(crate) fn open_root(
        storage: Arc<Storage>,
        tree_id: TreeId,
        root_id: PageId,
    ) -> Result<Arc<Self>, DbError> {
        let root = storage.get_node(root_id)?;
        {
            let mut node = root.write().unwrap();
            node.pinned = true;
        }
        storage.cache.make_unevictable(root_id);
        Ok(Arc::new(Self {
            tree_id,
            storage,
            root: RwLock::new(root),
            root_moved: RwLock::new(None),
        }))
    }

    fn root_pod(&self) -> Pod<Node> {
        Arc::clone(&self.root.read().unwrap())
    }

    pub fn root_id(&self) -> PageId {
        self.root_pod().read().unwrap().id
    }

    pub(crate) fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub(crate) fn set_root_moved(&self, hook: RootMovedHook) {
        *self.root_moved.write().unwrap() = Some(hook);
    }

    // ------------------------------------------------------------------
    // reads
    // ------------------------------------------------------------------

    /// Raw entry lookup; ghosts come back as ghosts.
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<LeafValue>, DbError> {
        match self.seek(SeekOp::Ge(key.to_vec()))? {
            Some(hit) if hit.key == key => Ok(Some(hit.value)),
            _ => Ok(None),
        }
    }

    /// Materialized lookup: ghosts read as absent, fragmented values are
    /// reconstructed.
    pub(crate) fn load_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        match self.get(key)? {
            None | Some(LeafValue::Ghost { .. }) => Ok(None),
            Some(LeafValue::Inline(v)) => Ok(Some(v)),
            Some(LeafValue::Fragmented(desc)) => {
                Ok(Some(fragment::reconstruct(&self.storage, &desc)?))
            }
        }
    }

    /// Latch-coupled read descent. Ghosts are returned as hits; traversal
    /// callers skip them, `find` callers keep them.
    pub(crate) fn seek(&self, op: SeekOp) -> Result<Option<LeafHit>, DbError> {
        let mut op = op;
        loop {
            let root_pod = self.root_pod();
            let guard = root_pod.read().unwrap();
            if guard.is_stub() {
                return Err(DbError::Closed(Some("tree was dropped".to_string())));
            }
            if guard.detached || !guard.pinned {
                continue;
            }
            match self.seek_descend(&root_pod, guard, &op)? {
                SeekOut::Hit(hit) => return Ok(Some(hit)),
                SeekOut::Miss { bound: None } => return Ok(None),
                SeekOut::Miss { bound: Some(b) } => {
                    // The answer lives under a neighbouring subtree; chase
                    // the tightest separator bound the descent saw.
                    op = match op {
                        SeekOp::Ge(_) | SeekOp::First => SeekOp::Ge(b),
                        SeekOp::Lt(_) | SeekOp::Last => SeekOp::Lt(b),
                    };
                }
                SeekOut::Retry => {}
            }
        }
    }

    fn seek_descend<'a>(
        &self,
        pod: &'a Pod<Node>,
        guard: ReadGuard<'a>,
        op: &SeekOp,
    ) -> Result<SeekOut, DbError> {
        match &guard.kind {
            NodeKind::Leaf { entries } => {
                let found = match op {
                    SeekOp::Ge(p) => match guard.leaf_search(p) {
                        Ok(pos) => Some(pos),
                        Err(pos) if pos < entries.len() => Some(pos),
                        Err(_) => None,
                    },
                    SeekOp::Lt(p) => {
                        let ins = match guard.leaf_search(p) {
                            Ok(pos) => pos,
                            Err(pos) => pos,
                        };
                        ins.checked_sub(1)
                    }
                    SeekOp::First => {
                        if entries.is_empty() {
                            None
                        } else {
                            Some(0)
                        }
                    }
                    SeekOp::Last => entries.len().checked_sub(1),
                };
                Ok(match found {
                    Some(pos) => {
                        let entry = &entries[pos];
                        SeekOut::Hit(LeafHit {
                            key: entry.key.clone(),
                            value: entry.value.clone(),
                            leaf: Arc::downgrade(pod),
                            epoch: guard.epoch,
                            pos,
                        })
                    }
                    None => SeekOut::Miss { bound: None },
                })
            }
            NodeKind::Internal { keys, .. } => {
                let idx = match op {
                    SeekOp::Ge(p) => guard.route(p),
                    SeekOp::Lt(p) => match keys.binary_search_by(|k| compare_keys(k, p)) {
                        Ok(pos) => pos,
                        Err(pos) => pos,
                    },
                    SeekOp::First => 0,
                    SeekOp::Last => keys.len(),
                };
                let forward = matches!(op, SeekOp::Ge(_) | SeekOp::First);
                let my_bound = if forward {
                    keys.get(idx).cloned()
                } else {
                    idx.checked_sub(1).and_then(|i| keys.get(i).cloned())
                };
                let child_id = guard.child_at(idx);
                let child_pod = self.storage.get_node(child_id)?;
                let child_guard = child_pod.read().unwrap();
                drop(guard);
                if child_guard.detached {
                    return Ok(SeekOut::Retry);
                }
                match self.seek_descend(&child_pod, child_guard, op)? {
                    SeekOut::Miss { bound: None } => Ok(SeekOut::Miss { bound: my_bound }),
                    other => Ok(other),
                }
            }
            NodeKind::Stub => Err(DbError::Closed(Some("tree was dropped".to_string()))),
        }
    }

    // ------------------------------------------------------------------
    // writes
    // ------------------------------------------------------------------

    /// Insert or replace `key` with raw bytes, fragmenting oversize values
    /// first (outside any latch).
    pub(crate) fn put(&self, key: &[u8], value: &[u8]) -> Result<StoreOutcome, DbError> {
        if value.len() as u64 > u32::max_value() as u64 {
            return Err(DbError::LargeValue {
                len: value.len() as u64,
            });
        }
        let stored = if value.len() <= self.max_inline_len() {
            LeafValue::Inline(value.to_vec())
        } else {
            LeafValue::Fragmented(fragment::fragment(
                &self.storage,
                value,
                self.max_inline_len(),
            )?)
        };
        self.apply(key, StoreAction::Put(stored))
    }

    /// Low-level form of `put` taking an already-shaped value; rollback uses
    /// it to restore prior images exactly.
    pub(crate) fn put_value(&self, key: &[u8], value: LeafValue) -> Result<StoreOutcome, DbError> {
        self.apply(key, StoreAction::Put(value))
    }

    /// Delete `key`. A transactional delete leaves a ghost owned by
    /// `ghost`; a bogus/no-redo delete removes the entry directly.
    pub(crate) fn delete(
        &self,
        key: &[u8],
        ghost: Option<TxnId>,
    ) -> Result<StoreOutcome, DbError> {
        self.apply(key, StoreAction::Delete { ghost })
    }

    /// Commit-time ghost reclamation.
    pub(crate) fn remove_ghost(&self, key: &[u8], txn_id: TxnId) -> DbResult {
        self.apply(key, StoreAction::RemoveGhost { txn_id })?;
        Ok(())
    }

    pub(crate) fn apply(&self, key: &[u8], action: StoreAction) -> Result<StoreOutcome, DbError> {
        if key.len() > self.max_key_len() {
            return Err(DbError::LargeValue {
                len: key.len() as u64,
            });
        }
        let mut result = StoreOutcome {
            prior: None,
            no_op: false,
        };
        // Callers hold the shared commit lock for the whole mutating
        // operation, so the checkpointer's color flip sees a quiesced tree.
        loop {
            let root_pod = self.root_pod();
            let mut guard = root_pod.write().unwrap();
            if guard.is_stub() {
                return Err(DbError::Closed(Some("tree was dropped".to_string())));
            }
            if guard.detached || !guard.pinned {
                continue;
            }
            if self.storage.dirty_node(&mut guard)?.is_some() {
                let new_root = guard.id;
                if let Some(hook) = self.root_moved.read().unwrap().as_ref() {
                    hook(self.tree_id, new_root)?;
                }
            }

            let out = if guard.is_leaf() {
                let out = self.apply_leaf(&mut guard, key, &action, &mut result)?;
                self.finish_root(&mut guard, out)?
            } else {
                // The root's guard moves into the step so it can be dropped
                // as soon as the child below is known to absorb the action.
                self.descend_step(&root_pod, guard, key, &action, &mut result)?
            };

            match out {
                Outcome::Retry => continue,
                _ => return Ok(result),
            }
        }
    }

    /// Resolve a split or underflow that reached the root, while its latch
    /// is still held.
    fn finish_root(&self, guard: &mut Node, out: Outcome) -> Result<Outcome, DbError> {
        Ok(match out {
            Outcome::Split { sep, left, right } => {
                self.push_down_root(guard, sep, left, right)?;
                Outcome::Done
            }
            Outcome::Underflow => {
                self.maybe_collapse_root(guard)?;
                Outcome::Done
            }
            other => other,
        })
    }

    /// Root split: the root keeps its identity; its current content moves to
    /// a fresh left child and both halves are pushed down.
    fn push_down_root(
        &self,
        guard: &mut Node,
        sep: Vec<u8>,
        left: PageId,
        right: PageId,
    ) -> DbResult {
        debug_assert_eq!(left, guard.id);
        let left_pod = self.storage.new_node(NodeKind::Stub)?;
        let lower = std::mem::replace(&mut guard.kind, NodeKind::Stub);
        let left_id = {
            let mut left_node = left_pod.write().unwrap();
            left_node.kind = lower;
            left_node.epoch += 1;
            left_node.id
        };
        self.storage.cache.make_evictable(left_id);
        guard.kind = NodeKind::Internal {
            keys: vec![sep],
            children: vec![left_id, right],
        };
        guard.epoch += 1;
        debug!(
            "root of tree {} split, children {} and {}",
            self.tree_id, left_id, right
        );
        Ok(())
    }

    /// The root's own descent frame: dirty the child under the root latch,
    /// release the latch before recursing when the child is certain to
    /// absorb the action, and otherwise keep it, absorb what comes back
    /// up, and settle any root split or collapse under it.
    fn descend_step<'a>(
        &self,
        pod: &'a Pod<Node>,
        mut guard: WriteGuard<'a>,
        key: &[u8],
        action: &StoreAction,
        result: &mut StoreOutcome,
    ) -> Result<Outcome, DbError> {
        let _ = pod;
        let idx = guard.route(key);
        let child_id = guard.child_at(idx);
        let child_pod = self.storage.get_node(child_id)?;
        let mut child_guard = child_pod.write().unwrap();
        if child_guard.detached {
            return Ok(Outcome::Retry);
        }
        if self.storage.dirty_node(&mut child_guard)?.is_some() {
            guard.set_child(idx, child_guard.id);
        }

        if self.child_is_safe(&child_guard, action) {
            // Nothing can propagate back up; the root latch lets go before
            // the descent continues.
            drop(guard);
            let out = self.store_in(&child_pod, child_guard, key, action, result)?;
            debug_assert!(matches!(out, Outcome::Done | Outcome::Retry));
            return Ok(match out {
                Outcome::Retry => Outcome::Retry,
                _ => Outcome::Done,
            });
        }

        let out = self.store_in(&child_pod, child_guard, key, action, result)?;
        let out = match out {
            Outcome::Split { sep, left, right } => {
                guard.insert_split(idx, sep, left, right);
                if guard.encoded_size() > self.storage.page_size() {
                    self.split_node(&mut guard)?
                } else {
                    Outcome::Done
                }
            }
            Outcome::Underflow => {
                self.merge_children(&mut guard, idx)?;
                if guard.encoded_size() < self.underflow_threshold() {
                    Outcome::Underflow
                } else {
                    Outcome::Done
                }
            }
            other => other,
        };
        self.finish_root(&mut guard, out)
    }

    /// Write descent below the root. This frame owns `guard`; on the safe
    /// path it recurses after the caller's latch is already gone, keeping
    /// the latch chain as short as the action allows.
    fn store_in<'a>(
        &self,
        pod: &'a Pod<Node>,
        mut guard: WriteGuard<'a>,
        key: &[u8],
        action: &StoreAction,
        result: &mut StoreOutcome,
    ) -> Result<Outcome, DbError> {
        let _ = pod;
        if guard.is_leaf() {
            return self.apply_leaf(&mut guard, key, action, result);
        }

        let idx = guard.route(key);
        let child_id = guard.child_at(idx);
        let child_pod = self.storage.get_node(child_id)?;
        let mut child_guard = child_pod.write().unwrap();
        if child_guard.detached {
            return Ok(Outcome::Retry);
        }
        if self.storage.dirty_node(&mut child_guard)?.is_some() {
            guard.set_child(idx, child_guard.id);
        }

        if self.child_is_safe(&child_guard, action) {
            // Nothing can propagate back up; this node and every ancestor
            // still latched above it can let go now.
            drop(guard);
            let out = self.store_in(&child_pod, child_guard, key, action, result)?;
            debug_assert!(matches!(out, Outcome::Done | Outcome::Retry));
            return Ok(match out {
                Outcome::Retry => Outcome::Retry,
                _ => Outcome::Done,
            });
        }

        let out = self.store_in(&child_pod, child_guard, key, action, result)?;
        match out {
            Outcome::Split { sep, left, right } => {
                guard.insert_split(idx, sep, left, right);
                if guard.encoded_size() > self.storage.page_size() {
                    self.split_node(&mut guard)
                } else {
                    Ok(Outcome::Done)
                }
            }
            Outcome::Underflow => {
                self.merge_children(&mut guard, idx)?;
                if guard.encoded_size() < self.underflow_threshold() {
                    Ok(Outcome::Underflow)
                } else {
                    Ok(Outcome::Done)
                }
            }
            other => Ok(other),
        }
    }

    /// Is the child guaranteed to absorb this action without handing
    /// anything back up? Decides whether ancestors may unlatch; must be
    /// conservative, never optimistic.
    fn child_is_safe(&self, child: &Node, action: &StoreAction) -> bool {
        let page_size = self.storage.page_size();
        let removal = matches!(
            action,
            StoreAction::Delete { .. } | StoreAction::RemoveGhost { .. }
        );
        match &child.kind {
            NodeKind::Leaf { .. } => {
                if removal {
                    let worst = 2 + self.max_key_len() + 5 + self.max_inline_len();
                    child.encoded_size() >= self.underflow_threshold() + worst
                } else {
                    let value_len = match action {
                        StoreAction::Put(v) => v.encoded_len(),
                        _ => 0,
                    };
                    let need = 2 + self.max_key_len() + value_len;
                    child.encoded_size() + need <= page_size
                }
            }
            NodeKind::Internal { .. } => {
                let sep_worst = 2 + self.max_key_len() + 8;
                if removal {
                    child.encoded_size() >= self.underflow_threshold() + sep_worst
                } else {
                    child.encoded_size() + sep_worst <= page_size
                }
            }
            NodeKind::Stub => false,
        }
    }

    fn apply_leaf(
        &self,
        guard: &mut Node,
        key: &[u8],
        action: &StoreAction,
        result: &mut StoreOutcome,
    ) -> Result<Outcome, DbError> {
        let page_size = self.storage.page_size();
        let search = guard.leaf_search(key);
        match action {
            StoreAction::Put(value) => match search {
                Ok(pos) => {
                    let entries = guard.leaf_entries_mut();
                    result.prior =
                        Some(std::mem::replace(&mut entries[pos].value, value.clone()));
                }
                Err(pos) => {
                    guard.leaf_entries_mut().insert(
                        pos,
                        LeafEntry {
                            key: key.to_vec(),
                            value: value.clone(),
                        },
                    );
                    guard.epoch += 1;
                }
            },
            StoreAction::Delete { ghost } => match search {
                Ok(pos) => match ghost {
                    Some(txn_id) => {
                        let entries = guard.leaf_entries_mut();
                        if entries[pos].value.is_ghost() {
                            result.no_op = true;
                        } else {
                            result.prior = Some(std::mem::replace(
                                &mut entries[pos].value,
                                LeafValue::Ghost { txn_id: *txn_id },
                            ));
                        }
                    }
                    None => {
                        result.prior = Some(guard.leaf_entries_mut().remove(pos).value);
                        guard.epoch += 1;
                    }
                },
                Err(_) => {
                    result.no_op = true;
                }
            },
            StoreAction::RemoveGhost { txn_id } => match search {
                Ok(pos) => {
                    let matches = matches!(
                        guard.leaf_entries()[pos].value,
                        LeafValue::Ghost { txn_id: t } if t == *txn_id
                    );
                    if matches {
                        guard.leaf_entries_mut().remove(pos);
                        guard.epoch += 1;
                    } else {
                        result.no_op = true;
                    }
                }
                Err(_) => {
                    result.no_op = true;
                }
            },
        }

        if guard.encoded_size() > page_size {
            self.split_node(guard)
        } else if guard.encoded_size() < self.underflow_threshold() {
            Ok(Outcome::Underflow)
        } else {
            Ok(Outcome::Done)
        }
    }

    fn split_node(&self, guard: &mut Node) -> Result<Outcome, DbError> {
        // Allocate the sibling before touching the content, so an
        // allocation failure leaves the (oversized, in-memory) node whole.
        let right_pod = self.storage.new_node(NodeKind::Stub)?;
        let (sep, upper) = guard.split();
        let right_id = {
            let mut right = right_pod.write().unwrap();
            right.kind = upper;
            right.epoch += 1;
            right.id
        };
        self.storage.cache.make_evictable(right_id);
        Ok(Outcome::Split {
            sep,
            left: guard.id,
            right: right_id,
        })
    }

    /// Merge-or-rebalance the underflowed child at `idx` with the sibling
    /// that has more free space. When both fit in one page, the right
    /// node's contents move into the left and the right is deleted, taking
    /// the separator with it; leaf siblings that don't fit rebalance
    /// instead.
    fn merge_children(&self, parent: &mut Node, idx: usize) -> DbResult {
        let count = parent.child_count();
        if count < 2 {
            return Ok(());
        }
        let (li, ri) = if idx == 0 {
            (0, 1)
        } else if idx + 1 >= count {
            (idx - 1, idx)
        } else {
            let left_size = self.peek_encoded_size(parent.child_at(idx - 1))?;
            let right_size = self.peek_encoded_size(parent.child_at(idx + 1))?;
            if left_size <= right_size {
                (idx - 1, idx)
            } else {
                (idx, idx + 1)
            }
        };

        let left_pod = self.storage.get_node(parent.child_at(li))?;
        let right_pod = self.storage.get_node(parent.child_at(ri))?;
        let mut left = left_pod.write().unwrap();
        let mut right = right_pod.write().unwrap();
        if left.detached || right.detached {
            return Ok(());
        }
        if self.storage.dirty_node(&mut left)?.is_some() {
            parent.set_child(li, left.id);
        }
        if self.storage.dirty_node(&mut right)?.is_some() {
            parent.set_child(ri, right.id);
        }

        let page_size = self.storage.page_size();
        let sep = match &parent.kind {
            NodeKind::Internal { keys, .. } => keys[li].clone(),
            _ => return Ok(()),
        };

        if left.is_leaf() && right.is_leaf() {
            let combined = left.encoded_size() + right.encoded_size() - 3;
            if combined <= page_size {
                let moved = right.leaf_entries_mut().split_off(0);
                left.leaf_entries_mut().extend(moved);
                left.epoch += 1;
                right.epoch += 1;
                self.storage.delete_node(&mut right);
                parent.remove_separator(li);
            } else {
                self.rebalance_leaves(parent, li, &mut left, &mut right);
            }
        } else if !left.is_leaf() && !right.is_leaf() {
            let combined = left.encoded_size() + right.encoded_size() + 2 + sep.len() - 3;
            if combined <= page_size {
                let (rk, rc) = match &mut right.kind {
                    NodeKind::Internal { keys, children } => {
                        (keys.split_off(0), children.split_off(0))
                    }
                    _ => return Ok(()),
                };
                if let NodeKind::Internal { keys, children } = &mut left.kind {
                    keys.push(sep);
                    keys.extend(rk);
                    children.extend(rc);
                }
                left.epoch += 1;
                right.epoch += 1;
                self.storage.delete_node(&mut right);
                parent.remove_separator(li);
            }
            // Internal siblings that don't fit are left alone; later
            // deletes will shrink them into range.
        }
        Ok(())
    }

    fn rebalance_leaves(&self, parent: &mut Node, li: usize, left: &mut Node, right: &mut Node) {
        if left.encoded_size() < right.encoded_size() {
            loop {
                let first_len = match right.leaf_entries().first() {
                    Some(e) => e.encoded_len(),
                    None => break,
                };
                if left.encoded_size() + first_len >= right.encoded_size() - first_len {
                    break;
                }
                let entry = right.leaf_entries_mut().remove(0);
                left.leaf_entries_mut().push(entry);
            }
        } else {
            loop {
                let last_len = match left.leaf_entries().last() {
                    Some(e) => e.encoded_len(),
                    None => break,
                };
                if right.encoded_size() + last_len >= left.encoded_size() - last_len {
                    break;
                }
                let entry = left.leaf_entries_mut().pop().unwrap();
                right.leaf_entries_mut().insert(0, entry);
            }
        }
        left.epoch += 1;
        right.epoch += 1;
        if let Some(first_key) = right.leaf_entries().first().map(|e| e.key.clone()) {
            if let NodeKind::Internal { keys, .. } = &mut parent.kind {
                keys[li] = first_key;
                parent.epoch += 1;
            }
        }
    }

    fn peek_encoded_size(&self, id: PageId) -> Result<usize, DbError> {
        let pod = self.storage.get_node(id)?;
        let guard = pod.read().unwrap();
        Ok(guard.encoded_size())
    }

    /// An internal root left with a single child absorbs that child.
    fn maybe_collapse_root(&self, guard: &mut Node) -> DbResult {
        loop {
            let child_id = match &guard.kind {
                NodeKind::Internal { keys, children }
                    if keys.is_empty() && children.len() == 1 =>
                {
                    children[0]
                }
                _ => return Ok(()),
            };
            let child_pod = self.storage.get_node(child_id)?;
            let mut child = child_pod.write().unwrap();
            if child.detached {
                return Ok(());
            }
            guard.kind = std::mem::replace(&mut child.kind, NodeKind::Stub);
            guard.epoch += 1;
            self.storage.delete_node(&mut child);
            debug!(
                "root of tree {} collapsed into page {}",
                self.tree_id, guard.id
            );
        }
    }

    // ------------------------------------------------------------------
    // whole-tree operations
    // ------------------------------------------------------------------

    /// Count non-ghost entries by cursor traversal.
    pub(crate) fn count(&self) -> Result<u64, DbError> {
        let mut n = 0u64;
        let mut op = SeekOp::First;
        loop {
            match self.seek(op)? {
                Some(hit) => {
                    if !hit.value.is_ghost() {
                        n += 1;
                    }
                    let mut probe = hit.key;
                    probe.push(0);
                    op = SeekOp::Ge(probe);
                }
                None => return Ok(n),
            }
        }
    }

    /// Pick a random entry by descending through random children. Ghosts
    /// skip forward.
    pub(crate) fn random(&self) -> Result<Option<LeafHit>, DbError> {
        let mut rng = rand::thread_rng();
        loop {
            let root_pod = self.root_pod();
            let guard = root_pod.read().unwrap();
            if guard.detached || !guard.pinned {
                continue;
            }
            match self.random_descend(&root_pod, guard, &mut rng)? {
                SeekOut::Retry => continue,
                SeekOut::Miss { .. } => return Ok(None),
                SeekOut::Hit(hit) => {
                    if hit.value.is_ghost() {
                        let mut probe = hit.key;
                        probe.push(0);
                        return self.seek(SeekOp::Ge(probe));
                    }
                    return Ok(Some(hit));
                }
            }
        }
    }

    fn random_descend<'a>(
        &self,
        pod: &'a Pod<Node>,
        guard: ReadGuard<'a>,
        rng: &mut rand::rngs::ThreadRng,
    ) -> Result<SeekOut, DbError> {
        match &guard.kind {
            NodeKind::Leaf { entries } => {
                if entries.is_empty() {
                    return Ok(SeekOut::Miss { bound: None });
                }
                let pos = rng.gen_range(0, entries.len());
                let entry = &entries[pos];
                Ok(SeekOut::Hit(LeafHit {
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                    leaf: Arc::downgrade(pod),
                    epoch: guard.epoch,
                    pos,
                }))
            }
            NodeKind::Internal { children, .. } => {
                let idx = rng.gen_range(0, children.len());
                let child_pod = self.storage.get_node(children[idx])?;
                let child_guard = child_pod.read().unwrap();
                drop(guard);
                if child_guard.detached {
                    return Ok(SeekOut::Retry);
                }
                self.random_descend(&child_pod, child_guard, rng)
            }
            NodeKind::Stub => Err(DbError::Closed(Some("tree was dropped".to_string()))),
        }
    }

    /// Delete every node and fragment page of this tree. The caller has
    /// already made the tree unreachable through the registry.
    pub(crate) fn delete_all_pages(&self) -> DbResult {
        let root_pod = self.root_pod();
        let mut guard = root_pod.write().unwrap();
        let kind = std::mem::replace(&mut guard.kind, NodeKind::Stub);
        guard.epoch += 1;
        guard.pinned = false;
        let root_id = guard.id;
        self.storage.delete_node(&mut guard);
        drop(guard);
        self.delete_subtree_kind(kind)?;
        debug!("tree {} dropped, root page {} freed", self.tree_id, root_id);
        Ok(())
    }

    fn delete_subtree_kind(&self, kind: NodeKind) -> DbResult {
        match kind {
            NodeKind::Leaf { entries } => {
                for entry in entries {
                    if let LeafValue::Fragmented(desc) = entry.value {
                        fragment::delete_fragments(&self.storage, &desc)?;
                    }
                }
            }
            NodeKind::Internal { children, .. } => {
                for child_id in children {
                    let pod = self.storage.get_node(child_id)?;
                    let mut child = pod.write().unwrap();
                    let kind = std::mem::replace(&mut child.kind, NodeKind::Stub);
                    self.storage.delete_node(&mut child);
                    drop(child);
                    self.delete_subtree_kind(kind)?;
                }
            }
            NodeKind::Stub => {}
        }
        Ok(())
    }

    /// Every page reachable from this tree: nodes, fragment data pages and
    /// i-nodes. Feeds the reachability sweep at open.
    pub(crate) fn collect_pages(&self, out: &mut Vec<PageId>) -> DbResult {
        let root_pod = self.root_pod();
        let guard = root_pod.read().unwrap();
        out.push(guard.id);
        self.collect_below(&guard.kind, out)
    }

    fn collect_below(&self, kind: &NodeKind, out: &mut Vec<PageId>) -> DbResult {
        match kind {
            NodeKind::Leaf { entries } => {
                for entry in entries {
                    if let LeafValue::Fragmented(desc) = &entry.value {
                        fragment::referenced_pages(&self.storage, desc, out)?;
                    }
                }
            }
            NodeKind::Internal { children, .. } => {
                for &child_id in children {
                    out.push(child_id);
                    let pod = self.storage.get_node(child_id)?;
                    let guard = pod.read().unwrap();
                    self.collect_below(&guard.kind, out)?;
                }
            }
            NodeKind::Stub => {}
        }
        Ok(())
    }

    /// Walk the whole tree checking key order, separator bounds, and child
    /// structure.
    pub(crate) fn check_integrity(&self) -> DbResult {
        let root_pod = self.root_pod();
        let guard = root_pod.read().unwrap();
        self.check_node(&guard, None, None, true)
    }

    fn check_node(
        &self,
        node: &Node,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        is_root: bool,
    ) -> DbResult {
        match &node.kind {
            NodeKind::Leaf { entries } => {
                if let (Some(lo), Some(first)) = (lower, entries.first()) {
                    if compare_keys(&first.key, lo) == std::cmp::Ordering::Less {
                        return Err(DbError::corrupt(format!(
                            "leaf {} key below its separator bound",
                            node.id
                        )));
                    }
                }
                for window in entries.windows(2) {
                    if compare_keys(&window[0].key, &window[1].key) != std::cmp::Ordering::Less {
                        return Err(DbError::corrupt(format!(
                            "leaf {} keys out of order",
                            node.id
                        )));
                    }
                }
                if let (Some(up), Some(last)) = (upper, entries.last()) {
                    if compare_keys(&last.key, up) != std::cmp::Ordering::Less {
                        return Err(DbError::corrupt(format!(
                            "leaf {} key above its separator bound",
                            node.id
                        )));
                    }
                }
                Ok(())
            }
            NodeKind::Internal { keys, children } => {
                if children.len() != keys.len() + 1 {
                    return Err(DbError::corrupt(format!(
                        "internal {} child/key count mismatch",
                        node.id
                    )));
                }
                if keys.is_empty() && !is_root {
                    return Err(DbError::corrupt(format!(
                        "internal {} has no separators",
                        node.id
                    )));
                }
                for window in keys.windows(2) {
                    if compare_keys(&window[0], &window[1]) != std::cmp::Ordering::Less {
                        return Err(DbError::corrupt(format!(
                            "internal {} separators out of order",
                            node.id
                        )));
                    }
                }
                for (i, &child_id) in children.iter().enumerate() {
                    let lo = if i == 0 {
                        lower
                    } else {
                        Some(keys[i - 1].as_slice())
                    };
                    let hi = if i == keys.len() {
                        upper
                    } else {
                        Some(keys[i].as_slice())
                    };
                    let pod = self.storage.get_node(child_id)?;
                    let child = pod.read().unwrap();
                    self.check_node(&child, lo, hi, false)?;
                }
                Ok(())
            }
            NodeKind::Stub => Ok(()),
        }
    }

    /// Log a textual dump of the tree, up to `max_depth` levels (-1 for
    /// everything).
    pub(crate) fn draw(&self, max_depth: i32) {
        let root_pod = self.root_pod();
        let guard = root_pod.read().unwrap();
        let mut out = String::new();
        self.draw_node(&guard, 0, max_depth, &mut out);
        debug!("tree {}:\n{}", self.tree_id, out);
    }

    fn draw_node(&self, node: &Node, depth: i32, max_depth: i32, out: &mut String) {
        if max_depth >= 0 && depth > max_depth {
            return;
        }
        let pad = "  ".repeat(depth as usize);
        match &node.kind {
            NodeKind::Leaf { entries } => {
                out.push_str(&format!(
                    "{}leaf {} ({} entries, {} bytes)\n",
                    pad,
                    node.id,
                    entries.len(),
                    node.encoded_size()
                ));
            }
            NodeKind::Internal { keys, children } => {
                out.push_str(&format!(
                    "{}internal {} ({} separators)\n",
                    pad,
                    node.id,
                    keys.len()
                ));
                for &child_id in children {
                    if let Ok(pod) = self.storage.get_node(child_id) {
                        let child = pod.read().unwrap();
                        self.draw_node(&child, depth + 1, max_depth, out);
                    }
                }
            }
            NodeKind::Stub => {
                out.push_str(&format!("{}stub {}\n", pad, node.id));
            }
        }
    }
}
