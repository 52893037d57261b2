use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bit_vec::BitVec;
use log::debug;

use crate::error::DbError;
use crate::storage::page_store::PageStore;
use crate::types::PageId;

/// Hands out and reclaims page ids and tracks dirty pages by commit color.
///
/// The color is the low bit of `flip_seq`, which increments at every
/// checkpoint color flip. A page allocated under the current flip sequence is
/// not referenced by any durable header yet, so deleting it recycles the id
/// immediately; anything older is deferred until the checkpoint that no
/// longer references it has committed.
pub struct PageAllocator {
    store: Arc<PageStore>,
    state: Mutex<AllocState>,
    dirty: [Mutex<HashSet<PageId>>; 2],
    flip_seq: AtomicU64,
}

struct AllocState {
    /// Reusable page ids, popped LIFO.
    free: Vec<PageId>,
    /// Membership bitmap over the free list, indexed by page id.
    free_bits: BitVec,
    /// Page id -> flip sequence at allocation, for the recycle decision.
    fresh: HashMap<PageId, u64>,
    /// (flip sequence at delete, page id); freed once a later flip commits.
    deferred: Vec<(u64, PageId)>,
}

impl PageAllocator {
    pub fn new(store: Arc<PageStore>) -> Self {
        Self {
            store,
            state: Mutex::new(AllocState {
                free: Vec::new(),
                free_bits: BitVec::new(),
                fresh: HashMap::new(),
                deferred: Vec::new(),
            }),
            dirty: [Mutex::new(HashSet::new()), Mutex::new(HashSet::new())],
            flip_seq: AtomicU64::new(0),
        }
    }

    /// Install the free set discovered by the reachability sweep at open.
    pub fn rebuild_free(&self, free: Vec<PageId>) {
        let mut state = self.state.lock().unwrap();
        let cap = self.store.page_count() as usize;
        state.free_bits = BitVec::from_elem(cap, false);
        for &id in &free {
            Self::set_bit(&mut state.free_bits, id, true);
        }
        debug!("free map rebuilt: {} free pages", free.len());
        state.free = free;
        state.fresh.clear();
        state.deferred.clear();
    }

    fn set_bit(bits: &mut BitVec, id: PageId, v: bool) {
        let idx = id as usize;
        if idx >= bits.len() {
            bits.grow(idx + 1 - bits.len(), false);
        }
        bits.set(idx, v);
    }

    pub fn current_color(&self) -> u8 {
        (self.flip_seq.load(Ordering::SeqCst) & 1) as u8
    }

    pub fn flip_seq(&self) -> u64 {
        self.flip_seq.load(Ordering::SeqCst)
    }

    /// Allocate a page id, reusing the free set before growing the file.
    pub fn alloc_page(&self) -> Result<PageId, DbError> {
        let seq = self.flip_seq.load(Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let id = match state.free.pop() {
            Some(id) => {
                Self::set_bit(&mut state.free_bits, id, false);
                id
            }
            None => self.store.extend()?,
        };
        state.fresh.insert(id, seq);
        Ok(id)
    }

    /// Record a page as dirty in the current commit color.
    pub fn note_dirty(&self, id: PageId) {
        let color = self.current_color() as usize;
        self.dirty[color].lock().unwrap().insert(id);
    }

    /// Drop a page from a color's dirty set (eviction write-back, or a COW
    /// swap replacing the id).
    pub fn forget_dirty(&self, id: PageId, color: u8) {
        self.dirty[color as usize].lock().unwrap().remove(&id);
    }

    pub fn dirty_snapshot(&self, color: u8) -> Vec<PageId> {
        self.dirty[color as usize]
            .lock()
            .unwrap()
            .iter()
            .copied()
            .collect()
    }

    pub fn clear_dirty(&self, color: u8) {
        self.dirty[color as usize].lock().unwrap().clear();
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty[0].lock().unwrap().is_empty() || !self.dirty[1].lock().unwrap().is_empty()
    }

    /// Return an id straight to the free set. Only valid for pages that were
    /// never referenced by a durable checkpoint; `delete_page` makes that
    /// decision, this is the mechanism.
    pub fn recycle_page(&self, id: PageId) {
        let mut state = self.state.lock().unwrap();
        state.fresh.remove(&id);
        Self::set_bit(&mut state.free_bits, id, true);
        state.free.push(id);
        drop(state);
        self.forget_dirty(id, 0);
        self.forget_dirty(id, 1);
    }

    /// A durable header now references this page (undo chains, master undo
    /// log): deleting it must defer even though it was allocated recently.
    pub fn mark_durable(&self, id: PageId) {
        self.state.lock().unwrap().fresh.remove(&id);
    }

    /// Release a page that is no longer referenced. Recycles immediately when
    /// the page was allocated under the current flip sequence, defers
    /// otherwise.
    pub fn delete_page(&self, id: PageId) {
        let seq = self.flip_seq.load(Ordering::SeqCst);
        let recycle = {
            let state = self.state.lock().unwrap();
            state.fresh.get(&id) == Some(&seq)
        };
        if recycle {
            self.recycle_page(id);
        } else {
            let mut state = self.state.lock().unwrap();
            state.fresh.remove(&id);
            state.deferred.push((seq, id));
            drop(state);
            self.forget_dirty(id, 0);
            self.forget_dirty(id, 1);
        }
    }

    /// Flip the commit color. Returns the frozen color whose dirty set the
    /// checkpoint must now flush. Callers hold the exclusive commit lock.
    pub fn begin_checkpoint(&self) -> u8 {
        let old = self.flip_seq.fetch_add(1, Ordering::SeqCst);
        (old & 1) as u8
    }

    /// Undo a color flip after a failed checkpoint: merge anything that was
    /// dirtied under the new color back into the frozen set's color.
    pub fn abort_checkpoint(&self) {
        let seq = self.flip_seq.fetch_sub(1, Ordering::SeqCst) - 1;
        let restored = (seq & 1) as usize;
        let aborted = 1 - restored;
        let moved: Vec<PageId> = self.dirty[aborted].lock().unwrap().drain().collect();
        self.dirty[restored].lock().unwrap().extend(moved);
    }

    /// The checkpoint's header is durable: deferred frees from before this
    /// flip are now unreferenced, and pages allocated before it are no longer
    /// fresh.
    pub fn end_checkpoint(&self) {
        let seq = self.flip_seq.load(Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let mut kept = Vec::new();
        let mut freed = 0usize;
        for (s, id) in state.deferred.split_off(0) {
            if s < seq {
                Self::set_bit(&mut state.free_bits, id, true);
                state.free.push(id);
                freed += 1;
            } else {
                kept.push((s, id));
            }
        }
        state.deferred = kept;
        state.fresh.retain(|_, s| *s >= seq);
        if freed > 0 {
            debug!("checkpoint released {} deferred pages", freed);
        }
    }

    pub fn free_page_count(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    pub fn is_free(&self, id: PageId) -> bool {
        let state = self.state.lock().unwrap();
        state.free_bits.get(id as usize).unwrap_or(false)
    }
}
