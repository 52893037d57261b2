pub mod allocator;
pub mod page_store;

use std::sync::{Arc, Mutex};

use log::trace;

use crate::btree::node::{CachedState, Node, NodeKind};
use crate::btree::node_cache::{new_node_pod, NodeCache};
use crate::config::Options;
use crate::error::DbError;
use crate::types::{DbResult, PageId, Pod};

pub use allocator::PageAllocator;
pub use page_store::{CommitExtra, PageStore, HEADER_EXTRA_LEN};

type ReclaimHook = Box<dyn Fn() + Send + Sync>;

/// The paged half of the engine: file, allocator, and node cache. The B+tree
/// layer and the log layers run entirely on top of this.
pub struct Storage {
    pub store: Arc<PageStore>,
    pub alloc: PageAllocator,
    pub cache: NodeCache,
    /// Invoked by the cache when eviction finds no candidate; the database
    /// installs a hook that retires open trees with no external references.
    reclaim_hook: Mutex<Option<ReclaimHook>>,
}

impl Storage {
    pub fn new(store: Arc<PageStore>, opts: &Options) -> Self {
        let alloc = PageAllocator::new(Arc::clone(&store));
        let cache = NodeCache::new(opts.min_cached_nodes(), opts.max_cached_nodes());
        Self {
            store,
            alloc,
            cache,
            reclaim_hook: Mutex::new(None),
        }
    }

    pub fn set_reclaim_hook(&self, hook: ReclaimHook) {
        *self.reclaim_hook.lock().unwrap() = Some(hook);
    }

    fn reclaim(&self) {
        if let Some(hook) = self.reclaim_hook.lock().unwrap().as_ref() {
            hook();
        }
    }

    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }

    /// Fetch a node, reading it from disk on a cache miss. Callers latch the
    /// returned pod and must re-fetch if they find `detached` set.
    pub fn get_node(&self, id: PageId) -> Result<Pod<Node>, DbError> {
        if let Some(pod) = self.cache.get(id) {
            return Ok(pod);
        }
        let mut buf = vec![0u8; self.page_size()];
        self.store.read_page(id, &mut buf)?;
        let node = Node::decode(id, &buf)?;
        trace!("cache miss, loaded node {}", id);
        self.cache
            .insert_or_existing(&self.store, &self.alloc, new_node_pod(node), &|| {
                self.reclaim()
            })
    }

    /// Create a node on a fresh page, dirty in the current color. The node
    /// enters the cache unevictable; the caller flips it evictable once its
    /// content is in place, so eviction can never persist a half-built
    /// node.
    pub fn new_node(&self, kind: NodeKind) -> Result<Pod<Node>, DbError> {
        let id = self.alloc.alloc_page()?;
        let mut node = Node::new_leaf(id);
        node.kind = kind;
        node.state = CachedState::Dirty(self.alloc.current_color());
        self.alloc.note_dirty(id);
        let pod = new_node_pod(node);
        self.cache
            .insert(&self.store, &self.alloc, Arc::clone(&pod), false, &|| {
                self.reclaim()
            })?;
        Ok(pod)
    }

    /// Make a node writable under the copy-on-write rule. Requires the
    /// node's exclusive latch and the shared commit lock.
    ///
    /// Returns the previous page id when the node moved, so the caller can
    /// fix the parent's child pointer.
    pub fn dirty_node(&self, node: &mut Node) -> Result<Option<PageId>, DbError> {
        let color = self.alloc.current_color();
        match node.state {
            CachedState::Dirty(c) if c == color => Ok(None),
            CachedState::Dirty(frozen) => {
                // The node belongs to the checkpoint being flushed. Write the
                // frozen content to its current page first, then re-dirty
                // under a fresh id so the mutation lands in the new color.
                let buf = node.encode(self.page_size());
                self.store.write_page(node.id, &buf)?;
                self.alloc.forget_dirty(node.id, frozen);
                self.swap_page(node, color).map(Some)
            }
            CachedState::Clean => self.swap_page(node, color).map(Some),
        }
    }

    fn swap_page(&self, node: &mut Node, color: u8) -> Result<PageId, DbError> {
        let old_id = node.id;
        let new_id = self.alloc.alloc_page()?;
        node.id = new_id;
        node.state = CachedState::Dirty(color);
        self.cache.rekey(old_id, new_id);
        self.alloc.note_dirty(new_id);
        self.alloc.delete_page(old_id);
        trace!("copy-on-write swap {} -> {}", old_id, new_id);
        Ok(old_id)
    }

    /// Drop a node whose page is no longer referenced. Requires the node's
    /// exclusive latch.
    pub fn delete_node(&self, node: &mut Node) {
        node.detached = true;
        if let CachedState::Dirty(color) = node.state {
            self.alloc.forget_dirty(node.id, color);
        }
        self.cache.remove(node.id);
        self.alloc.delete_page(node.id);
    }

    /// The checkpoint's flush pass: write every node dirtied under `color`
    /// and mark it clean. Each write happens under the node's exclusive
    /// latch.
    pub fn flush_dirty_nodes(&self, color: u8) -> DbResult {
        let ids = self.alloc.dirty_snapshot(color);
        trace!("flushing {} dirty nodes of color {}", ids.len(), color);
        for id in ids {
            let pod = match self.cache.get(id) {
                Some(pod) => pod,
                // Evicted with write-back since the snapshot was taken.
                None => continue,
            };
            let mut node = pod.write().unwrap();
            if node.detached {
                continue;
            }
            if let CachedState::Dirty(c) = node.state {
                if c == color {
                    let buf = node.encode(self.page_size());
                    self.store.write_page(node.id, &buf)?;
                    node.state = CachedState::Clean;
                }
            }
        }
        self.alloc.clear_dirty(color);
        Ok(())
    }

    pub fn close(&self) {
        self.cache.close();
    }
}
