use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, trace};

use crate::btree::node::{CachedState, Node};
use crate::error::DbError;
use crate::storage::allocator::PageAllocator;
use crate::storage::page_store::PageStore;
use crate::types::{DbResult, PageId, Pod};

/// LRU sentinels. Page ids 0 and 1 address the commit headers and never name
/// cached nodes, so the list always has at least these two members and
/// eviction always has a non-sentinel candidate slot to inspect.
const LRU_HEAD: PageId = 0;
const LRU_TAIL: PageId = 1;

/// Doubly linked usage list over page ids. Front is most recently used.
struct LruList {
    links: HashMap<PageId, (PageId, PageId)>, // id -> (prev, next)
}

impl LruList {
    fn new() -> Self {
        let mut links = HashMap::new();
        links.insert(LRU_HEAD, (LRU_HEAD, LRU_TAIL));
        links.insert(LRU_TAIL, (LRU_HEAD, LRU_TAIL));
        Self { links }
    }

    fn contains(&self, id: PageId) -> bool {
        id != LRU_HEAD && id != LRU_TAIL && self.links.contains_key(&id)
    }

    fn push_front(&mut self, id: PageId) {
        debug_assert!(!self.links.contains_key(&id));
        let (_, head_next) = self.links[&LRU_HEAD];
        self.links.insert(id, (LRU_HEAD, head_next));
        self.links.get_mut(&LRU_HEAD).unwrap().1 = id;
        self.links.get_mut(&head_next).unwrap().0 = id;
    }

    fn remove(&mut self, id: PageId) {
        if let Some((prev, next)) = self.links.remove(&id) {
            self.links.get_mut(&prev).unwrap().1 = next;
            self.links.get_mut(&next).unwrap().0 = prev;
        }
    }

    fn move_front(&mut self, id: PageId) {
        if self.contains(id) {
            self.remove(id);
            self.push_front(id);
        }
    }

    /// Least-recently-used first.
    fn tail_to_front(&self) -> Vec<PageId> {
        let mut out = Vec::new();
        let mut cur = self.links[&LRU_TAIL].0;
        while cur != LRU_HEAD {
            out.push(cur);
            cur = self.links[&cur].0;
        }
        out
    }

    /// Check the doubly-linked invariant; test support.
    #[cfg(test)]
    fn check(&self) {
        let mut cur = LRU_HEAD;
        loop {
            let (_, next) = self.links[&cur];
            assert_eq!(self.links[&next].0, cur, "broken link at {}", cur);
            if next == LRU_TAIL {
                break;
            }
            cur = next;
        }
    }
}

struct CacheInner {
    map: HashMap<PageId, Pod<Node>>,
    lru: LruList,
    max_nodes: usize,
    closed: bool,
}

/// Bounded pool of page-sized node frames with LRU eviction.
///
/// The list mutex is independent of the per-node latches: eviction only ever
/// try-latches a candidate, and write-back I/O happens after the list mutex
/// is released.
pub struct NodeCache {
    inner: Mutex<CacheInner>,
    min_nodes: usize,
}

impl NodeCache {
    pub fn new(min_nodes: usize, max_nodes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::with_capacity(min_nodes),
                lru: LruList::new(),
                max_nodes,
                closed: false,
            }),
            min_nodes,
        }
    }

    pub fn min_nodes(&self) -> usize {
        self.min_nodes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Look up a cached node and promote it. The promotion itself is
    /// best-effort: if the list mutex is contended the node simply keeps its
    /// position.
    pub fn get(&self, id: PageId) -> Option<Pod<Node>> {
        let inner = self.inner.lock().unwrap();
        let pod = inner.map.get(&id).cloned();
        drop(inner);
        if pod.is_some() {
            self.used(id);
        }
        pod
    }

    /// Promote without blocking.
    pub fn used(&self, id: PageId) {
        if let Ok(mut inner) = self.inner.try_lock() {
            inner.lru.move_front(id);
        }
    }

    /// Make room and register a node. `evictable` is false for roots.
    pub fn insert(
        &self,
        store: &PageStore,
        alloc: &PageAllocator,
        pod: Pod<Node>,
        evictable: bool,
        reclaim: &dyn Fn(),
    ) -> DbResult {
        let id = pod.read().unwrap().id;
        self.ensure_capacity(store, alloc, reclaim)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(DbError::Closed(None));
        }
        inner.map.insert(id, pod);
        if evictable {
            inner.lru.push_front(id);
        }
        Ok(())
    }

    /// Read-miss registration: if another thread registered the same page id
    /// first, its node wins and the caller's copy is dropped. Keeps a single
    /// in-memory node per page.
    pub fn insert_or_existing(
        &self,
        store: &PageStore,
        alloc: &PageAllocator,
        pod: Pod<Node>,
        reclaim: &dyn Fn(),
    ) -> Result<Pod<Node>, DbError> {
        let id = pod.read().unwrap().id;
        self.ensure_capacity(store, alloc, reclaim)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(DbError::Closed(None));
        }
        if let Some(existing) = inner.map.get(&id) {
            return Ok(Arc::clone(existing));
        }
        inner.map.insert(id, Arc::clone(&pod));
        inner.lru.push_front(id);
        Ok(pod)
    }

    /// Forget a node entirely (the page was deleted).
    pub fn remove(&self, id: PageId) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.remove(&id);
        inner.lru.remove(id);
    }

    /// A copy-on-write swap changed a node's page id.
    pub fn rekey(&self, old: PageId, new: PageId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pod) = inner.map.remove(&old) {
            inner.map.insert(new, pod);
        }
        let evictable = inner.lru.contains(old);
        inner.lru.remove(old);
        if evictable {
            inner.lru.push_front(new);
        }
    }

    pub fn make_unevictable(&self, id: PageId) {
        let mut inner = self.inner.lock().unwrap();
        inner.lru.remove(id);
    }

    pub fn make_evictable(&self, id: PageId) {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.contains_key(&id) && !inner.lru.contains(id) {
            inner.lru.push_front(id);
        }
    }

    /// Like `make_evictable` but at the cold end, for nodes unlikely to be
    /// touched again.
    pub fn make_evictable_now(&self, id: PageId) {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.contains_key(&id) {
            inner.lru.remove(id);
            // push right before the tail sentinel
            let tail_prev = inner.lru.links[&LRU_TAIL].0;
            inner
                .lru
                .links
                .insert(id, (tail_prev, LRU_TAIL));
            inner.lru.links.get_mut(&tail_prev).unwrap().1 = id;
            inner.lru.links.get_mut(&LRU_TAIL).unwrap().0 = id;
        }
    }

    /// Evict until under the cap. Scans the LRU tail for a node whose
    /// exclusive latch can be tried; after a fruitless pass, asks the caller
    /// to reclaim unreferenced trees and retries, three passes in total.
    pub fn ensure_capacity(
        &self,
        store: &PageStore,
        alloc: &PageAllocator,
        reclaim: &dyn Fn(),
    ) -> DbResult {
        for attempt in 0..3 {
            loop {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed {
                    return Err(DbError::Closed(None));
                }
                if inner.map.len() < inner.max_nodes {
                    return Ok(());
                }
                let mut evicted = false;
                for id in inner.lru.tail_to_front() {
                    let pod = match inner.map.get(&id) {
                        Some(p) => Arc::clone(p),
                        None => continue,
                    };
                    // Try-latch only; a latched node is in active use. The
                    // latch is held across the write-back so a stale handle
                    // cannot mutate the node mid-eviction.
                    if let Ok(mut node) = pod.try_write() {
                        if node.pinned {
                            continue;
                        }
                        if let CachedState::Dirty(color) = node.state {
                            let buf = node.encode(store.page_size());
                            store.write_page(node.id, &buf)?;
                            alloc.forget_dirty(node.id, color);
                            node.state = CachedState::Clean;
                            trace!("evicted dirty node {} with write-back", node.id);
                        } else {
                            trace!("evicted clean node {}", node.id);
                        }
                        // Anyone holding a stale pod re-fetches through the
                        // cache when they see this.
                        node.detached = true;
                        inner.map.remove(&id);
                        inner.lru.remove(id);
                        evicted = true;
                        break;
                    };
                }
                if !evicted {
                    break;
                }
            }
            debug!(
                "eviction pass {} found no candidate, reclaiming unreferenced trees",
                attempt
            );
            reclaim();
        }
        Err(DbError::CacheExhausted)
    }

    /// Empty the cache and block further allocation.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
        inner.lru = LruList::new();
        inner.max_nodes = 0;
        inner.closed = true;
    }

    /// Run `f` over every cached node id (snapshot).
    pub fn cached_ids(&self) -> Vec<PageId> {
        self.inner.lock().unwrap().map.keys().copied().collect()
    }
}

pub fn new_node_pod(node: Node) -> Pod<Node> {
    Arc::new(RwLock::new(node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;

    fn fixture(dir: &tempfile::TempDir) -> (Arc<PageStore>, PageAllocator) {
        let opts = Options::new(dir.path().join("cache-test"));
        let (store, _) = PageStore::open(&opts).unwrap();
        let store = Arc::new(store);
        let alloc = PageAllocator::new(Arc::clone(&store));
        (store, alloc)
    }

    fn no_reclaim() -> impl Fn() {
        || {}
    }

    #[test]
    fn test_lru_links_stay_mutual() {
        let mut lru = LruList::new();
        for id in 2..20 {
            lru.push_front(id);
            lru.check();
        }
        lru.move_front(10);
        lru.check();
        lru.remove(15);
        lru.remove(2);
        lru.check();
        assert_eq!(lru.tail_to_front().len(), 16);
    }

    #[test]
    fn test_insert_get_and_promote() {
        let dir = tempfile::tempdir().unwrap();
        let (store, alloc) = fixture(&dir);
        let cache = NodeCache::new(4, 16);

        let id = alloc.alloc_page().unwrap();
        let pod = new_node_pod(Node::new_leaf(id));
        cache
            .insert(&store, &alloc, pod, true, &no_reclaim())
            .unwrap();

        assert!(cache.get(id).is_some());
        assert!(cache.get(id + 100).is_none());
    }

    #[test]
    fn test_eviction_prefers_cold_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let (store, alloc) = fixture(&dir);
        let cache = NodeCache::new(2, 3);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = alloc.alloc_page().unwrap();
            ids.push(id);
            cache
                .insert(&store, &alloc, new_node_pod(Node::new_leaf(id)), true, &no_reclaim())
                .unwrap();
        }
        // Touch everything but the first node.
        cache.used(ids[1]);
        cache.used(ids[2]);

        let id = alloc.alloc_page().unwrap();
        cache
            .insert(&store, &alloc, new_node_pod(Node::new_leaf(id)), true, &no_reclaim())
            .unwrap();

        assert!(cache.get(ids[0]).is_none(), "coldest node evicted");
        assert!(cache.get(ids[1]).is_some());
        assert!(cache.get(ids[2]).is_some());
    }

    #[test]
    fn test_dirty_eviction_writes_back() {
        let dir = tempfile::tempdir().unwrap();
        let (store, alloc) = fixture(&dir);
        let cache = NodeCache::new(1, 1);

        let id = alloc.alloc_page().unwrap();
        let mut node = Node::new_leaf(id);
        node.state = CachedState::Dirty(alloc.current_color());
        node.leaf_entries_mut().push(crate::btree::node::LeafEntry {
            key: b"k".to_vec(),
            value: crate::btree::node::LeafValue::Inline(b"v".to_vec()),
        });
        alloc.note_dirty(id);
        cache
            .insert(&store, &alloc, new_node_pod(node), true, &no_reclaim())
            .unwrap();

        // Forces eviction of the dirty node.
        let id2 = alloc.alloc_page().unwrap();
        cache
            .insert(&store, &alloc, new_node_pod(Node::new_leaf(id2)), true, &no_reclaim())
            .unwrap();

        let mut buf = vec![0u8; store.page_size()];
        store.read_page(id, &mut buf).unwrap();
        let back = Node::decode(id, &buf).unwrap();
        assert_eq!(back.leaf_entries().len(), 1);
        assert!(alloc.dirty_snapshot(alloc.current_color()).is_empty());
    }

    #[test]
    fn test_pinned_nodes_survive_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let (store, alloc) = fixture(&dir);
        let cache = NodeCache::new(1, 2);

        let root_id = alloc.alloc_page().unwrap();
        let mut root = Node::new_leaf(root_id);
        root.pinned = true;
        cache
            .insert(&store, &alloc, new_node_pod(root), false, &no_reclaim())
            .unwrap();

        for _ in 0..4 {
            let id = alloc.alloc_page().unwrap();
            cache
                .insert(&store, &alloc, new_node_pod(Node::new_leaf(id)), true, &no_reclaim())
                .unwrap();
        }
        assert!(cache.get(root_id).is_some(), "pinned root never evicted");
    }

    #[test]
    fn test_exhaustion_after_three_passes() {
        let dir = tempfile::tempdir().unwrap();
        let (store, alloc) = fixture(&dir);
        let cache = NodeCache::new(1, 1);

        let id = alloc.alloc_page().unwrap();
        let pod = new_node_pod(Node::new_leaf(id));
        cache
            .insert(&store, &alloc, Arc::clone(&pod), true, &no_reclaim())
            .unwrap();

        // Hold the only node's latch so eviction cannot take it.
        let _guard = pod.write().unwrap();
        let id2 = alloc.alloc_page().unwrap();
        match cache.insert(&store, &alloc, new_node_pod(Node::new_leaf(id2)), true, &no_reclaim()) {
            Err(DbError::CacheExhausted) => {}
            other => panic!("expected CacheExhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_close_blocks_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let (store, alloc) = fixture(&dir);
        let cache = NodeCache::new(1, 8);
        cache.close();

        let id = alloc.alloc_page().unwrap();
        assert!(cache
            .insert(&store, &alloc, new_node_pod(Node::new_leaf(id)), true, &no_reclaim())
            .is_err());
    }
}
