use std::collections::HashMap;
use std::convert::TryInto;
use std::fs;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use log::{debug, error, info, warn};
use rand::Rng;

use crate::btree::fragment;
use crate::btree::node::LeafValue;
use crate::btree::{BTree, Cursor};
use crate::checkpoint::{run_checkpoint, CheckpointState};
use crate::config::{DurabilityMode, Options};
use crate::error::DbError;
use crate::recovery;
use crate::redo::{RedoReader, RedoWriter};
use crate::storage::page_store::{info_file_path, lock_file_path};
use crate::storage::{PageStore, Storage};
use crate::transaction::{Transaction, TxnContext};
use crate::types::{is_user_tree_id, DbResult, TreeId, KEY_MAP_TREE_ID, REGISTRY_TREE_ID};

const KEY_MAP_NAME_PREFIX: u8 = b'N';
const KEY_MAP_ID_PREFIX: u8 = b'I';
const KEY_MAP_MASK_KEY: &[u8] = b"M";
const KEY_MAP_SEQ_KEY: &[u8] = b"S";

/// Page accounting for diagnostics and tests.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub total_pages: u64,
    pub free_pages: usize,
    pub cached_nodes: usize,
    pub dirty_pages: usize,
}

struct OpenTrees {
    by_name: HashMap<Vec<u8>, Arc<BTree>>,
    by_id: HashMap<TreeId, Arc<BTree>>,
}

pub(crate) struct DatabaseInner {
    opts: Options,
    storage: Arc<Storage>,
    redo: Arc<RedoWriter>,
    ctx: Arc<TxnContext>,
    registry: Arc<BTree>,
    key_map: Arc<BTree>,
    open_trees: Mutex<OpenTrees>,
    next_tree_seq: AtomicU64,
    tree_id_mask: u64,
    ckpt_state: CheckpointState,
    is_closed: AtomicBool,
    close_cause: Mutex<Option<String>>,
    ckpt_stop: Mutex<Option<crossbeam::channel::Sender<()>>>,
    ckpt_thread: Mutex<Option<JoinHandle<()>>>,
}

/// An open database: the page store, node cache, lock manager, redo and
/// undo logs, checkpointer, and the open-tree table, wired together.
pub struct Database {
    inner: Arc<DatabaseInner>,
}

/// A named key-value index. Handles are reference counted; when the last
/// external handle drops, the database's sweep may retire the tree from the
/// open table (its content stays on disk).
pub struct Tree {
    inner: Arc<DatabaseInner>,
    tree: Arc<BTree>,
    name: Vec<u8>,
}

fn registry_key(tree_id: TreeId) -> [u8; 8] {
    tree_id.to_be_bytes()
}

fn name_key(name: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + name.len());
    k.push(KEY_MAP_NAME_PREFIX);
    k.extend_from_slice(name);
    k
}

fn id_key(tree_id: TreeId) -> Vec<u8> {
    let mut k = Vec::with_capacity(9);
    k.push(KEY_MAP_ID_PREFIX);
    k.extend_from_slice(&tree_id.to_be_bytes());
    k
}

impl Database {
    /// Open or create the database described by `opts`, running recovery if
    /// the previous process did not shut down cleanly.
    pub fn open(opts: Options) -> Result<Database, DbError> {
        opts.validate()?;
        let (store, created) = PageStore::open(&opts)?;
        let store = Arc::new(store);
        let storage = Arc::new(Storage::new(Arc::clone(&store), &opts));

        if !opts.read_only {
            fs::write(info_file_path(&opts.base_file_path), opts.info_string())
                .map_err(|e| DbError::io("writing the info file", e))?;
        }

        let extra = storage.store.read_commit_extra();
        // A crash before the very first checkpoint leaves a zero root; the
        // file content is meaningless and initialization restarts.
        let fresh = created || extra.root_page_id == 0;
        let inner = if fresh {
            Self::init_fresh(opts, storage)?
        } else {
            Self::open_existing(opts, storage)?
        };

        inner.spawn_checkpoint_thread();
        info!("database open: {:?}", inner.opts.base_file_path);
        Ok(Database { inner })
    }

    /// Erase any existing database at the base path, then open a fresh one.
    pub fn destroy(opts: Options) -> Result<Database, DbError> {
        if opts.read_only {
            return Err(DbError::Config(
                "cannot destroy a read-only database".to_string(),
            ));
        }
        opts.validate()?;
        remove_database_files(&opts)?;
        Self::open(opts)
    }

    /// Write a snapshot stream out as the base file, then open it. The base
    /// path must not already hold a database.
    pub fn restore_from_snapshot<R: Read>(opts: Options, mut stream: R) -> Result<Database, DbError> {
        opts.validate()?;
        if opts.base_file_path.exists() {
            return Err(DbError::Config(format!(
                "restore target {:?} already exists",
                opts.base_file_path
            )));
        }
        if let Some(parent) = opts.base_file_path.parent() {
            if opts.mkdirs && !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| DbError::io("creating database directories", e))?;
            }
        }
        let mut file = fs::File::create(&opts.base_file_path)
            .map_err(|e| DbError::io("creating the restore target", e))?;
        std::io::copy(&mut stream, &mut file)
            .map_err(|e| DbError::io("writing the snapshot", e))?;
        file.sync_all()
            .map_err(|e| DbError::io("syncing the snapshot", e))?;
        drop(file);
        Self::open(opts)
    }

    fn init_fresh(opts: Options, storage: Arc<Storage>) -> Result<Arc<DatabaseInner>, DbError> {
        if opts.read_only {
            return Err(DbError::Config(
                "cannot create a database in read-only mode".to_string(),
            ));
        }
        let registry = BTree::create(Arc::clone(&storage), REGISTRY_TREE_ID)?;
        let key_map = BTree::create(Arc::clone(&storage), KEY_MAP_TREE_ID)?;

        let mask: u64 = rand::thread_rng().gen();
        {
            let _commit = storage.store.shared_commit_lock();
            key_map.put(KEY_MAP_MASK_KEY, &mask.to_le_bytes())?;
            key_map.put(KEY_MAP_SEQ_KEY, &1u64.to_le_bytes())?;
            registry.put(&registry_key(KEY_MAP_TREE_ID), &key_map.root_id().to_le_bytes())?;
        }

        let redo = Arc::new(RedoWriter::open(&opts.base_file_path, 1, 0, 0)?);
        let ctx = Arc::new(TxnContext::new(
            Arc::clone(&storage),
            Arc::clone(&redo),
            opts.lock_timeout,
            opts.lock_upgrade_rule,
            opts.durability_mode,
            1,
        ));

        let inner = DatabaseInner::assemble(opts, storage, redo, ctx, registry, key_map, mask, 1);
        // Baseline checkpoint: a fresh database must reopen as non-fresh.
        inner.checkpoint_inner(true)?;
        inner.redo.timestamp()?;
        Ok(inner)
    }

    fn open_existing(opts: Options, storage: Arc<Storage>) -> Result<Arc<DatabaseInner>, DbError> {
        let extra = storage.store.read_commit_extra();
        let registry = BTree::open_root(Arc::clone(&storage), REGISTRY_TREE_ID, extra.root_page_id)?;
        let key_map_root = registry
            .load_value(&registry_key(KEY_MAP_TREE_ID))?
            .ok_or_else(|| DbError::corrupt("registry has no key-map row"))?;
        let key_map_root = u64::from_le_bytes(
            key_map_root
                .as_slice()
                .try_into()
                .map_err(|_| DbError::corrupt("key-map row is malformed"))?,
        );
        let key_map = BTree::open_root(Arc::clone(&storage), KEY_MAP_TREE_ID, key_map_root)?;

        let mask = match key_map.load_value(KEY_MAP_MASK_KEY)? {
            Some(v) if v.len() == 8 => u64::from_le_bytes(v.as_slice().try_into().unwrap()),
            _ => return Err(DbError::corrupt("tree-id mask is missing")),
        };
        let seq = match key_map.load_value(KEY_MAP_SEQ_KEY)? {
            Some(v) if v.len() == 8 => u64::from_le_bytes(v.as_slice().try_into().unwrap()),
            _ => 1,
        };

        let mut reader = RedoReader::open_all(&opts.base_file_path)?;
        let end_pos = reader.end_position()?.max(extra.redo_position);
        let next_log_id = reader.max_log_id() + 1;
        let redo = Arc::new(RedoWriter::open(
            &opts.base_file_path,
            next_log_id,
            end_pos,
            extra.redo_txn_id,
        )?);
        let ctx = Arc::new(TxnContext::new(
            Arc::clone(&storage),
            Arc::clone(&redo),
            opts.lock_timeout,
            opts.lock_upgrade_rule,
            opts.durability_mode,
            extra.transaction_id + 1,
        ));

        let read_only = opts.read_only;
        let inner =
            DatabaseInner::assemble(opts, storage, redo, ctx, registry, key_map, mask, seq);

        // Free map first: recovery allocates pages while replaying.
        {
            let resolver_inner = Arc::clone(&inner);
            recovery::rebuild_free_pages(
                &inner.storage,
                &inner.registry,
                &inner.key_map,
                &move |tree_id| resolver_inner.open_tree_by_id(tree_id),
                extra.master_undo_page_id,
            )?;
        }

        let outcome = recovery::replay(
            &inner.storage,
            &inner.ctx,
            &mut reader,
            extra.redo_position,
            extra.master_undo_page_id,
        )?;
        inner.ctx.bump_txn_counter(outcome.max_txn_id + 1);

        if outcome.work_done && !read_only {
            info!("recovery applied changes; forcing a checkpoint");
            inner.checkpoint_inner(true)?;
        }
        // Everything in pre-crash segments is now at or below the durable
        // redo position.
        if !read_only {
            inner.redo.remove_stale_segments()?;
        }
        inner.redo.timestamp()?;
        Ok(inner)
    }

    pub fn stats(&self) -> Stats {
        self.inner.stats()
    }

    /// Open (or create) the named tree.
    pub fn open_tree(&self, name: &[u8]) -> Result<Tree, DbError> {
        self.inner.check_open()?;
        let tree = self.inner.open_tree_by_name(name)?;
        Ok(Tree {
            inner: Arc::clone(&self.inner),
            tree,
            name: name.to_vec(),
        })
    }

    /// Drop the named tree: its registry and name rows go away and all of
    /// its pages return to the allocator.
    pub fn drop_tree(&self, name: &[u8]) -> DbResult {
        self.inner.check_open()?;
        self.inner.drop_tree(name)
    }

    /// Begin a transaction with the database's default durability.
    pub fn begin(&self) -> Result<Transaction, DbError> {
        self.inner.check_open()?;
        Ok(Transaction::new(
            Arc::clone(&self.inner.ctx),
            self.inner.opts.durability_mode,
        ))
    }

    pub fn begin_with(&self, durability: DurabilityMode) -> Result<Transaction, DbError> {
        self.inner.check_open()?;
        Ok(Transaction::new(Arc::clone(&self.inner.ctx), durability))
    }

    /// Force a checkpoint now.
    pub fn checkpoint(&self) -> DbResult {
        self.inner.check_open()?;
        self.inner.checkpoint_inner(true)
    }

    /// Flush buffered redo to the OS.
    pub fn flush(&self) -> DbResult {
        self.inner.check_open()?;
        self.inner.redo.flush()
    }

    /// Flush and fsync redo.
    pub fn sync(&self) -> DbResult {
        self.inner.check_open()?;
        self.inner.redo.sync()
    }

    /// Orderly shutdown: final checkpoint, shutdown record, cache teardown.
    pub fn close(&self) -> DbResult {
        self.inner.close(true)
    }

    /// Test support: drop all in-memory state without flushing anything, as
    /// a crash would. The files stay behind for the next open to recover.
    pub fn simulate_crash(&self) {
        self.inner.close_abruptly();
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.inner.is_closed.load(Ordering::SeqCst) {
            if let Err(e) = self.inner.close(true) {
                warn!("close on drop failed: {}", e);
            }
        }
    }
}

impl DatabaseInner {
    #[allow(clippy::too_many_arguments)]
    fn assemble(
        opts: Options,
        storage: Arc<Storage>,
        redo: Arc<RedoWriter>,
        ctx: Arc<TxnContext>,
        registry: Arc<BTree>,
        key_map: Arc<BTree>,
        tree_id_mask: u64,
        next_tree_seq: u64,
    ) -> Arc<DatabaseInner> {
        let mut by_id = HashMap::new();
        by_id.insert(REGISTRY_TREE_ID, Arc::clone(&registry));
        by_id.insert(KEY_MAP_TREE_ID, Arc::clone(&key_map));

        let inner = Arc::new(DatabaseInner {
            opts,
            storage,
            redo,
            ctx,
            registry,
            key_map,
            open_trees: Mutex::new(OpenTrees {
                by_name: HashMap::new(),
                by_id,
            }),
            next_tree_seq: AtomicU64::new(next_tree_seq),
            tree_id_mask,
            ckpt_state: CheckpointState::new(),
            is_closed: AtomicBool::new(false),
            close_cause: Mutex::new(None),
            ckpt_stop: Mutex::new(None),
            ckpt_thread: Mutex::new(None),
        });

        inner.install_root_hook(&inner.key_map);

        let resolver_weak: Weak<DatabaseInner> = Arc::downgrade(&inner);
        inner.ctx.install_resolver(Box::new(move |tree_id| {
            match resolver_weak.upgrade() {
                Some(inner) => inner.open_tree_by_id(tree_id),
                None => Err(DbError::Closed(None)),
            }
        }));

        let reclaim_weak = Arc::downgrade(&inner);
        inner
            .storage
            .set_reclaim_hook(Box::new(move || {
                if let Some(inner) = reclaim_weak.upgrade() {
                    inner.reclaim_unreferenced_trees();
                }
            }));

        inner
    }

    /// Root page moves propagate into the registry so the checkpoint header
    /// only ever needs the registry's own root.
    fn install_root_hook(&self, tree: &Arc<BTree>) {
        let registry = Arc::clone(&self.registry);
        tree.set_root_moved(Box::new(move |tree_id, new_root| {
            registry
                .put(&registry_key(tree_id), &new_root.to_le_bytes())
                .map(|_| ())
        }));
    }

    fn check_open(&self) -> DbResult {
        if self.is_closed.load(Ordering::SeqCst) {
            return Err(DbError::Closed(self.close_cause.lock().unwrap().clone()));
        }
        Ok(())
    }

    /// Any error during a checkpoint commit poisons the database: further
    /// operations fail fast with the original cause.
    fn panic_with(&self, cause: &DbError) {
        error!("database panicked: {}", cause);
        *self.close_cause.lock().unwrap() = Some(cause.to_string());
        self.is_closed.store(true, Ordering::SeqCst);
    }

    fn checkpoint_inner(self: &Arc<Self>, force: bool) -> DbResult {
        match run_checkpoint(
            &self.ckpt_state,
            &self.storage,
            &self.redo,
            &self.ctx,
            &self.registry,
            force,
        ) {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_fatal() {
                    self.panic_with(&e);
                }
                Err(e)
            }
        }
    }

    fn spawn_checkpoint_thread(self: &Arc<Self>) {
        if self.opts.read_only || self.opts.checkpoint_rate.as_nanos() == 0 {
            return;
        }
        let (tx, rx) = crossbeam::channel::bounded::<()>(1);
        let weak = Arc::downgrade(self);
        let rate = self.opts.checkpoint_rate;
        let size_threshold = self.opts.checkpoint_size_threshold;
        let delay_threshold = self.opts.checkpoint_delay_threshold;
        let handle = std::thread::Builder::new()
            .name("aspen-checkpointer".to_string())
            .spawn(move || loop {
                match rx.recv_timeout(rate) {
                    Ok(()) | Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                    Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                        let inner = match weak.upgrade() {
                            Some(inner) => inner,
                            None => break,
                        };
                        if inner.is_closed.load(Ordering::SeqCst) {
                            break;
                        }
                        let due_by_size =
                            inner.redo.bytes_since_checkpoint() >= size_threshold;
                        let recent = inner.ckpt_state.since_last() < delay_threshold;
                        if due_by_size || !recent {
                            if let Err(e) = inner.checkpoint_inner(false) {
                                warn!("timed checkpoint failed: {}", e);
                            }
                        }
                    }
                }
            })
            .expect("spawning the checkpoint thread");
        *self.ckpt_stop.lock().unwrap() = Some(tx);
        *self.ckpt_thread.lock().unwrap() = Some(handle);
    }

    fn stop_checkpoint_thread(&self) {
        if let Some(tx) = self.ckpt_stop.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.ckpt_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn close(self: &Arc<Self>, checkpoint: bool) -> DbResult {
        if self.is_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_checkpoint_thread();
        if checkpoint && !self.opts.read_only {
            if let Err(e) = run_checkpoint(
                &self.ckpt_state,
                &self.storage,
                &self.redo,
                &self.ctx,
                &self.registry,
                true,
            ) {
                warn!("final checkpoint failed: {}", e);
            }
            let _ = self.redo.shutdown();
        }
        self.storage.close();
        info!("database closed: {:?}", self.opts.base_file_path);
        Ok(())
    }

    fn close_abruptly(&self) {
        if self.is_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_checkpoint_thread();
        self.storage.close();
        debug!("simulated crash: in-memory state dropped");
    }

    fn stats(&self) -> Stats {
        Stats {
            total_pages: self.storage.store.page_count(),
            free_pages: self.storage.alloc.free_page_count(),
            cached_nodes: self.storage.cache.len(),
            dirty_pages: self.storage.alloc.dirty_snapshot(0).len()
                + self.storage.alloc.dirty_snapshot(1).len(),
        }
    }

    // ------------------------------------------------------------------
    // the open-tree table
    // ------------------------------------------------------------------

    fn open_tree_by_name(self: &Arc<Self>, name: &[u8]) -> Result<Arc<BTree>, DbError> {
        let mut trees = self.open_trees.lock().unwrap();
        if let Some(tree) = trees.by_name.get(name) {
            return Ok(Arc::clone(tree));
        }

        if let Some(id_bytes) = self.key_map.load_value(&name_key(name))? {
            // Known name: open by id.
            let tree_id = u64::from_le_bytes(
                id_bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| DbError::corrupt("name row is malformed"))?,
            );
            let tree = self.open_tree_by_id_locked(&mut trees, tree_id)?;
            trees.by_name.insert(name.to_vec(), Arc::clone(&tree));
            return Ok(tree);
        }

        if self.opts.read_only {
            return Err(DbError::Unmodifiable);
        }

        // New tree: scramble ids until one passes the reserved-range test
        // and is unused.
        let tree_id = loop {
            let seq = self.next_tree_seq.fetch_add(1, Ordering::SeqCst);
            let candidate = seq ^ self.tree_id_mask;
            if is_user_tree_id(candidate)
                && self.registry.load_value(&registry_key(candidate))?.is_none()
            {
                break candidate;
            }
        };

        let tree = BTree::create(Arc::clone(&self.storage), tree_id)?;
        self.install_root_hook(&tree);
        {
            let _commit = self.storage.store.shared_commit_lock();
            self.registry
                .put(&registry_key(tree_id), &tree.root_id().to_le_bytes())?;
            self.key_map.put(&name_key(name), &tree_id.to_le_bytes())?;
            self.key_map.put(&id_key(tree_id), name)?;
            let seq = self.next_tree_seq.load(Ordering::SeqCst);
            self.key_map.put(KEY_MAP_SEQ_KEY, &seq.to_le_bytes())?;
        }
        // Name rows ride the redo log as no-lock ops so replay can rebuild
        // them; registry rows never do, root ids are replay-local.
        self.redo.store(0, KEY_MAP_TREE_ID, &name_key(name), &tree_id.to_le_bytes())?;
        self.redo.store(0, KEY_MAP_TREE_ID, &id_key(tree_id), name)?;
        self.redo.store(
            0,
            KEY_MAP_TREE_ID,
            KEY_MAP_SEQ_KEY,
            &self.next_tree_seq.load(Ordering::SeqCst).to_le_bytes(),
        )?;

        debug!("created tree {:?} with id {:#x}", name, tree_id);
        trees.by_id.insert(tree_id, Arc::clone(&tree));
        trees.by_name.insert(name.to_vec(), Arc::clone(&tree));
        Ok(tree)
    }

    /// Open by id, creating an empty tree when the registry has no row yet;
    /// redo replay depends on that for trees born after the last
    /// checkpoint.
    fn open_tree_by_id(self: &Arc<Self>, tree_id: TreeId) -> Result<Arc<BTree>, DbError> {
        let mut trees = self.open_trees.lock().unwrap();
        self.open_tree_by_id_locked(&mut trees, tree_id)
    }

    fn open_tree_by_id_locked(
        self: &Arc<Self>,
        trees: &mut OpenTrees,
        tree_id: TreeId,
    ) -> Result<Arc<BTree>, DbError> {
        if let Some(tree) = trees.by_id.get(&tree_id) {
            return Ok(Arc::clone(tree));
        }
        let tree = match self.registry.load_value(&registry_key(tree_id))? {
            Some(root_bytes) => {
                let root = u64::from_le_bytes(
                    root_bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| DbError::corrupt("registry row is malformed"))?,
                );
                BTree::open_root(Arc::clone(&self.storage), tree_id, root)?
            }
            None => {
                let tree = BTree::create(Arc::clone(&self.storage), tree_id)?;
                let _commit = self.storage.store.shared_commit_lock();
                self.registry
                    .put(&registry_key(tree_id), &tree.root_id().to_le_bytes())?;
                tree
            }
        };
        self.install_root_hook(&tree);
        trees.by_id.insert(tree_id, Arc::clone(&tree));
        if let Some(name) = self.key_map.load_value(&id_key(tree_id))? {
            trees.by_name.insert(name, Arc::clone(&tree));
        }
        Ok(tree)
    }

    fn drop_tree(self: &Arc<Self>, name: &[u8]) -> DbResult {
        let tree = self.open_tree_by_name(name)?;
        let tree_id = tree.tree_id;
        if !is_user_tree_id(tree_id) {
            return Err(DbError::Unsupported("dropping an internal tree"));
        }

        {
            let mut trees = self.open_trees.lock().unwrap();
            trees.by_name.remove(name);
            trees.by_id.remove(&tree_id);
        }
        {
            let _commit = self.storage.store.shared_commit_lock();
            self.key_map.delete(&name_key(name), None)?;
            self.key_map.delete(&id_key(tree_id), None)?;
            self.registry.delete(&registry_key(tree_id), None)?;
            tree.delete_all_pages()?;
        }
        self.redo.delete(0, KEY_MAP_TREE_ID, &name_key(name))?;
        self.redo.delete(0, KEY_MAP_TREE_ID, &id_key(tree_id))?;
        self.redo.drop_tree(0, tree_id, self.opts.durability_mode)?;
        info!("dropped tree {:?} (id {:#x})", name, tree_id);
        Ok(())
    }

    /// Retire open trees with no external references: unpin their roots so
    /// the cache can evict them, and forget the handles. Invoked by the
    /// cache when eviction runs dry.
    fn reclaim_unreferenced_trees(&self) {
        // Best effort: the hook can fire from inside an operation that
        // already holds the table mutex (tree creation filling the cache).
        let mut trees = match self.open_trees.try_lock() {
            Ok(trees) => trees,
            Err(_) => return,
        };
        let mut retire: Vec<TreeId> = Vec::new();
        for (id, tree) in trees.by_id.iter() {
            if !is_user_tree_id(*id) {
                continue;
            }
            // Two strong references mean only the open-tree table holds it
            // (by id, and possibly by name).
            let external = Arc::strong_count(tree)
                > 1 + trees.by_name.values().filter(|t| Arc::ptr_eq(t, tree)).count();
            if !external {
                retire.push(*id);
            }
        }
        for id in retire {
            if let Some(tree) = trees.by_id.remove(&id) {
                trees.by_name.retain(|_, t| !Arc::ptr_eq(t, &tree));
                let pod_id = tree.root_id();
                {
                    let pod = self.storage.get_node(pod_id);
                    if let Ok(pod) = pod {
                        pod.write().unwrap().pinned = false;
                    }
                }
                self.storage.cache.make_evictable(pod_id);
                debug!("reclaimed unreferenced tree {:#x}", id);
            }
        }
    }
}

impl Tree {
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn id(&self) -> TreeId {
        self.tree.tree_id
    }

    /// Transactional read; the key lock rides to commit.
    pub fn load(&self, tx: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.inner.check_open()?;
        tx.txn_load(&self.tree, key)
    }

    /// Transactional store.
    pub fn store(&self, tx: &Transaction, key: &[u8], value: &[u8]) -> DbResult {
        self.inner.check_open()?;
        tx.txn_store(&self.tree, key, Some(value))
    }

    /// Transactional delete, leaving a ghost until commit.
    pub fn delete(&self, tx: &Transaction, key: &[u8]) -> DbResult {
        self.inner.check_open()?;
        tx.txn_store(&self.tree, key, None)
    }

    /// Auto-commit read.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.inner.check_open()?;
        let tx = Transaction::new(Arc::clone(&self.inner.ctx), self.inner.opts.durability_mode);
        let result = tx.txn_load(&self.tree, key);
        match tx.commit() {
            Ok(()) => result,
            Err(e) => {
                let _ = tx.reset();
                Err(e)
            }
        }
    }

    /// Auto-commit store: one transaction per call, fully rolled back on
    /// failure.
    pub fn put(&self, key: &[u8], value: &[u8]) -> DbResult {
        self.auto_commit(key, Some(value))
    }

    /// Auto-commit delete.
    pub fn remove(&self, key: &[u8]) -> DbResult {
        self.auto_commit(key, None)
    }

    fn auto_commit(&self, key: &[u8], value: Option<&[u8]>) -> DbResult {
        self.inner.check_open()?;
        let tx = Transaction::new(Arc::clone(&self.inner.ctx), self.inner.opts.durability_mode);
        match tx.txn_store(&self.tree, key, value) {
            Ok(()) => tx.commit(),
            Err(e) => {
                let _ = tx.reset();
                Err(e)
            }
        }
    }

    pub fn cursor(&self) -> Cursor {
        Cursor::new(Arc::clone(&self.tree))
    }

    /// Non-ghost entry count, by traversal.
    pub fn count(&self) -> Result<u64, DbError> {
        self.inner.check_open()?;
        self.tree.count()
    }

    /// Delete every key in `[lo, hi)` under one transaction.
    pub fn delete_range(&self, tx: &Transaction, lo: &[u8], hi: &[u8]) -> DbResult {
        self.inner.check_open()?;
        let mut cursor = self.cursor();
        let mut at = cursor.find_ge(lo)?.map(|k| k.to_vec());
        while let Some(key) = at {
            if key.as_slice() >= hi {
                break;
            }
            tx.txn_store(&self.tree, &key, None)?;
            at = cursor.find_gt(&key)?.map(|k| k.to_vec());
        }
        Ok(())
    }

    /// The stored length of a value without materializing it.
    pub fn value_length(&self, tx: &Transaction, key: &[u8]) -> Result<Option<u64>, DbError> {
        self.inner.check_open()?;
        tx.lock_shared(self.tree.tree_id, key)?;
        match self.tree.get(key)? {
            None | Some(LeafValue::Ghost { .. }) => Ok(None),
            Some(LeafValue::Inline(v)) => Ok(Some(v.len() as u64)),
            Some(LeafValue::Fragmented(desc)) => {
                let shape = fragment::FragmentShape::parse(&self.inner.storage, &desc)?;
                Ok(Some(shape.total_len))
            }
        }
    }

    /// Random-access read within a value. Returns the bytes copied, short
    /// at the value's end.
    pub fn read_value_range(
        &self,
        tx: &Transaction,
        key: &[u8],
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, DbError> {
        self.inner.check_open()?;
        tx.lock_shared(self.tree.tree_id, key)?;
        match self.tree.get(key)? {
            None | Some(LeafValue::Ghost { .. }) => Ok(0),
            Some(LeafValue::Inline(v)) => {
                if offset >= v.len() as u64 {
                    return Ok(0);
                }
                let start = offset as usize;
                let n = (v.len() - start).min(buf.len());
                buf[..n].copy_from_slice(&v[start..start + n]);
                Ok(n)
            }
            Some(LeafValue::Fragmented(desc)) => {
                let shape = fragment::FragmentShape::parse(&self.inner.storage, &desc)?;
                if offset >= shape.total_len {
                    return Ok(0);
                }
                let n = ((shape.total_len - offset) as usize).min(buf.len());
                fragment::read_range(&self.inner.storage, &desc, offset, &mut buf[..n])?;
                Ok(n)
            }
        }
    }

    /// Random-access write within a value, transactionally: the value is
    /// patched and re-stored, so undo and redo see one logical store. The
    /// value's length does not change here.
    pub fn write_value_range(
        &self,
        tx: &Transaction,
        key: &[u8],
        offset: u64,
        data: &[u8],
    ) -> DbResult {
        self.inner.check_open()?;
        tx.lock_exclusive(self.tree.tree_id, key)?;
        let mut value = match self.tree.load_value(key)? {
            Some(v) => v,
            None => return Err(DbError::Unsupported("value stream over a missing key")),
        };
        if offset + data.len() as u64 > value.len() as u64 {
            return Err(DbError::Unsupported(
                "length-changing edits of fragmented values",
            ));
        }
        value[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        tx.txn_store(&self.tree, key, Some(&value))
    }

    /// Create a sparse value of `length` zero bytes without allocating its
    /// pages; later `patch` calls fill it in. Non-transactional, like the
    /// maintenance surface it mirrors.
    pub fn create_blank_value(&self, key: &[u8], length: u64) -> DbResult {
        self.inner.check_open()?;
        let desc = fragment::fragment_blank(
            &self.inner.storage,
            length,
            self.tree.max_inline_len(),
        )?;
        let _commit = self.inner.storage.store.shared_commit_lock();
        let out = self.tree.put_value(key, LeafValue::Fragmented(desc))?;
        if let Some(LeafValue::Fragmented(old)) = out.prior {
            fragment::delete_fragments(&self.inner.storage, &old)?;
        }
        Ok(())
    }

    /// Non-transactional random-access write: pages rewrite copy-on-write
    /// and sparse gaps allocate zero-filled. Pairs with
    /// `create_blank_value`.
    pub fn patch_value(&self, key: &[u8], offset: u64, data: &[u8]) -> DbResult {
        self.inner.check_open()?;
        let _commit = self.inner.storage.store.shared_commit_lock();
        match self.tree.get(key)? {
            Some(LeafValue::Fragmented(mut desc)) => {
                fragment::write_range(&self.inner.storage, &mut desc, offset, data)?;
                self.tree.put_value(key, LeafValue::Fragmented(desc))?;
                Ok(())
            }
            Some(LeafValue::Inline(mut v)) => {
                if offset + data.len() as u64 > v.len() as u64 {
                    return Err(DbError::Unsupported(
                        "length-changing edits of fragmented values",
                    ));
                }
                v[offset as usize..offset as usize + data.len()].copy_from_slice(data);
                self.tree.put_value(key, LeafValue::Inline(v))?;
                Ok(())
            }
            _ => Err(DbError::Unsupported("value stream over a missing key")),
        }
    }

    /// Walk the tree verifying order and structure.
    pub fn check_integrity(&self) -> DbResult {
        self.inner.check_open()?;
        self.tree.check_integrity()
    }

    /// Log a structural dump, `max_depth` levels deep (-1 for all).
    pub fn draw(&self, max_depth: i32) {
        self.tree.draw(max_depth);
    }
}

fn remove_database_files(opts: &Options) -> DbResult {
    let base = &opts.base_file_path;
    for path in [
        base.clone(),
        info_file_path(base),
        lock_file_path(base),
    ]
    .iter()
    {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(DbError::io("destroying database files", e)),
        }
    }
    // Redo segments and temp files share the base name prefix.
    if let Some(dir) = base.parent() {
        let dir = if dir.as_os_str().is_empty() {
            std::path::Path::new(".")
        } else {
            dir
        };
        let stem = base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(&format!("{}.redo.", stem))
                    || name.starts_with(&format!("{}.temp.", stem))
                {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }
    Ok(())
}
