pub mod lock_manager;
pub mod tx;
pub mod undo_log;
mod wait_for_graph;

pub use lock_manager::{LockManager, LockMode, LockResult};
pub use tx::Transaction;
pub use undo_log::{UndoLog, UndoRecord};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::btree::fragment;
use crate::btree::node::LeafValue;
use crate::btree::BTree;
use crate::config::{DurabilityMode, LockUpgradeRule};
use crate::error::DbError;
use crate::redo::RedoWriter;
use crate::storage::Storage;
use crate::types::{DbResult, TreeId, TxnId};

pub(crate) type TreeResolver = Box<dyn Fn(TreeId) -> Result<Arc<BTree>, DbError> + Send + Sync>;

/// Everything a transaction needs from the database, shared by `Arc` so
/// transactions can outlive the call frame that created them.
pub(crate) struct TxnContext {
    pub storage: Arc<Storage>,
    pub locks: LockManager,
    pub redo: Arc<RedoWriter>,
    pub lock_timeout: Duration,
    pub upgrade_rule: LockUpgradeRule,
    pub default_durability: DurabilityMode,
    /// Monotonic transaction id counter, persisted through the commit
    /// header and never reused.
    next_txn_id: AtomicU64,
    /// Live undo logs, enumerated by the checkpoint's master undo log.
    active_undo: Mutex<HashMap<TxnId, Arc<Mutex<UndoLog>>>>,
    /// Installed by the database once its tree table exists; rollback uses
    /// it to find trees by id.
    resolver: RwLock<Option<TreeResolver>>,
}

impl TxnContext {
    pub fn new(
        storage: Arc<Storage>,
        redo: Arc<RedoWriter>,
        lock_timeout: Duration,
        upgrade_rule: LockUpgradeRule,
        default_durability: DurabilityMode,
        first_txn_id: TxnId,
    ) -> Self {
        Self {
            storage,
            locks: LockManager::new(),
            redo,
            lock_timeout,
            upgrade_rule,
            default_durability,
            next_txn_id: AtomicU64::new(first_txn_id.max(1)),
            active_undo: Mutex::new(HashMap::new()),
            resolver: RwLock::new(None),
        }
    }

    pub fn install_resolver(&self, resolver: TreeResolver) {
        *self.resolver.write().unwrap() = Some(resolver);
    }

    pub fn resolve_tree(&self, tree_id: TreeId) -> Result<Arc<BTree>, DbError> {
        match self.resolver.read().unwrap().as_ref() {
            Some(f) => f(tree_id),
            None => Err(DbError::Closed(Some(
                "transaction context detached".to_string(),
            ))),
        }
    }

    pub fn assign_txn_id(&self) -> TxnId {
        self.next_txn_id.fetch_add(1, Ordering::SeqCst)
    }

    /// The next id that will be handed out; the checkpoint header persists
    /// this so ids stay monotonic across restarts.
    pub fn current_txn_counter(&self) -> TxnId {
        self.next_txn_id.load(Ordering::SeqCst)
    }

    pub fn bump_txn_counter(&self, at_least: TxnId) {
        let mut cur = self.next_txn_id.load(Ordering::SeqCst);
        while cur < at_least {
            match self.next_txn_id.compare_exchange(
                cur,
                at_least,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn register_undo(&self, txn_id: TxnId, undo: Arc<Mutex<UndoLog>>) {
        self.active_undo.lock().unwrap().insert(txn_id, undo);
    }

    pub fn unregister_undo(&self, txn_id: TxnId) {
        self.active_undo.lock().unwrap().remove(&txn_id);
    }

    pub fn active_undo_snapshot(&self) -> Vec<(TxnId, Arc<Mutex<UndoLog>>)> {
        self.active_undo
            .lock()
            .unwrap()
            .iter()
            .map(|(id, log)| (*id, Arc::clone(log)))
            .collect()
    }
}

/// Replay reversal records (newest first) against the current tree state.
/// No redo is emitted and no locks are taken: the caller either owns the
/// exclusive key locks or is single-threaded recovery.
pub(crate) fn apply_undo_records(
    ctx: &TxnContext,
    records: &[UndoRecord],
) -> DbResult {
    for record in records {
        let _commit = ctx.storage.store.shared_commit_lock();
        match record {
            UndoRecord::InsertTombstone { tree_id, key } => {
                let tree = ctx.resolve_tree(*tree_id)?;
                let out = tree.delete(key, None)?;
                if let Some(LeafValue::Fragmented(desc)) = out.prior {
                    fragment::delete_fragments(&ctx.storage, &desc)?;
                }
            }
            UndoRecord::UpdateImage {
                tree_id,
                key,
                prior,
            }
            | UndoRecord::DeleteImage {
                tree_id,
                key,
                prior,
            } => {
                let tree = ctx.resolve_tree(*tree_id)?;
                let out = tree.put_value(key, prior.clone())?;
                // The replaced value was written by the rolled-back
                // transaction itself; its fragments are garbage now.
                if let Some(LeafValue::Fragmented(desc)) = out.prior {
                    if *prior != LeafValue::Fragmented(desc.clone()) {
                        fragment::delete_fragments(&ctx.storage, &desc)?;
                    }
                }
            }
            UndoRecord::ScopeEnter => {}
        }
    }
    Ok(())
}
