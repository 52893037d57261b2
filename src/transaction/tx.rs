use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::btree::node::LeafValue;
use crate::btree::BTree;
use crate::config::DurabilityMode;
use crate::error::DbError;
use crate::transaction::lock_manager::{LockMode, LockResult};
use crate::transaction::undo_log::{UndoLog, UndoRecord};
use crate::transaction::{apply_undo_records, TxnContext};
use crate::types::{DbResult, TreeId, TxnId};

struct Scope {
    locks: Vec<(TreeId, Vec<u8>)>,
    /// Keys this scope ghost-deleted; reclaimed physically at terminal
    /// commit.
    ghosts: Vec<(TreeId, Vec<u8>)>,
    /// Fragment descriptors replaced by this scope; their pages free at
    /// terminal commit and survive on rollback.
    trash: Vec<Vec<u8>>,
}

impl Scope {
    fn new() -> Self {
        Self {
            locks: Vec::new(),
            ghosts: Vec::new(),
            trash: Vec::new(),
        }
    }
}

struct TxState {
    /// 0 until the first lock or mutation; 0 also means "no redo".
    id: TxnId,
    undo: Option<Arc<Mutex<UndoLog>>>,
    scopes: Vec<Scope>,
}

/// A transaction: owned locks, a reversal log, nested scopes, and a
/// durability mode for its commits.
///
/// Interior mutability keeps the public methods `&self`, matching how a
/// transaction threads through cursors and trees.
pub struct Transaction {
    ctx: Arc<TxnContext>,
    durability: DurabilityMode,
    state: Mutex<TxState>,
}

impl Transaction {
    pub(crate) fn new(ctx: Arc<TxnContext>, durability: DurabilityMode) -> Self {
        Self {
            ctx,
            durability,
            state: Mutex::new(TxState {
                id: 0,
                undo: None,
                scopes: vec![Scope::new()],
            }),
        }
    }

    pub fn durability(&self) -> DurabilityMode {
        self.durability
    }

    /// The transaction's id; 0 until it first locks or mutates.
    pub fn id(&self) -> TxnId {
        self.state.lock().unwrap().id
    }

    fn ensure_id(&self, state: &mut TxState) -> TxnId {
        if state.id == 0 {
            state.id = self.ctx.assign_txn_id();
        }
        state.id
    }

    fn ensure_undo(&self, state: &mut TxState) -> Arc<Mutex<UndoLog>> {
        let id = self.ensure_id(state);
        if state.undo.is_none() {
            let undo = Arc::new(Mutex::new(UndoLog::new(id)));
            self.ctx.register_undo(id, Arc::clone(&undo));
            state.undo = Some(undo);
        }
        Arc::clone(state.undo.as_ref().unwrap())
    }

    // ------------------------------------------------------------------
    // explicit locking
    // ------------------------------------------------------------------

    pub fn lock_shared(&self, tree_id: TreeId, key: &[u8]) -> Result<LockResult, DbError> {
        self.lock(tree_id, key, LockMode::Shared)
    }

    pub fn lock_upgradable(&self, tree_id: TreeId, key: &[u8]) -> Result<LockResult, DbError> {
        self.lock(tree_id, key, LockMode::Upgradable)
    }

    pub fn lock_exclusive(&self, tree_id: TreeId, key: &[u8]) -> Result<LockResult, DbError> {
        self.lock(tree_id, key, LockMode::Exclusive)
    }

    fn lock(&self, tree_id: TreeId, key: &[u8], mode: LockMode) -> Result<LockResult, DbError> {
        let owner = {
            let mut state = self.state.lock().unwrap();
            self.ensure_id(&mut state)
        };
        let result = self.ctx.locks.acquire(
            owner,
            tree_id,
            key,
            mode,
            self.ctx.lock_timeout,
            self.ctx.upgrade_rule,
        )?;
        if matches!(result, LockResult::Acquired | LockResult::Upgraded) {
            let mut state = self.state.lock().unwrap();
            state
                .scopes
                .last_mut()
                .unwrap()
                .locks
                .push((tree_id, key.to_vec()));
        }
        Ok(result)
    }

    pub fn unlock(&self, tree_id: TreeId, key: &[u8]) {
        self.release_one(tree_id, key, None);
    }

    pub fn unlock_to_shared(&self, tree_id: TreeId, key: &[u8]) {
        self.release_one(tree_id, key, Some(LockMode::Shared));
    }

    pub fn unlock_to_upgradable(&self, tree_id: TreeId, key: &[u8]) {
        self.release_one(tree_id, key, Some(LockMode::Upgradable));
    }

    fn release_one(&self, tree_id: TreeId, key: &[u8], downgrade: Option<LockMode>) {
        let owner = self.id();
        if owner == 0 {
            return;
        }
        self.ctx.locks.release(owner, tree_id, key, downgrade);
        if downgrade.is_none() {
            let mut state = self.state.lock().unwrap();
            for scope in state.scopes.iter_mut().rev() {
                if let Some(pos) = scope
                    .locks
                    .iter()
                    .rposition(|(t, k)| *t == tree_id && k == key)
                {
                    scope.locks.remove(pos);
                    break;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // reads and writes
    // ------------------------------------------------------------------

    /// Transactional read: shared lock held to commit (repeatable read).
    pub(crate) fn txn_load(
        &self,
        tree: &Arc<BTree>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, DbError> {
        self.lock_shared(tree.tree_id, key)?;
        tree.load_value(key)
    }

    /// Transactional store; `value` of `None` deletes, leaving a ghost so
    /// the key lock keeps something to attach to.
    pub(crate) fn txn_store(
        &self,
        tree: &Arc<BTree>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> DbResult {
        self.lock_exclusive(tree.tree_id, key)?;
        let (txn_id, undo) = {
            let mut state = self.state.lock().unwrap();
            let undo = self.ensure_undo(&mut state);
            (state.id, undo)
        };

        // The exclusive key lock freezes this key, so the prior image read
        // here is the one the mutation will replace.
        let prior = tree.get(key)?;

        let record = match (&value, &prior) {
            (Some(_), None) => Some(UndoRecord::InsertTombstone {
                tree_id: tree.tree_id,
                key: key.to_vec(),
            }),
            (Some(_), Some(p)) => Some(UndoRecord::UpdateImage {
                tree_id: tree.tree_id,
                key: key.to_vec(),
                prior: p.clone(),
            }),
            (None, Some(p)) if !p.is_ghost() => Some(UndoRecord::DeleteImage {
                tree_id: tree.tree_id,
                key: key.to_vec(),
                prior: p.clone(),
            }),
            // Deleting an absent key, or one this transaction already
            // ghosted, changes nothing.
            (None, _) => None,
        };
        let record = match record {
            Some(r) => r,
            None => return Ok(()),
        };

        {
            // One shared-commit-lock region covers the undo record and the
            // mutation it reverses, so a checkpoint never captures one
            // without the other.
            let _commit = self.ctx.storage.store.shared_commit_lock();
            undo.lock().unwrap().push(&self.ctx.storage, record)?;
            match value {
                Some(v) => {
                    tree.put(key, v)?;
                }
                None => {
                    tree.delete(key, Some(txn_id))?;
                }
            }
        }

        // Bookkeeping for fragment reclamation and ghost cleanup.
        {
            let mut state = self.state.lock().unwrap();
            let scope = state.scopes.last_mut().unwrap();
            if let Some(LeafValue::Fragmented(desc)) = &prior {
                scope.trash.push(desc.clone());
            }
            if value.is_none() {
                scope.ghosts.push((tree.tree_id, key.to_vec()));
            }
        }

        if self.durability != DurabilityMode::NoRedo {
            match value {
                Some(v) => self.ctx.redo.store(txn_id, tree.tree_id, key, v)?,
                None => self.ctx.redo.delete(txn_id, tree.tree_id, key)?,
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // scopes and termination
    // ------------------------------------------------------------------

    /// Open a nested scope.
    pub fn enter(&self) -> DbResult {
        let mut state = self.state.lock().unwrap();
        let undo = self.ensure_undo(&mut state);
        let txn_id = state.id;
        state.scopes.push(Scope::new());
        {
            let _commit = self.ctx.storage.store.shared_commit_lock();
            undo.lock().unwrap().enter_scope(&self.ctx.storage)?;
        }
        drop(state);
        if self.durability != DurabilityMode::NoRedo {
            self.ctx.redo.txn_enter(txn_id)?;
        }
        Ok(())
    }

    /// Roll the innermost scope back and close it.
    pub fn exit(&self) -> DbResult {
        let (txn_id, undo, scope) = {
            let mut state = self.state.lock().unwrap();
            if state.scopes.len() <= 1 {
                drop(state);
                return self.reset();
            }
            let scope = state.scopes.pop().unwrap();
            (state.id, state.undo.clone(), scope)
        };

        if let Some(undo) = undo {
            let records = undo.lock().unwrap().pop_scope(&self.ctx.storage)?;
            apply_undo_records(&self.ctx, &records)?;
        }
        for (tree_id, key) in scope.locks.iter().rev() {
            self.ctx.locks.release(txn_id, *tree_id, key, None);
        }
        if self.durability != DurabilityMode::NoRedo && txn_id != 0 {
            self.ctx.redo.txn_rollback(txn_id)?;
        }
        Ok(())
    }

    /// Commit the innermost scope; the outermost commit is the real one.
    pub fn commit(&self) -> DbResult {
        let nested = {
            let state = self.state.lock().unwrap();
            state.scopes.len() > 1
        };
        if nested {
            self.commit_scope()
        } else {
            self.commit_final()
        }
    }

    fn commit_scope(&self) -> DbResult {
        let mut state = self.state.lock().unwrap();
        let scope = state.scopes.pop().unwrap();
        let parent = state.scopes.last_mut().unwrap();
        parent.locks.extend(scope.locks);
        parent.ghosts.extend(scope.ghosts);
        parent.trash.extend(scope.trash);
        let undo = state.undo.clone();
        let txn_id = state.id;
        drop(state);

        if let Some(undo) = undo {
            let _commit = self.ctx.storage.store.shared_commit_lock();
            undo.lock().unwrap().commit_scope(&self.ctx.storage)?;
        }
        if self.durability != DurabilityMode::NoRedo && txn_id != 0 {
            self.ctx.redo.txn_commit(txn_id, DurabilityMode::NoFlush)?;
        }
        Ok(())
    }

    /// Terminal commit: redo durability per mode, ghost reclamation, trash
    /// disposal, lock release, and a reset ready for reuse.
    fn commit_final(&self) -> DbResult {
        let (txn_id, undo, scope) = {
            let mut state = self.state.lock().unwrap();
            let scope = state.scopes.pop().unwrap();
            state.scopes.push(Scope::new());
            (state.id, state.undo.take(), scope)
        };
        if txn_id == 0 {
            // Read-only: nothing mutated, nothing to make durable.
            self.release_locks(txn_id, &scope);
            return Ok(());
        }

        if self.durability != DurabilityMode::NoRedo {
            self.ctx.redo.txn_commit(txn_id, self.durability)?;
        }

        // The commit is durable; ghosts become plain deletes and replaced
        // fragments become free pages.
        for (tree_id, key) in &scope.ghosts {
            if let Ok(tree) = self.ctx.resolve_tree(*tree_id) {
                let _commit = self.ctx.storage.store.shared_commit_lock();
                tree.remove_ghost(key, txn_id)?;
            }
        }
        for desc in &scope.trash {
            crate::btree::fragment::delete_fragments(&self.ctx.storage, desc)?;
        }

        if let Some(undo) = undo {
            undo.lock().unwrap().truncate(&self.ctx.storage);
            self.ctx.unregister_undo(txn_id);
        }
        self.release_locks(txn_id, &scope);

        let mut state = self.state.lock().unwrap();
        state.id = 0;
        debug!("txn {} committed", txn_id);
        Ok(())
    }

    /// Roll everything back and return the transaction to a fresh state.
    /// Safe to call at any point, including after an error.
    pub fn reset(&self) -> DbResult {
        let (txn_id, undo, scopes) = {
            let mut state = self.state.lock().unwrap();
            let scopes = std::mem::replace(&mut state.scopes, vec![Scope::new()]);
            let undo = state.undo.take();
            let id = state.id;
            state.id = 0;
            (id, undo, scopes)
        };
        if txn_id == 0 {
            return Ok(());
        }

        if let Some(undo) = undo {
            let records = undo.lock().unwrap().pop_all(&self.ctx.storage)?;
            apply_undo_records(&self.ctx, &records)?;
            undo.lock().unwrap().truncate(&self.ctx.storage);
            self.ctx.unregister_undo(txn_id);
        }

        if self.durability != DurabilityMode::NoRedo {
            self.ctx.redo.txn_rollback(txn_id)?;
        }

        for scope in scopes.iter().rev() {
            self.release_locks(txn_id, scope);
        }
        self.ctx.locks.forget_owner(txn_id);
        debug!("txn {} rolled back", txn_id);
        Ok(())
    }

    fn release_locks(&self, txn_id: TxnId, scope: &Scope) {
        if txn_id == 0 {
            return;
        }
        for (tree_id, key) in scope.locks.iter().rev() {
            self.ctx.locks.release(txn_id, *tree_id, key, None);
        }
    }

}

impl Drop for Transaction {
    fn drop(&mut self) {
        let needs_rollback = self.state.lock().unwrap().id != 0;
        if needs_rollback {
            if let Err(e) = self.reset() {
                warn!("rollback on drop failed: {}", e);
            }
        }
    }
}
