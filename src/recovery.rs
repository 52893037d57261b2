use std::collections::{HashMap, HashSet};
use std::convert::TryInto;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::btree::fragment;
use crate::btree::node::LeafValue;
use crate::btree::tree::SeekOp;
use crate::btree::BTree;
use crate::error::DbError;
use crate::redo::{RedoOp, RedoReader};
use crate::storage::page_store::FIRST_USABLE_PAGE;
use crate::storage::Storage;
use crate::transaction::undo_log::{
    self, read_master_undo, recover_master_undo_log, UndoLog, UndoRecord,
};
use crate::transaction::{LockMode, TxnContext};
use crate::types::{DbResult, PageId, TreeId, TxnId};

/// State of one transaction reconstructed during replay: its reversal log
/// (seeded from the master undo log, extended as ops replay) and the
/// bookkeeping a live transaction would have carried.
struct RecoveredTxn {
    undo: UndoLog,
    ghosts: Vec<(TreeId, Vec<u8>)>,
    trash: Vec<Vec<u8>>,
    locked: Vec<(TreeId, Vec<u8>)>,
}

impl RecoveredTxn {
    fn new(txn_id: TxnId) -> Self {
        Self {
            undo: UndoLog::new(txn_id),
            ghosts: Vec::new(),
            trash: Vec::new(),
            locked: Vec::new(),
        }
    }
}

pub(crate) struct RecoveryOutcome {
    /// Whether anything was replayed or resolved; the caller forces an
    /// immediate checkpoint when set.
    pub work_done: bool,
    pub max_txn_id: TxnId,
}

/// Rebuild the allocator's free map: every page in the file that is not
/// reachable from the registry, an open tree, a fragmented value, or the
/// master undo chains is free. This also reclaims fragment pages whose
/// owning transactions disappeared in a crash.
pub(crate) fn rebuild_free_pages(
    storage: &Arc<Storage>,
    registry: &Arc<BTree>,
    key_map: &Arc<BTree>,
    resolve: &dyn Fn(TreeId) -> Result<Arc<BTree>, DbError>,
    master_undo: PageId,
) -> DbResult {
    let mut reachable_list: Vec<PageId> = Vec::new();
    registry.collect_pages(&mut reachable_list)?;
    key_map.collect_pages(&mut reachable_list)?;

    for (tree_id, _root) in registry_rows(registry)? {
        if tree_id == key_map.tree_id {
            continue;
        }
        let tree = resolve(tree_id)?;
        tree.collect_pages(&mut reachable_list)?;
    }

    if master_undo != 0 {
        undo_log::chain_pages(storage, master_undo, &mut reachable_list)?;
        for (_, head) in read_master_undo(storage, master_undo)? {
            undo_log::chain_pages(storage, head, &mut reachable_list)?;
        }
    }

    let reachable: HashSet<PageId> = reachable_list.into_iter().collect();
    let page_count = storage.store.page_count();
    let mut free = Vec::new();
    for id in FIRST_USABLE_PAGE..page_count {
        if !reachable.contains(&id) {
            free.push(id);
        }
    }
    debug!(
        "reachability sweep: {} pages, {} reachable, {} free",
        page_count,
        reachable.len(),
        free.len()
    );
    storage.alloc.rebuild_free(free);
    Ok(())
}

/// All (tree id, root page id) rows of the registry.
pub(crate) fn registry_rows(registry: &Arc<BTree>) -> Result<Vec<(TreeId, PageId)>, DbError> {
    let mut rows = Vec::new();
    let mut op = SeekOp::First;
    loop {
        match registry.seek(op)? {
            Some(hit) => {
                if hit.key.len() == 8 {
                    let tree_id = u64::from_be_bytes(hit.key[..8].try_into().unwrap());
                    if let LeafValue::Inline(v) = &hit.value {
                        if v.len() == 8 {
                            rows.push((tree_id, u64::from_le_bytes(v[..8].try_into().unwrap())));
                        }
                    }
                }
                let mut probe = hit.key;
                probe.push(0);
                op = SeekOp::Ge(probe);
            }
            None => return Ok(rows),
        }
    }
}

/// Replay redo from the checkpointed position, resolve surviving
/// transactions, and report whether anything happened.
///
/// Ops apply directly to trees under synthetic per-transaction state; the
/// terminator chain already validated each record, and a torn tail only
/// silences the remainder of its segment.
pub(crate) fn replay(
    storage: &Arc<Storage>,
    ctx: &Arc<TxnContext>,
    reader: &mut RedoReader,
    redo_position: u64,
    master_undo: PageId,
) -> Result<RecoveryOutcome, DbError> {
    let mut txns: HashMap<TxnId, RecoveredTxn> = HashMap::new();
    let mut max_txn_id = 0;
    let mut work_done = false;

    // Step 1: surviving undo logs, keyed by transaction id. Each recovered
    // transaction re-acquires upgradable locks on the keys its undo log
    // names, as the spec of a live transaction would require.
    if master_undo != 0 {
        for undo in recover_master_undo_log(storage, master_undo)? {
            let txn_id = undo.txn_id;
            max_txn_id = max_txn_id.max(txn_id);
            let mut recovered = RecoveredTxn::new(txn_id);
            for record in undo.all_records(storage)? {
                if let Some((tree_id, key)) = record_key(&record) {
                    if ctx
                        .locks
                        .acquire(
                            txn_id,
                            tree_id,
                            &key,
                            LockMode::Upgradable,
                            ctx.lock_timeout,
                            crate::config::LockUpgradeRule::Unchecked,
                        )
                        .is_ok()
                    {
                        recovered.locked.push((tree_id, key));
                    }
                }
            }
            recovered.undo = undo;
            txns.insert(txn_id, recovered);
            work_done = true;
        }
        info!("recovered {} in-flight transactions", txns.len());
    }

    // Step 2: replay.
    let ops = reader.read_from(redo_position)?;
    let op_count = ops.len();
    for (op, _pos) in ops {
        match op {
            RedoOp::Timestamp { .. } | RedoOp::EndFile | RedoOp::Shutdown => {}
            RedoOp::TxnEnter { txn_id } => {
                max_txn_id = max_txn_id.max(txn_id);
                let txn = txns
                    .entry(txn_id)
                    .or_insert_with(|| RecoveredTxn::new(txn_id));
                let _commit = storage.store.shared_commit_lock();
                txn.undo.enter_scope(storage)?;
            }
            RedoOp::Store {
                txn_id,
                tree_id,
                key,
                value,
            } => {
                max_txn_id = max_txn_id.max(txn_id);
                work_done = true;
                replay_store(storage, ctx, &mut txns, txn_id, tree_id, &key, Some(&value))?;
            }
            RedoOp::Delete {
                txn_id,
                tree_id,
                key,
            } => {
                max_txn_id = max_txn_id.max(txn_id);
                work_done = true;
                replay_store(storage, ctx, &mut txns, txn_id, tree_id, &key, None)?;
            }
            RedoOp::TxnCommit { txn_id } => {
                max_txn_id = max_txn_id.max(txn_id);
                if let Some(mut txn) = txns.remove(&txn_id) {
                    work_done = true;
                    let has_scope = txn
                        .undo
                        .all_records(storage)?
                        .iter()
                        .any(|r| *r == UndoRecord::ScopeEnter);
                    if has_scope {
                        // Scope commit: fold into the parent and keep going.
                        let _commit = storage.store.shared_commit_lock();
                        txn.undo.commit_scope(storage)?;
                        txns.insert(txn_id, txn);
                    } else {
                        finish_commit(storage, ctx, &mut txn)?;
                    }
                }
            }
            RedoOp::TxnRollback { txn_id } => {
                max_txn_id = max_txn_id.max(txn_id);
                if let Some(mut txn) = txns.remove(&txn_id) {
                    work_done = true;
                    let has_scope = txn
                        .undo
                        .all_records(storage)?
                        .iter()
                        .any(|r| *r == UndoRecord::ScopeEnter);
                    if has_scope {
                        let records = txn.undo.pop_scope(storage)?;
                        apply_with_trash(ctx, &records, &mut txn.trash)?;
                        txns.insert(txn_id, txn);
                    } else {
                        let records = txn.undo.pop_all(storage)?;
                        apply_with_trash(ctx, &records, &mut txn.trash)?;
                        txn.undo.truncate(storage);
                        release_recovered_locks(ctx, &txn);
                    }
                }
            }
            RedoOp::DropTree { txn_id, tree_id } => {
                max_txn_id = max_txn_id.max(txn_id);
                work_done = true;
                if let Ok(tree) = ctx.resolve_tree(tree_id) {
                    let _commit = storage.store.shared_commit_lock();
                    tree.delete_all_pages()?;
                }
            }
        }
    }
    debug!("replayed {} redo ops from position {}", op_count, redo_position);

    // Step 3: resolve survivors. Their last redo record was not a commit,
    // so their effects roll back.
    for (txn_id, mut txn) in txns {
        work_done = true;
        warn!("rolling back in-flight txn {} after restart", txn_id);
        let records = txn.undo.pop_all(storage)?;
        apply_with_trash(ctx, &records, &mut txn.trash)?;
        txn.undo.truncate(storage);
        release_recovered_locks(ctx, &txn);
    }

    Ok(RecoveryOutcome {
        work_done,
        max_txn_id,
    })
}

/// One replayed mutation, mirroring the live `txn_store` path without key
/// locks or redo emission.
fn replay_store(
    storage: &Arc<Storage>,
    ctx: &Arc<TxnContext>,
    txns: &mut HashMap<TxnId, RecoveredTxn>,
    txn_id: TxnId,
    tree_id: TreeId,
    key: &[u8],
    value: Option<&[u8]>,
) -> DbResult {
    let tree = ctx.resolve_tree(tree_id)?;

    if txn_id == 0 {
        // A no-lock op: applied outright, invisible to rollback.
        let _commit = storage.store.shared_commit_lock();
        let out = match value {
            Some(v) => tree.put(key, v)?,
            None => tree.delete(key, None)?,
        };
        if let Some(LeafValue::Fragmented(desc)) = out.prior {
            fragment::delete_fragments(storage, &desc)?;
        }
        return Ok(());
    }

    let txn = txns
        .entry(txn_id)
        .or_insert_with(|| RecoveredTxn::new(txn_id));

    let prior = tree.get(key)?;
    let record = match (&value, &prior) {
        (Some(_), None) => Some(UndoRecord::InsertTombstone {
            tree_id,
            key: key.to_vec(),
        }),
        (Some(_), Some(p)) => Some(UndoRecord::UpdateImage {
            tree_id,
            key: key.to_vec(),
            prior: p.clone(),
        }),
        (None, Some(p)) if !p.is_ghost() => Some(UndoRecord::DeleteImage {
            tree_id,
            key: key.to_vec(),
            prior: p.clone(),
        }),
        (None, _) => None,
    };
    let record = match record {
        Some(r) => r,
        None => return Ok(()),
    };

    let _commit = storage.store.shared_commit_lock();
    txn.undo.push(storage, record)?;
    match value {
        Some(v) => {
            tree.put(key, v)?;
        }
        None => {
            tree.delete(key, Some(txn_id))?;
            txn.ghosts.push((tree_id, key.to_vec()));
        }
    }
    if let Some(LeafValue::Fragmented(desc)) = prior {
        txn.trash.push(desc);
    }
    Ok(())
}

fn finish_commit(
    storage: &Arc<Storage>,
    ctx: &Arc<TxnContext>,
    txn: &mut RecoveredTxn,
) -> DbResult {
    for (tree_id, key) in &txn.ghosts {
        if let Ok(tree) = ctx.resolve_tree(*tree_id) {
            let _commit = storage.store.shared_commit_lock();
            tree.remove_ghost(key, txn.undo.txn_id)?;
        }
    }
    for desc in &txn.trash {
        fragment::delete_fragments(storage, desc)?;
    }
    txn.undo.truncate(storage);
    release_recovered_locks(ctx, txn);
    Ok(())
}

/// Apply reversal records, pruning restored fragment descriptors out of the
/// trash so a later commit cannot free a value that rollback revived.
fn apply_with_trash(
    ctx: &Arc<TxnContext>,
    records: &[UndoRecord],
    trash: &mut Vec<Vec<u8>>,
) -> DbResult {
    for record in records {
        crate::transaction::apply_undo_records(ctx, std::slice::from_ref(record))?;
        match record {
            UndoRecord::UpdateImage {
                prior: LeafValue::Fragmented(desc),
                ..
            }
            | UndoRecord::DeleteImage {
                prior: LeafValue::Fragmented(desc),
                ..
            } => {
                trash.retain(|t| t != desc);
            }
            _ => {}
        }
    }
    Ok(())
}

fn release_recovered_locks(ctx: &Arc<TxnContext>, txn: &RecoveredTxn) {
    for (tree_id, key) in &txn.locked {
        ctx.locks.release(txn.undo.txn_id, *tree_id, key, None);
    }
    ctx.locks.forget_owner(txn.undo.txn_id);
}

fn record_key(record: &UndoRecord) -> Option<(TreeId, Vec<u8>)> {
    match record {
        UndoRecord::InsertTombstone { tree_id, key }
        | UndoRecord::UpdateImage { tree_id, key, .. }
        | UndoRecord::DeleteImage { tree_id, key, .. } => Some((*tree_id, key.clone())),
        UndoRecord::ScopeEnter => None,
    }
}
