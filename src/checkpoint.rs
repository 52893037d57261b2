use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::btree::BTree;
use crate::error::DbError;
use crate::redo::RedoWriter;
use crate::storage::{CommitExtra, Storage};
use crate::transaction::undo_log;
use crate::transaction::TxnContext;
use crate::types::DbResult;

/// Serializes checkpoints and remembers when the last one finished.
pub(crate) struct CheckpointState {
    inner: Mutex<Instant>,
}

impl CheckpointState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Instant::now()),
        }
    }

    pub fn since_last(&self) -> Duration {
        self.inner.lock().unwrap().elapsed()
    }
}

/// Run one checkpoint. `force` skips the nothing-to-do shortcut (recovery
/// and close use it).
///
/// The protocol: prepare the next redo segment outside any lock, take the
/// exclusive commit lock with backing-off tries, flip the commit color and
/// capture the redo position, release, build the master undo log, flush the
/// frozen color, and commit the new header. Only the color flip happens
/// under the exclusive lock; writers resume while the flush runs, dirtying
/// into the other color.
pub(crate) fn run_checkpoint(
    state: &CheckpointState,
    storage: &Arc<Storage>,
    redo: &Arc<RedoWriter>,
    ctx: &Arc<TxnContext>,
    registry: &Arc<BTree>,
    force: bool,
) -> DbResult {
    let mut last = state.inner.lock().unwrap();

    if !force && !storage.alloc.has_dirty() && redo.bytes_since_checkpoint() == 0 {
        return redo.sync();
    }

    // Step 1: the next segment, created while writers are still running.
    redo.checkpoint_prepare()?;

    // Step 2: quiesce. Mutators hold the commit lock shared for whole
    // operations; exponential backoff keeps the checkpoint from starving
    // behind a stream of them without parking in the writer queue forever.
    let old_extra = storage.store.read_commit_extra();
    let (frozen_color, redo_pos, redo_txn_id, registry_root, txn_counter) = {
        let mut delay = Duration::from_micros(100);
        let _exclusive = loop {
            match storage.store.try_exclusive_commit_lock() {
                Some(guard) => break guard,
                None => {
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_millis(100));
                }
            }
        };
        let frozen = storage.alloc.begin_checkpoint();
        let (pos, txn) = match redo.checkpoint_switch() {
            Ok(v) => v,
            Err(e) => {
                storage.alloc.abort_checkpoint();
                return Err(e);
            }
        };
        (
            frozen,
            pos,
            txn,
            registry.root_id(),
            ctx.current_txn_counter(),
        )
    };
    debug!(
        "checkpoint: frozen color {}, redo position {}, registry root {}",
        frozen_color, redo_pos, registry_root
    );

    // Step 3: master undo log. Every live transaction's reversal chain is
    // forced onto pages so recovery can find it.
    let result = (|| -> Result<u64, DbError> {
        let mut entries = Vec::new();
        for (txn_id, undo) in ctx.active_undo_snapshot() {
            let head = {
                let _commit = storage.store.shared_commit_lock();
                undo.lock().unwrap().spill(storage)?
            };
            if head != 0 {
                entries.push((txn_id, head));
            }
        }
        let master = undo_log::write_master_undo(storage, &entries)?;

        // Step 4: flush the frozen color and swap the header.
        storage.flush_dirty_nodes(frozen_color)?;
        storage.store.commit(CommitExtra {
            encoding_version: 1,
            root_page_id: registry_root,
            master_undo_page_id: master,
            transaction_id: txn_counter,
            redo_position: redo_pos,
            redo_txn_id,
        })?;

        // The header now references these chains; they must not recycle.
        let mut durable_pages = Vec::new();
        if master != 0 {
            undo_log::chain_pages(storage, master, &mut durable_pages)?;
        }
        for (_, head) in &entries {
            undo_log::chain_pages(storage, *head, &mut durable_pages)?;
        }
        for id in durable_pages {
            storage.alloc.mark_durable(id);
        }
        Ok(master)
    })();

    match result {
        Ok(master) => {
            // Step 5: retire the previous checkpoint's artifacts.
            if old_extra.master_undo_page_id != 0 && old_extra.master_undo_page_id != master {
                undo_log::free_master_undo(storage, old_extra.master_undo_page_id);
            }
            storage.alloc.end_checkpoint();
            redo.checkpointed(redo_pos)?;
            *last = Instant::now();
            info!(
                "checkpoint complete at redo position {}, txn counter {}",
                redo_pos, txn_counter
            );
            Ok(())
        }
        Err(e) => {
            // The flip happened but the header did not move; everything
            // dirtied under the frozen color folds back into the current
            // one and the next checkpoint retries.
            warn!("checkpoint aborted: {}", e);
            storage.alloc.abort_checkpoint();
            Err(e)
        }
    }
}
