use log::{debug, trace};

use crate::btree::node::{LeafValue, TAG_UNDO};
use crate::error::DbError;
use crate::storage::Storage;
use crate::types::{DbResult, PageId, TreeId, TxnId};
use crate::utils::{ByteReader, ByteWriter, Decodeable, Encodeable};

const REC_INSERT_TOMBSTONE: u8 = 1;
const REC_UPDATE_IMAGE: u8 = 2;
const REC_DELETE_IMAGE: u8 = 3;
const REC_SCOPE_ENTER: u8 = 4;

const PRIOR_INLINE: u8 = 0;
const PRIOR_FRAGMENTED: u8 = 1;
const PRIOR_GHOST: u8 = 2;

/// One reversal step. Replayed newest-first against the current tree state,
/// without redo emission.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoRecord {
    /// The operation inserted a fresh key; rollback deletes it.
    InsertTombstone { tree_id: TreeId, key: Vec<u8> },
    /// The operation replaced a value in place; rollback restores it.
    UpdateImage {
        tree_id: TreeId,
        key: Vec<u8>,
        prior: LeafValue,
    },
    /// The operation deleted (ghosted) the key; rollback restores the value.
    DeleteImage {
        tree_id: TreeId,
        key: Vec<u8>,
        prior: LeafValue,
    },
    /// Nested scope boundary.
    ScopeEnter,
}

impl Encodeable for UndoRecord {
    fn encode(&self, w: &mut ByteWriter) {
        match self {
            UndoRecord::InsertTombstone { tree_id, key } => {
                w.write_u8(REC_INSERT_TOMBSTONE);
                w.write_u64(*tree_id);
                w.write_bytes_u16(key);
            }
            UndoRecord::UpdateImage {
                tree_id,
                key,
                prior,
            } => {
                w.write_u8(REC_UPDATE_IMAGE);
                w.write_u64(*tree_id);
                w.write_bytes_u16(key);
                encode_prior(w, prior);
            }
            UndoRecord::DeleteImage {
                tree_id,
                key,
                prior,
            } => {
                w.write_u8(REC_DELETE_IMAGE);
                w.write_u64(*tree_id);
                w.write_bytes_u16(key);
                encode_prior(w, prior);
            }
            UndoRecord::ScopeEnter => {
                w.write_u8(REC_SCOPE_ENTER);
            }
        }
    }
}

impl Decodeable for UndoRecord {
    fn decode(r: &mut ByteReader<'_>) -> Result<Self, DbError> {
        let tag = r.read_u8()?;
        Ok(match tag {
            REC_INSERT_TOMBSTONE => UndoRecord::InsertTombstone {
                tree_id: r.read_u64()?,
                key: r.read_bytes_u16()?.to_vec(),
            },
            REC_UPDATE_IMAGE => UndoRecord::UpdateImage {
                tree_id: r.read_u64()?,
                key: r.read_bytes_u16()?.to_vec(),
                prior: decode_prior(r)?,
            },
            REC_DELETE_IMAGE => UndoRecord::DeleteImage {
                tree_id: r.read_u64()?,
                key: r.read_bytes_u16()?.to_vec(),
                prior: decode_prior(r)?,
            },
            REC_SCOPE_ENTER => UndoRecord::ScopeEnter,
            other => {
                return Err(DbError::corrupt(format!(
                    "unknown undo record type {}",
                    other
                )))
            }
        })
    }
}

impl UndoRecord {
    fn encoded_len(&self) -> usize {
        let mut w = ByteWriter::new();
        self.encode(&mut w);
        w.len()
    }
}

fn encode_prior(w: &mut ByteWriter, prior: &LeafValue) {
    match prior {
        LeafValue::Inline(v) => {
            w.write_u8(PRIOR_INLINE);
            w.write_bytes_u32(v);
        }
        LeafValue::Fragmented(d) => {
            w.write_u8(PRIOR_FRAGMENTED);
            w.write_bytes_u16(d);
        }
        LeafValue::Ghost { txn_id } => {
            w.write_u8(PRIOR_GHOST);
            w.write_u64(*txn_id);
        }
    }
}

fn decode_prior(r: &mut ByteReader<'_>) -> Result<LeafValue, DbError> {
    Ok(match r.read_u8()? {
        PRIOR_INLINE => LeafValue::Inline(r.read_bytes_u32()?.to_vec()),
        PRIOR_FRAGMENTED => LeafValue::Fragmented(r.read_bytes_u16()?.to_vec()),
        PRIOR_GHOST => LeafValue::Ghost {
            txn_id: r.read_u64()?,
        },
        other => return Err(DbError::corrupt(format!("unknown prior tag {}", other))),
    })
}

// Spill page: tag(1) next(8) used(2) payload. The chain head holds the
// newest records; payload within a page runs oldest to newest.
const SPILL_HEADER_LEN: usize = 1 + 8 + 2;

/// Per-transaction reversal log. Records accumulate in memory and spill to a
/// chain of dedicated pages when they outgrow the buffer; the checkpoint
/// forces a full spill so the master undo log can reference the chain.
pub struct UndoLog {
    pub txn_id: TxnId,
    records: Vec<UndoRecord>,
    mem_bytes: usize,
    spill_head: PageId,
}

impl UndoLog {
    pub fn new(txn_id: TxnId) -> Self {
        Self {
            txn_id,
            records: Vec::new(),
            mem_bytes: 0,
            spill_head: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.spill_head == 0
    }

    pub fn spill_head(&self) -> PageId {
        self.spill_head
    }

    /// Append a record. Callers hold the shared commit lock, so a checkpoint
    /// never observes a half-written chain.
    pub fn push(&mut self, storage: &Storage, record: UndoRecord) -> DbResult {
        self.mem_bytes += record.encoded_len();
        self.records.push(record);
        if self.mem_bytes > storage.page_size() {
            self.spill(storage)?;
        }
        Ok(())
    }

    /// Move every buffered record onto the page chain and return its head.
    pub fn spill(&mut self, storage: &Storage) -> Result<PageId, DbError> {
        if self.records.is_empty() {
            return Ok(self.spill_head);
        }
        let capacity = storage.page_size() - SPILL_HEADER_LEN;

        // Pack oldest-first into pages, then chain newest page first.
        let mut pages: Vec<Vec<UndoRecord>> = vec![Vec::new()];
        let mut used = 0usize;
        for rec in self.records.drain(..) {
            let len = rec.encoded_len();
            if used + len > capacity {
                pages.push(Vec::new());
                used = 0;
            }
            used += len;
            pages.last_mut().unwrap().push(rec);
        }

        let mut next = self.spill_head;
        for group in pages {
            let id = storage.alloc.alloc_page()?;
            let mut w = ByteWriter::with_capacity(storage.page_size());
            w.write_u8(TAG_UNDO);
            w.write_u64(next);
            let mut body = ByteWriter::new();
            for rec in &group {
                rec.encode(&mut body);
            }
            w.write_u16(body.len() as u16);
            w.write_raw(body.as_slice());
            storage
                .store
                .write_page(id, &w.into_padded_vec(storage.page_size()))?;
            next = id;
        }
        self.spill_head = next;
        self.mem_bytes = 0;
        trace!("undo log for txn {} spilled, head {}", self.txn_id, next);
        Ok(self.spill_head)
    }

    /// Pull every spilled record back into memory (scope manipulation needs
    /// random access to the tail). The chain pages are released.
    fn unspill(&mut self, storage: &Storage) -> DbResult {
        if self.spill_head == 0 {
            return Ok(());
        }
        let mut spilled = read_chain(storage, self.spill_head)?;
        free_chain(storage, self.spill_head);
        self.spill_head = 0;
        spilled.append(&mut self.records);
        self.mem_bytes = spilled.iter().map(UndoRecord::encoded_len).sum();
        self.records = spilled;
        Ok(())
    }

    /// All records, oldest first.
    pub fn all_records(&self, storage: &Storage) -> Result<Vec<UndoRecord>, DbError> {
        let mut out = if self.spill_head != 0 {
            read_chain(storage, self.spill_head)?
        } else {
            Vec::new()
        };
        out.extend(self.records.iter().cloned());
        Ok(out)
    }

    pub fn enter_scope(&mut self, storage: &Storage) -> DbResult {
        self.push(storage, UndoRecord::ScopeEnter)
    }

    /// Commit of a nested scope: its records merge into the parent scope.
    pub fn commit_scope(&mut self, storage: &Storage) -> DbResult {
        self.unspill(storage)?;
        if let Some(pos) = self
            .records
            .iter()
            .rposition(|r| *r == UndoRecord::ScopeEnter)
        {
            self.records.remove(pos);
            self.mem_bytes -= UndoRecord::ScopeEnter.encoded_len();
        }
        Ok(())
    }

    /// Remove and return the records of the innermost scope, newest first,
    /// for replay. The scope marker is consumed too.
    pub fn pop_scope(&mut self, storage: &Storage) -> Result<Vec<UndoRecord>, DbError> {
        self.unspill(storage)?;
        let from = match self
            .records
            .iter()
            .rposition(|r| *r == UndoRecord::ScopeEnter)
        {
            Some(pos) => pos,
            None => 0,
        };
        let mut tail: Vec<UndoRecord> = self.records.split_off(from);
        if tail.first() == Some(&UndoRecord::ScopeEnter) {
            tail.remove(0);
        }
        self.mem_bytes = self.records.iter().map(UndoRecord::encoded_len).sum();
        tail.reverse();
        Ok(tail)
    }

    /// Remove and return everything, newest first, for a full rollback.
    pub fn pop_all(&mut self, storage: &Storage) -> Result<Vec<UndoRecord>, DbError> {
        self.unspill(storage)?;
        let mut all: Vec<UndoRecord> = self.records.split_off(0);
        self.mem_bytes = 0;
        all.retain(|r| *r != UndoRecord::ScopeEnter);
        all.reverse();
        Ok(all)
    }

    /// Terminal commit: the log is no longer needed.
    pub fn truncate(&mut self, storage: &Storage) {
        if self.spill_head != 0 {
            free_chain(storage, self.spill_head);
            self.spill_head = 0;
        }
        self.records.clear();
        self.mem_bytes = 0;
    }
}

fn read_chain(storage: &Storage, head: PageId) -> Result<Vec<UndoRecord>, DbError> {
    let mut page_payloads = Vec::new();
    let mut id = head;
    while id != 0 {
        let mut buf = vec![0u8; storage.page_size()];
        storage.store.read_page(id, &mut buf)?;
        let mut r = ByteReader::new(&buf);
        let tag = r.read_u8()?;
        if tag != TAG_UNDO {
            return Err(DbError::corrupt(format!(
                "page {} in undo chain has tag {}",
                id, tag
            )));
        }
        let next = r.read_u64()?;
        let used = r.read_u16()? as usize;
        page_payloads.push(r.read_raw(used)?.to_vec());
        id = next;
    }
    // Chain runs newest page first; records inside a page run oldest first.
    let mut out = Vec::new();
    for payload in page_payloads.into_iter().rev() {
        let mut r = ByteReader::new(&payload);
        while r.remaining() > 0 {
            out.push(UndoRecord::decode(&mut r)?);
        }
    }
    Ok(out)
}

fn free_chain(storage: &Storage, head: PageId) {
    let mut id = head;
    while id != 0 {
        let mut buf = vec![0u8; storage.page_size()];
        if storage.store.read_page(id, &mut buf).is_err() {
            return;
        }
        let next = {
            let mut r = ByteReader::new(&buf);
            let _ = r.read_u8();
            r.read_u64().unwrap_or(0)
        };
        storage.alloc.delete_page(id);
        id = next;
    }
}

/// Collect the page ids of an undo chain, for the reachability sweep.
pub fn chain_pages(storage: &Storage, head: PageId, out: &mut Vec<PageId>) -> DbResult {
    let mut id = head;
    while id != 0 {
        out.push(id);
        let mut buf = vec![0u8; storage.page_size()];
        storage.store.read_page(id, &mut buf)?;
        let mut r = ByteReader::new(&buf);
        let _ = r.read_u8()?;
        id = r.read_u64()?;
    }
    Ok(())
}

/// Write the master undo log: one chain enumerating every live transaction's
/// undo head, referenced from the checkpoint header.
pub fn write_master_undo(
    storage: &Storage,
    entries: &[(TxnId, PageId)],
) -> Result<PageId, DbError> {
    if entries.is_empty() {
        return Ok(0);
    }
    let capacity = (storage.page_size() - SPILL_HEADER_LEN) / 16;
    let mut next = 0u64;
    for group in entries.chunks(capacity.max(1)) {
        let id = storage.alloc.alloc_page()?;
        let mut w = ByteWriter::with_capacity(storage.page_size());
        w.write_u8(TAG_UNDO);
        w.write_u64(next);
        w.write_u16((group.len() * 16) as u16);
        for (txn_id, head) in group {
            w.write_u64(*txn_id);
            w.write_u64(*head);
        }
        storage
            .store
            .write_page(id, &w.into_padded_vec(storage.page_size()))?;
        next = id;
    }
    debug!("master undo log written for {} transactions", entries.len());
    Ok(next)
}

pub fn read_master_undo(storage: &Storage, head: PageId) -> Result<Vec<(TxnId, PageId)>, DbError> {
    let mut out = Vec::new();
    let mut id = head;
    while id != 0 {
        let mut buf = vec![0u8; storage.page_size()];
        storage.store.read_page(id, &mut buf)?;
        let mut r = ByteReader::new(&buf);
        let tag = r.read_u8()?;
        if tag != TAG_UNDO {
            return Err(DbError::corrupt(format!(
                "master undo page {} has tag {}",
                id, tag
            )));
        }
        let next = r.read_u64()?;
        let used = r.read_u16()? as usize;
        let mut body = ByteReader::new(r.read_raw(used)?);
        while body.remaining() >= 16 {
            let txn_id = body.read_u64()?;
            let chain = body.read_u64()?;
            out.push((txn_id, chain));
        }
        id = next;
    }
    Ok(out)
}

/// Free the master undo chain after its checkpoint retires.
pub fn free_master_undo(storage: &Storage, head: PageId) {
    free_chain(storage, head);
}

/// Rebuild every live undo log from the master chain.
pub fn recover_master_undo_log(
    storage: &Storage,
    head: PageId,
) -> Result<Vec<UndoLog>, DbError> {
    let mut out = Vec::new();
    for (txn_id, chain) in read_master_undo(storage, head)? {
        let mut log = UndoLog::new(txn_id);
        log.spill_head = chain;
        out.push(log);
    }
    Ok(out)
}
