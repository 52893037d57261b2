use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::DbError;
use crate::redo::{next_terminator, op, REDO_ENCODING_VERSION, REDO_MAGIC, SEGMENT_HEADER_LEN};
use crate::types::{TreeId, TxnId};
use crate::utils::ByteReader;

/// A decoded logical operation, paired during replay with the logical
/// position of its terminator's end.
#[derive(Debug, Clone, PartialEq)]
pub enum RedoOp {
    Timestamp { millis: u64 },
    Shutdown,
    EndFile,
    TxnEnter { txn_id: TxnId },
    TxnRollback { txn_id: TxnId },
    TxnCommit { txn_id: TxnId },
    Store {
        txn_id: TxnId,
        tree_id: TreeId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        txn_id: TxnId,
        tree_id: TreeId,
        key: Vec<u8>,
    },
    DropTree { txn_id: TxnId, tree_id: TreeId },
}

struct SegmentData {
    log_id: u64,
    base_pos: u64,
    seed: u32,
    body: Vec<u8>,
}

/// Replay driver over the redo segment files of a database.
pub struct RedoReader {
    segments: Vec<SegmentData>,
}

impl RedoReader {
    /// Find and load every `<base>.redo.<N>` in log-id order.
    pub fn open_all(base: &Path) -> Result<Self, DbError> {
        let mut paths: Vec<(u64, PathBuf)> = Vec::new();
        let dir = match base.parent() {
            Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let prefix = format!(
            "{}.redo.",
            base.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
        );
        let entries = fs::read_dir(&dir).map_err(|e| DbError::io("listing redo segments", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| DbError::io("listing redo segments", e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id_str) = name.strip_prefix(&prefix) {
                if let Ok(id) = id_str.parse::<u64>() {
                    paths.push((id, entry.path()));
                }
            }
        }
        paths.sort_by_key(|(id, _)| *id);

        let mut segments = Vec::with_capacity(paths.len());
        for (_, path) in paths {
            match Self::load_segment(&path) {
                Ok(segment) => segments.push(segment),
                Err(e) => {
                    // An unreadable segment header means its content never
                    // became durable; skip it like a torn tail.
                    warn!("skipping unreadable redo segment {:?}: {}", path, e);
                }
            }
        }
        Ok(Self { segments })
    }

    fn load_segment(path: &Path) -> Result<SegmentData, DbError> {
        let data = fs::read(path).map_err(|e| DbError::io("reading a redo segment", e))?;
        if data.len() < SEGMENT_HEADER_LEN {
            return Err(DbError::corrupt("redo segment shorter than its header"));
        }
        let mut r = ByteReader::new(&data);
        let magic = r.read_u64()?;
        if magic != REDO_MAGIC {
            return Err(DbError::corrupt(format!(
                "bad redo magic: {:#018x}",
                magic
            )));
        }
        let version = r.read_u32()?;
        if version != REDO_ENCODING_VERSION {
            return Err(DbError::corrupt(format!(
                "unsupported redo encoding version {}",
                version
            )));
        }
        let log_id = r.read_u64()?;
        let seed = r.read_u32()?;
        let base_pos = r.read_u64()?;
        Ok(SegmentData {
            log_id,
            base_pos,
            seed,
            body: data[SEGMENT_HEADER_LEN..].to_vec(),
        })
    }

    /// Decode every op whose end position lies strictly above `from_pos`,
    /// across all segments in order. Terminator mismatches and mid-record
    /// ends are treated as the torn tail of that segment: its remainder is
    /// dropped and replay continues with the next segment.
    pub fn read_from(&mut self, from_pos: u64) -> Result<Vec<(RedoOp, u64)>, DbError> {
        let mut out = Vec::new();
        for segment in &self.segments {
            match Self::read_segment(segment, from_pos, &mut out) {
                Ok(()) => {}
                Err(DbError::TruncatedTail { log_id, offset }) => {
                    debug!(
                        "segment {} has a torn tail at offset {}; continuing",
                        log_id, offset
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn read_segment(
        segment: &SegmentData,
        from_pos: u64,
        out: &mut Vec<(RedoOp, u64)>,
    ) -> Result<(), DbError> {
        let mut term_state = segment.seed;
        let mut r = ByteReader::new(&segment.body);
        let mut pos = segment.base_pos;

        loop {
            if r.remaining() == 0 {
                return Ok(());
            }
            let start = r.position();
            let torn = |offset: usize| DbError::TruncatedTail {
                log_id: segment.log_id,
                offset: offset as u64,
            };
            let op = match Self::decode_op(&mut r) {
                Ok(op) => op,
                Err(_) => return Err(torn(start)),
            };
            let expected = next_terminator(&mut term_state);
            let stored = match r.read_u32() {
                Ok(v) => v,
                Err(_) => return Err(torn(start)),
            };
            if stored != expected {
                return Err(torn(start));
            }
            pos += (r.position() - start) as u64;

            match op {
                RedoOp::EndFile | RedoOp::Shutdown => {
                    // Clean end of this segment's logical content.
                    if pos > from_pos {
                        out.push((op, pos));
                    }
                    return Ok(());
                }
                _ => {
                    if pos > from_pos {
                        out.push((op, pos));
                    }
                }
            }
        }
    }

    fn decode_op(r: &mut ByteReader<'_>) -> Result<RedoOp, DbError> {
        let opcode = r.read_u8()?;
        let op = match opcode {
            op::TIMESTAMP => RedoOp::Timestamp {
                millis: r.read_u64()?,
            },
            op::SHUTDOWN => RedoOp::Shutdown,
            op::END_FILE => RedoOp::EndFile,
            op::TXN_ENTER => RedoOp::TxnEnter {
                txn_id: r.read_u64()?,
            },
            op::TXN_ROLLBACK => RedoOp::TxnRollback {
                txn_id: r.read_u64()?,
            },
            op::TXN_COMMIT => RedoOp::TxnCommit {
                txn_id: r.read_u64()?,
            },
            op::STORE | op::STORE_NO_LOCK => RedoOp::Store {
                txn_id: r.read_u64()?,
                tree_id: r.read_u64()?,
                key: r.read_bytes_u16()?.to_vec(),
                value: r.read_bytes_u32()?.to_vec(),
            },
            op::DELETE | op::DELETE_NO_LOCK => RedoOp::Delete {
                txn_id: r.read_u64()?,
                tree_id: r.read_u64()?,
                key: r.read_bytes_u16()?.to_vec(),
            },
            op::DROP_TREE => RedoOp::DropTree {
                txn_id: r.read_u64()?,
                tree_id: r.read_u64()?,
            },
            other => {
                return Err(DbError::corrupt(format!(
                    "unknown redo opcode {}",
                    other
                )))
            }
        };
        Ok(op)
    }

    /// The highest log id present on disk, for the writer's next segment.
    pub fn max_log_id(&self) -> u64 {
        self.segments.iter().map(|s| s.log_id).max().unwrap_or(0)
    }

    /// The logical end position of everything replayable.
    pub fn end_position(&mut self) -> Result<u64, DbError> {
        let ops = self.read_from(0)?;
        Ok(ops.last().map(|(_, pos)| *pos).unwrap_or_else(|| {
            self.segments.last().map(|s| s.base_pos).unwrap_or(0)
        }))
    }
}
