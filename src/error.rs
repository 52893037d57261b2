use std::time::Duration;

use log::error;
use thiserror::Error;

use crate::types::TxnId;

/// Everything that can go wrong inside the engine.
///
/// Corruption and I/O errors unwind to the calling operation with all latches
/// released; they are never swallowed. Lock failures are recoverable and leave
/// the transaction in a state where `reset` is safe.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("corruption: {0}")]
    Corruption(String),

    /// A redo segment ended mid-record or with a bad terminator. Recovery
    /// treats this as the torn tail of the log, not as corruption.
    #[error("truncated redo tail in segment {log_id} at offset {offset}")]
    TruncatedTail { log_id: u64, offset: u64 },

    #[error("database is closed")]
    Closed(Option<String>),

    #[error("database is unmodifiable")]
    Unmodifiable,

    #[error("node cache exhausted")]
    CacheExhausted,

    #[error("lock acquisition timed out after {0:?}")]
    LockTimeout(Duration),

    #[error("deadlock detected, participants: {participants:?}, keys: {keys:?}")]
    Deadlock {
        participants: Vec<TxnId>,
        keys: Vec<String>,
    },

    #[error("illegal lock upgrade")]
    IllegalUpgrade,

    #[error("value length {len} exceeds the addressable range for this call")]
    LargeValue { len: u64 },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("io failure while {context}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl DbError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        DbError::Io { context, source }
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        DbError::Corruption(msg.into())
    }

    /// Log the error together with the current backtrace. Used by tests and
    /// by callers that are about to panic anyway.
    pub fn show_backtrace(&self) {
        error!("{}\n{:?}", self, backtrace::Backtrace::new());
    }

    /// True for errors that poison the whole database (any further operation
    /// must fail fast), as opposed to per-operation failures.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::Corruption(_) | DbError::Io { .. })
    }
}
