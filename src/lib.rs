pub mod btree;
pub mod config;
pub mod database;
pub mod error;
pub mod redo;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod utils;

mod checkpoint;
mod recovery;

pub use config::{DurabilityMode, LockUpgradeRule, Options};
pub use database::{Database, Tree};
pub use error::DbError;
pub use transaction::{LockMode, Transaction};
pub use types::{DbResult, PageId, TreeId, TxnId};
