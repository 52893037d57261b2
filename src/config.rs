use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::DbError;

pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 65536;
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// How much of a commit must reach stable storage before the commit call
/// returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Redo is flushed and fsynced.
    Sync,
    /// Redo is flushed to the OS but not fsynced.
    NoSync,
    /// Redo stays in the writer's buffer.
    NoFlush,
    /// No redo is emitted at all.
    NoRedo,
}

/// What happens when a transaction holding a shared lock asks for the
/// exclusive one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockUpgradeRule {
    /// Upgrades from shared are refused; start from upgradable instead.
    Strict,
    /// Upgrades are allowed when the requester is the only shared holder.
    Lenient,
    /// Upgrades always enter the exclusive wait queue. May deadlock.
    Unchecked,
}

/// Hook for transparent encryption of pages and redo segments. The engine
/// never interprets the transformed bytes; the provider must be
/// length-preserving.
pub trait CryptoProvider: Send + Sync {
    fn encrypt(&self, log_id: u64, buf: &mut [u8]);
    fn decrypt(&self, log_id: u64, buf: &mut [u8]);
}

/// Everything configurable about a database, validated at open.
#[derive(Clone)]
pub struct Options {
    /// Base path; the page file lives at `<base>`, redo segments at
    /// `<base>.redo.<N>`, the lock file at `<base>.lock`, and the
    /// configuration snapshot at `<base>.info`.
    pub base_file_path: PathBuf,

    pub page_size: usize,

    pub min_cached_bytes: usize,
    pub max_cached_bytes: usize,

    pub durability_mode: DurabilityMode,

    /// Default wait for key locks.
    pub lock_timeout: Duration,

    pub lock_upgrade_rule: LockUpgradeRule,

    /// Period of the background checkpoint timer. Zero disables the timer.
    pub checkpoint_rate: Duration,

    /// Checkpoint when this many redo bytes accumulated since the last one.
    pub checkpoint_size_threshold: u64,

    /// Skip a timed checkpoint when the last one completed more recently
    /// than this.
    pub checkpoint_delay_threshold: Duration,

    pub read_only: bool,

    /// Create missing parent directories of the base path.
    pub mkdirs: bool,

    pub crypto: Option<Arc<dyn CryptoProvider>>,
}

impl Options {
    pub fn new<P: Into<PathBuf>>(base_file_path: P) -> Self {
        Self {
            base_file_path: base_file_path.into(),
            page_size: DEFAULT_PAGE_SIZE,
            min_cached_bytes: 1 << 20,
            max_cached_bytes: 64 << 20,
            durability_mode: DurabilityMode::Sync,
            lock_timeout: Duration::from_secs(3),
            lock_upgrade_rule: LockUpgradeRule::Strict,
            checkpoint_rate: Duration::from_secs(1),
            checkpoint_size_threshold: 32 << 20,
            checkpoint_delay_threshold: Duration::from_millis(250),
            read_only: false,
            crypto: None,
            mkdirs: true,
        }
    }

    pub fn page_size(mut self, v: usize) -> Self {
        self.page_size = v;
        self
    }

    pub fn cache_bytes(mut self, min: usize, max: usize) -> Self {
        self.min_cached_bytes = min;
        self.max_cached_bytes = max;
        self
    }

    pub fn durability_mode(mut self, v: DurabilityMode) -> Self {
        self.durability_mode = v;
        self
    }

    pub fn lock_timeout(mut self, v: Duration) -> Self {
        self.lock_timeout = v;
        self
    }

    pub fn lock_upgrade_rule(mut self, v: LockUpgradeRule) -> Self {
        self.lock_upgrade_rule = v;
        self
    }

    pub fn checkpoint_rate(mut self, v: Duration) -> Self {
        self.checkpoint_rate = v;
        self
    }

    pub fn read_only(mut self, v: bool) -> Self {
        self.read_only = v;
        self
    }

    pub fn validate(&self) -> Result<(), DbError> {
        if self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
            || !self.page_size.is_power_of_two()
        {
            return Err(DbError::Config(format!(
                "page size must be a power of two in {}..={}, got {}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE, self.page_size
            )));
        }
        if self.max_cached_bytes < self.min_cached_bytes {
            return Err(DbError::Config(format!(
                "max cached bytes ({}) below min cached bytes ({})",
                self.max_cached_bytes, self.min_cached_bytes
            )));
        }
        if self.max_cached_bytes < self.page_size * 8 {
            return Err(DbError::Config(format!(
                "cache too small: need at least {} bytes for page size {}",
                self.page_size * 8,
                self.page_size
            )));
        }
        if self.base_file_path.as_os_str().is_empty() {
            return Err(DbError::Config("base file path is empty".to_string()));
        }
        Ok(())
    }

    /// Derived node-cache bounds, in nodes.
    pub fn min_cached_nodes(&self) -> usize {
        (self.min_cached_bytes / self.page_size).max(8)
    }

    pub fn max_cached_nodes(&self) -> usize {
        (self.max_cached_bytes / self.page_size).max(self.min_cached_nodes())
    }

    /// Human-readable snapshot written to `<base>.info` at open.
    pub fn info_string(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("baseFilePath = {}\n", self.base_file_path.display()));
        out.push_str(&format!("pageSize = {}\n", self.page_size));
        out.push_str(&format!("minCachedBytes = {}\n", self.min_cached_bytes));
        out.push_str(&format!("maxCachedBytes = {}\n", self.max_cached_bytes));
        out.push_str(&format!("durabilityMode = {:?}\n", self.durability_mode));
        out.push_str(&format!("lockTimeoutNanos = {}\n", self.lock_timeout.as_nanos()));
        out.push_str(&format!("lockUpgradeRule = {:?}\n", self.lock_upgrade_rule));
        out.push_str(&format!(
            "checkpointRateNanos = {}\n",
            self.checkpoint_rate.as_nanos()
        ));
        out.push_str(&format!(
            "checkpointSizeThreshold = {}\n",
            self.checkpoint_size_threshold
        ));
        out.push_str(&format!(
            "checkpointDelayThresholdNanos = {}\n",
            self.checkpoint_delay_threshold.as_nanos()
        ));
        out.push_str(&format!("readOnly = {}\n", self.read_only));
        out.push_str(&format!("crypto = {}\n", self.crypto.is_some()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        assert!(Options::new("/tmp/aspen-test-db").validate().is_ok());
    }

    #[test]
    fn test_bad_page_sizes_rejected() {
        for bad in &[0usize, 256, 511, 1000, 1 << 17] {
            let opts = Options::new("/tmp/x").page_size(*bad);
            assert!(opts.validate().is_err(), "page size {} should fail", bad);
        }
    }

    #[test]
    fn test_cache_bounds_rejected() {
        let opts = Options::new("/tmp/x").cache_bytes(1 << 20, 1 << 16);
        assert!(opts.validate().is_err());
    }
}
