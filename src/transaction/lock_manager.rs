use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::LockUpgradeRule;
use crate::error::DbError;
use crate::types::{TreeId, TxnId};

use super::wait_for_graph::WaitForGraph;

const SHARD_COUNT: usize = 16;

/// Lock modes over logical keys, ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    Shared,
    Upgradable,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    Acquired,
    /// The owner held a weaker mode on this key and now holds the stronger
    /// one.
    Upgraded,
    OwnedShared,
    OwnedUpgradable,
    OwnedExclusive,
}

pub(crate) type LockKey = (TreeId, Vec<u8>);

#[derive(Default)]
struct LockRecord {
    exclusive: Option<TxnId>,
    upgradable: Option<TxnId>,
    shared: HashSet<TxnId>,
}

impl LockRecord {
    fn is_unlocked(&self) -> bool {
        self.exclusive.is_none() && self.upgradable.is_none() && self.shared.is_empty()
    }

    fn holders(&self, excluding: TxnId) -> Vec<TxnId> {
        let mut out = Vec::new();
        if let Some(id) = self.exclusive {
            if id != excluding {
                out.push(id);
            }
        }
        if let Some(id) = self.upgradable {
            if id != excluding {
                out.push(id);
            }
        }
        for &id in &self.shared {
            if id != excluding {
                out.push(id);
            }
        }
        out
    }
}

struct LockShard {
    records: Mutex<HashMap<LockKey, LockRecord>>,
    cond: Condvar,
}

/// Per-key shared/upgradable/exclusive locks with deadlock detection.
///
/// Keys hash to one of a fixed set of shards; each shard has its own table
/// mutex and condvar. Waiters publish edges into the wait-for graph before
/// sleeping, and the requester that closes a cycle is the one that fails.
pub struct LockManager {
    shards: Vec<LockShard>,
    graph: Mutex<WaitForGraph>,
    waiting_on: Mutex<HashMap<TxnId, LockKey>>,
}

impl LockManager {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(LockShard {
                records: Mutex::new(HashMap::new()),
                cond: Condvar::new(),
            });
        }
        Self {
            shards,
            graph: Mutex::new(WaitForGraph::new()),
            waiting_on: Mutex::new(HashMap::new()),
        }
    }

    fn shard(&self, tree_id: TreeId, key: &[u8]) -> &LockShard {
        let mut buf = Vec::with_capacity(8 + key.len());
        buf.extend_from_slice(&tree_id.to_le_bytes());
        buf.extend_from_slice(key);
        let hash = xxh3_64(&buf);
        &self.shards[(hash % SHARD_COUNT as u64) as usize]
    }

    /// Block until the lock is granted, the timeout elapses, or a deadlock
    /// is detected.
    pub fn acquire(
        &self,
        owner: TxnId,
        tree_id: TreeId,
        key: &[u8],
        mode: LockMode,
        timeout: Duration,
        rule: LockUpgradeRule,
    ) -> Result<LockResult, DbError> {
        let lock_key: LockKey = (tree_id, key.to_vec());
        let shard = self.shard(tree_id, key);
        let deadline = Instant::now() + timeout;

        let mut records = shard.records.lock().unwrap();
        loop {
            let rec = records.entry(lock_key.clone()).or_default();
            match Self::try_grant(rec, owner, mode, rule)? {
                Grant::Granted(result) => {
                    self.stop_waiting(owner);
                    return Ok(result);
                }
                Grant::Blocked(holders) => {
                    {
                        let mut graph = self.graph.lock().unwrap();
                        for holder in holders {
                            graph.add_edge(owner, holder);
                        }
                        if let Some(cycle) = graph.find_cycle_from(owner) {
                            graph.remove_waiter(owner);
                            drop(graph);
                            let err = self.deadlock_error(owner, &lock_key, cycle);
                            debug!("{}", err);
                            return Err(err);
                        }
                    }
                    self.waiting_on
                        .lock()
                        .unwrap()
                        .insert(owner, lock_key.clone());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                self.stop_waiting(owner);
                return Err(DbError::LockTimeout(timeout));
            }
            let (guard, _timed_out) = shard
                .cond
                .wait_timeout(records, deadline - now)
                .unwrap();
            records = guard;
        }
    }

    fn try_grant(
        rec: &mut LockRecord,
        owner: TxnId,
        mode: LockMode,
        rule: LockUpgradeRule,
    ) -> Result<Grant, DbError> {
        if rec.exclusive == Some(owner) {
            return Ok(Grant::Granted(LockResult::OwnedExclusive));
        }
        match mode {
            LockMode::Shared => {
                if rec.upgradable == Some(owner) {
                    return Ok(Grant::Granted(LockResult::OwnedUpgradable));
                }
                if rec.shared.contains(&owner) {
                    return Ok(Grant::Granted(LockResult::OwnedShared));
                }
                if rec.exclusive.is_none() {
                    rec.shared.insert(owner);
                    Ok(Grant::Granted(LockResult::Acquired))
                } else {
                    Ok(Grant::Blocked(rec.holders(owner)))
                }
            }
            LockMode::Upgradable => {
                if rec.upgradable == Some(owner) {
                    return Ok(Grant::Granted(LockResult::OwnedUpgradable));
                }
                let upgrading = rec.shared.contains(&owner);
                if upgrading && rule == LockUpgradeRule::Strict {
                    return Err(DbError::IllegalUpgrade);
                }
                if rec.exclusive.is_none() && rec.upgradable.is_none() {
                    rec.shared.remove(&owner);
                    rec.upgradable = Some(owner);
                    Ok(Grant::Granted(if upgrading {
                        LockResult::Upgraded
                    } else {
                        LockResult::Acquired
                    }))
                } else {
                    Ok(Grant::Blocked(rec.holders(owner)))
                }
            }
            LockMode::Exclusive => {
                if rec.upgradable == Some(owner) {
                    // The classic upgrade path: wait for shared holders to
                    // drain, keep upgradable ownership underneath.
                    if rec.exclusive.is_none() && rec.shared.is_empty() {
                        rec.exclusive = Some(owner);
                        return Ok(Grant::Granted(LockResult::Upgraded));
                    }
                    return Ok(Grant::Blocked(rec.holders(owner)));
                }
                if rec.shared.contains(&owner) {
                    match rule {
                        LockUpgradeRule::Strict => return Err(DbError::IllegalUpgrade),
                        LockUpgradeRule::Lenient => {
                            if rec.shared.len() == 1
                                && rec.exclusive.is_none()
                                && rec.upgradable.is_none()
                            {
                                rec.shared.remove(&owner);
                                rec.exclusive = Some(owner);
                                return Ok(Grant::Granted(LockResult::Upgraded));
                            }
                            return Err(DbError::IllegalUpgrade);
                        }
                        LockUpgradeRule::Unchecked => {
                            if rec.shared.len() == 1
                                && rec.exclusive.is_none()
                                && rec.upgradable.is_none()
                            {
                                rec.shared.remove(&owner);
                                rec.exclusive = Some(owner);
                                return Ok(Grant::Granted(LockResult::Upgraded));
                            }
                            return Ok(Grant::Blocked(rec.holders(owner)));
                        }
                    }
                }
                if rec.is_unlocked() {
                    rec.exclusive = Some(owner);
                    Ok(Grant::Granted(LockResult::Acquired))
                } else {
                    Ok(Grant::Blocked(rec.holders(owner)))
                }
            }
        }
    }

    fn stop_waiting(&self, owner: TxnId) {
        self.graph.lock().unwrap().remove_waiter(owner);
        self.waiting_on.lock().unwrap().remove(&owner);
    }

    fn deadlock_error(&self, owner: TxnId, key: &LockKey, cycle: Vec<TxnId>) -> DbError {
        let waiting = self.waiting_on.lock().unwrap();
        let mut keys: Vec<String> = Vec::new();
        keys.push(render_key(key));
        for member in &cycle {
            if *member == owner {
                continue;
            }
            if let Some(k) = waiting.get(member) {
                let rendered = render_key(k);
                if !keys.contains(&rendered) {
                    keys.push(rendered);
                }
            }
        }
        DbError::Deadlock {
            participants: cycle,
            keys,
        }
    }

    /// Release a lock, or downgrade it when `downgrade_to` is given.
    pub fn release(
        &self,
        owner: TxnId,
        tree_id: TreeId,
        key: &[u8],
        downgrade_to: Option<LockMode>,
    ) {
        let lock_key: LockKey = (tree_id, key.to_vec());
        let shard = self.shard(tree_id, key);
        let mut records = shard.records.lock().unwrap();
        if let Some(rec) = records.get_mut(&lock_key) {
            match downgrade_to {
                None => {
                    if rec.exclusive == Some(owner) {
                        rec.exclusive = None;
                    }
                    if rec.upgradable == Some(owner) {
                        rec.upgradable = None;
                    }
                    rec.shared.remove(&owner);
                }
                Some(LockMode::Shared) => {
                    if rec.exclusive == Some(owner) {
                        rec.exclusive = None;
                    }
                    if rec.upgradable == Some(owner) {
                        rec.upgradable = None;
                    }
                    rec.shared.insert(owner);
                }
                Some(LockMode::Upgradable) => {
                    if rec.exclusive == Some(owner) {
                        rec.exclusive = None;
                    }
                    rec.upgradable = Some(owner);
                }
                Some(LockMode::Exclusive) => {}
            }
            if rec.is_unlocked() {
                records.remove(&lock_key);
            }
        }
        // Waiters blocked on this key wake up and refresh their own wait-for
        // edges; removing them here could hide a cycle through another key
        // the owner still holds.
        shard.cond.notify_all();
    }

    /// Final teardown when a transaction ends: drop any graph residue.
    pub fn forget_owner(&self, owner: TxnId) {
        self.graph.lock().unwrap().remove_transaction(owner);
        self.waiting_on.lock().unwrap().remove(&owner);
    }

    /// The strongest mode `owner` holds on the key, if any.
    pub fn held_mode(&self, owner: TxnId, tree_id: TreeId, key: &[u8]) -> Option<LockMode> {
        let lock_key: LockKey = (tree_id, key.to_vec());
        let shard = self.shard(tree_id, key);
        let records = shard.records.lock().unwrap();
        let rec = records.get(&lock_key)?;
        if rec.exclusive == Some(owner) {
            Some(LockMode::Exclusive)
        } else if rec.upgradable == Some(owner) {
            Some(LockMode::Upgradable)
        } else if rec.shared.contains(&owner) {
            Some(LockMode::Shared)
        } else {
            None
        }
    }
}

enum Grant {
    Granted(LockResult),
    Blocked(Vec<TxnId>),
}

fn render_key(key: &LockKey) -> String {
    let printable = key.1.iter().all(|b| b.is_ascii_graphic() || *b == b' ');
    if printable && !key.1.is_empty() {
        format!("{}:{}", key.0, String::from_utf8_lossy(&key.1))
    } else {
        let hex: String = key.1.iter().map(|b| format!("{:02x}", b)).collect();
        format!("{}:0x{}", key.0, hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const T: Duration = Duration::from_millis(100);

    fn mgr() -> LockManager {
        LockManager::new()
    }

    #[test]
    fn test_shared_locks_coexist() {
        let m = mgr();
        assert_eq!(
            m.acquire(1, 5, b"k", LockMode::Shared, T, LockUpgradeRule::Strict)
                .unwrap(),
            LockResult::Acquired
        );
        assert_eq!(
            m.acquire(2, 5, b"k", LockMode::Shared, T, LockUpgradeRule::Strict)
                .unwrap(),
            LockResult::Acquired
        );
        assert_eq!(
            m.acquire(1, 5, b"k", LockMode::Shared, T, LockUpgradeRule::Strict)
                .unwrap(),
            LockResult::OwnedShared
        );
    }

    #[test]
    fn test_exclusive_excludes_and_times_out() {
        let m = mgr();
        m.acquire(1, 5, b"k", LockMode::Exclusive, T, LockUpgradeRule::Strict)
            .unwrap();
        match m.acquire(2, 5, b"k", LockMode::Shared, T, LockUpgradeRule::Strict) {
            Err(DbError::LockTimeout(_)) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
        m.release(1, 5, b"k", None);
        assert_eq!(
            m.acquire(2, 5, b"k", LockMode::Shared, T, LockUpgradeRule::Strict)
                .unwrap(),
            LockResult::Acquired
        );
    }

    #[test]
    fn test_upgradable_allows_readers_blocks_upgradable() {
        let m = mgr();
        m.acquire(1, 5, b"k", LockMode::Upgradable, T, LockUpgradeRule::Strict)
            .unwrap();
        // Readers still get in.
        assert_eq!(
            m.acquire(2, 5, b"k", LockMode::Shared, T, LockUpgradeRule::Strict)
                .unwrap(),
            LockResult::Acquired
        );
        // A second upgradable waits.
        assert!(m
            .acquire(3, 5, b"k", LockMode::Upgradable, T, LockUpgradeRule::Strict)
            .is_err());
    }

    #[test]
    fn test_upgradable_to_exclusive_waits_for_readers() {
        let m = Arc::new(mgr());
        m.acquire(1, 5, b"k", LockMode::Upgradable, T, LockUpgradeRule::Strict)
            .unwrap();
        m.acquire(2, 5, b"k", LockMode::Shared, T, LockUpgradeRule::Strict)
            .unwrap();

        let m2 = Arc::clone(&m);
        let handle = thread::spawn(move || {
            m2.acquire(
                1,
                5,
                b"k",
                LockMode::Exclusive,
                Duration::from_secs(2),
                LockUpgradeRule::Strict,
            )
        });
        thread::sleep(Duration::from_millis(30));
        m.release(2, 5, b"k", None);
        assert_eq!(handle.join().unwrap().unwrap(), LockResult::Upgraded);

        // Downgrade back to upgradable lets readers in again.
        m.release(1, 5, b"k", Some(LockMode::Upgradable));
        assert_eq!(
            m.acquire(3, 5, b"k", LockMode::Shared, T, LockUpgradeRule::Strict)
                .unwrap(),
            LockResult::Acquired
        );
    }

    #[test]
    fn test_strict_rule_rejects_shared_upgrade() {
        let m = mgr();
        m.acquire(1, 5, b"k", LockMode::Shared, T, LockUpgradeRule::Strict)
            .unwrap();
        match m.acquire(1, 5, b"k", LockMode::Exclusive, T, LockUpgradeRule::Strict) {
            Err(DbError::IllegalUpgrade) => {}
            other => panic!("expected IllegalUpgrade, got {:?}", other),
        }
    }

    #[test]
    fn test_lenient_rule_upgrades_sole_reader() {
        let m = mgr();
        m.acquire(1, 5, b"k", LockMode::Shared, T, LockUpgradeRule::Lenient)
            .unwrap();
        assert_eq!(
            m.acquire(1, 5, b"k", LockMode::Exclusive, T, LockUpgradeRule::Lenient)
                .unwrap(),
            LockResult::Upgraded
        );

        // With company, the lenient upgrade refuses.
        m.release(1, 5, b"k", None);
        m.acquire(1, 5, b"k", LockMode::Shared, T, LockUpgradeRule::Lenient)
            .unwrap();
        m.acquire(2, 5, b"k", LockMode::Shared, T, LockUpgradeRule::Lenient)
            .unwrap();
        assert!(m
            .acquire(1, 5, b"k", LockMode::Exclusive, T, LockUpgradeRule::Lenient)
            .is_err());
    }

    #[test]
    fn test_deadlock_names_participants_and_keys() {
        let m = Arc::new(mgr());
        m.acquire(1, 5, b"k1", LockMode::Exclusive, T, LockUpgradeRule::Strict)
            .unwrap();
        m.acquire(2, 5, b"k2", LockMode::Exclusive, T, LockUpgradeRule::Strict)
            .unwrap();

        let m2 = Arc::clone(&m);
        let handle = thread::spawn(move || {
            // Txn 1 blocks on k2.
            m2.acquire(
                1,
                5,
                b"k2",
                LockMode::Shared,
                Duration::from_secs(5),
                LockUpgradeRule::Strict,
            )
        });
        thread::sleep(Duration::from_millis(50));

        // Txn 2 closing the cycle gets the deadlock error.
        match m.acquire(
            2,
            5,
            b"k1",
            LockMode::Shared,
            Duration::from_secs(5),
            LockUpgradeRule::Strict,
        ) {
            Err(DbError::Deadlock { participants, keys }) => {
                assert!(participants.contains(&1));
                assert!(participants.contains(&2));
                assert!(keys.iter().any(|k| k.contains("k1")));
                assert!(keys.iter().any(|k| k.contains("k2")));
            }
            other => panic!("expected deadlock, got {:?}", other),
        }

        // The other participant proceeds once the loser backs off.
        m.release(2, 5, b"k2", None);
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_held_mode_reports_strongest() {
        let m = mgr();
        assert_eq!(m.held_mode(1, 5, b"k"), None);
        m.acquire(1, 5, b"k", LockMode::Upgradable, T, LockUpgradeRule::Strict)
            .unwrap();
        assert_eq!(m.held_mode(1, 5, b"k"), Some(LockMode::Upgradable));
        m.acquire(1, 5, b"k", LockMode::Exclusive, T, LockUpgradeRule::Strict)
            .unwrap();
        assert_eq!(m.held_mode(1, 5, b"k"), Some(LockMode::Exclusive));
    }
}
