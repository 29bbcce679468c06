use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => f.write_str("R"),
            LockMode::Write => f.write_str("W"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub mode: LockMode,
    pub reason: &'static str,
}

/// Database level intent lock over the `local` collections. Every holder
/// names a reason, visible through [`LockManager::held`] while it is held.
pub struct LockManager {
    db: RwLock<()>,
    next_id: AtomicU64,
    holders: Mutex<BTreeMap<u64, HeldLock>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            db: RwLock::new(()),
            next_id: AtomicU64::new(1),
            holders: Mutex::new(BTreeMap::new()),
        }
    }

    fn register(&self, mode: LockMode, reason: &'static str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.holders.lock().insert(id, HeldLock { mode, reason });
        trace!("acquired {mode} lock on local: {reason}");
        id
    }

    /// Shared intent. Recursive so a holder may call into code that takes
    /// its own short read lock.
    pub fn db_read(&self, reason: &'static str) -> DbReadLock<'_> {
        let guard = self.db.read_recursive();
        let id = self.register(LockMode::Read, reason);
        DbReadLock {
            _guard: guard,
            owner: self,
            id,
            reason,
            acquired: Instant::now(),
        }
    }

    pub fn db_write(&self, reason: &'static str) -> DbWriteLock<'_> {
        let guard = self.db.write();
        let id = self.register(LockMode::Write, reason);
        DbWriteLock {
            _guard: guard,
            owner: self,
            id,
            reason,
            acquired: Instant::now(),
        }
    }

    pub fn held(&self) -> Vec<HeldLock> {
        self.holders.lock().values().cloned().collect()
    }

    fn release(&self, id: u64, reason: &'static str, acquired: Instant) {
        self.holders.lock().remove(&id);
        trace!(
            "released lock on local: {reason}, held for {:?}",
            acquired.elapsed()
        );
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DbReadLock<'a> {
    _guard: RwLockReadGuard<'a, ()>,
    owner: &'a LockManager,
    id: u64,
    reason: &'static str,
    acquired: Instant,
}

impl Drop for DbReadLock<'_> {
    fn drop(&mut self) {
        self.owner.release(self.id, self.reason, self.acquired);
    }
}

pub struct DbWriteLock<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    owner: &'a LockManager,
    id: u64,
    reason: &'static str,
    acquired: Instant,
}

impl Drop for DbWriteLock<'_> {
    fn drop(&mut self) {
        self.owner.release(self.id, self.reason, self.acquired);
    }
}
