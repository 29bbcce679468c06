//! Registry of the three `local` collections backing the oplog. They are
//! created, opened and dropped together; a handle to one never outlives the
//! others.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::OplogError;
use crate::stats::OplogStats;

pub mod kv_store;
mod txn;

pub use kv_store::{KvStore, LockManager, SledTree};
pub use txn::{Durability, Transaction};
pub(crate) use txn::commit_error;

pub const OPLOG_NS: &str = "local.oplog.rs";
pub const OPLOG_REFS_NS: &str = "local.oplog.refs";
pub const REPL_INFO_NS: &str = "local.replInfo";

pub(crate) const ALL_NS: [&str; 3] = [OPLOG_NS, OPLOG_REFS_NS, REPL_INFO_NS];

pub struct Collections {
    pub oplog: SledTree,
    pub refs: SledTree,
    pub repl_info: SledTree,
}

impl Collections {
    pub fn by_name(&self, ns: &str) -> Option<&SledTree> {
        match ns {
            OPLOG_NS => Some(&self.oplog),
            OPLOG_REFS_NS => Some(&self.refs),
            REPL_INFO_NS => Some(&self.repl_info),
            _ => None,
        }
    }
}

enum StoreState {
    Unopened,
    Open(Arc<Collections>),
    Closed,
}

impl StoreState {
    fn as_str(&self) -> &'static str {
        match self {
            StoreState::Unopened => "unopened",
            StoreState::Open(_) => "open",
            StoreState::Closed => "closed",
        }
    }
}

pub struct LogStore {
    db: sled::Db,
    state: RwLock<StoreState>,
    locks: LockManager,
    txn_serial: Mutex<()>,
    next_txn_id: AtomicU64,
    stats: OplogStats,
}

impl LogStore {
    pub fn new(db: sled::Db) -> Self {
        Self {
            db,
            state: RwLock::new(StoreState::Unopened),
            locks: LockManager::new(),
            txn_serial: Mutex::new(()),
            next_txn_id: AtomicU64::new(1),
            stats: OplogStats::default(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        info!("load log store at {:?}", path.as_ref());
        Ok(Self::new(sled::open(path)?))
    }

    /// Backed by a database that disappears when dropped.
    pub fn temporary() -> Result<Self> {
        Ok(Self::new(sled::Config::new().temporary(true).open()?))
    }

    fn collection_exists(&self, ns: &str) -> bool {
        self.db
            .tree_names()
            .iter()
            .any(|name| &name[..] == ns.as_bytes())
    }

    pub fn exists(&self) -> bool {
        ALL_NS.into_iter().all(|ns| self.collection_exists(ns))
    }

    /// Creates all three collections. Refuses, returning false, when any of
    /// them is already present.
    pub fn create(&self) -> Result<bool> {
        let _lk = self.locks.db_write("repl: creating oplog");

        let existing: Vec<_> = ALL_NS
            .into_iter()
            .filter(|ns| self.collection_exists(ns))
            .collect();
        if !existing.is_empty() {
            warn!("create oplog called with existing collections {existing:?}, investigate why");
            return Ok(false);
        }

        for ns in ALL_NS {
            self.db.open_tree(ns)?;
        }
        self.db.flush()?;

        info!("created oplog collections");
        Ok(true)
    }

    /// Opens the collections once; later calls hand back the same handles.
    pub fn open(&self) -> Result<Arc<Collections>> {
        let mut state = self.state.write();
        if let StoreState::Open(colls) = &*state {
            return Ok(colls.clone());
        }

        for ns in ALL_NS {
            if !self.collection_exists(ns) {
                bail!(OplogError::MissingCollection(ns));
            }
        }

        let colls = Arc::new(Collections {
            oplog: SledTree::new(OPLOG_NS, self.db.open_tree(OPLOG_NS)?),
            refs: SledTree::new(OPLOG_REFS_NS, self.db.open_tree(OPLOG_REFS_NS)?),
            repl_info: SledTree::new(REPL_INFO_NS, self.db.open_tree(REPL_INFO_NS)?),
        });

        info!("open oplog collections, previous state: {}", state.as_str());
        *state = StoreState::Open(colls.clone());

        Ok(colls)
    }

    pub fn close(&self) {
        let mut state = self.state.write();
        if let StoreState::Open(_) = &*state {
            info!("close oplog collections");
            *state = StoreState::Closed;
        }
    }

    /// Drops all three collections, used on full resync.
    pub fn delete(&self) -> Result<()> {
        let _lk = self.locks.db_write("repl: dropping oplog");
        *self.state.write() = StoreState::Closed;

        for ns in ALL_NS {
            if self.db.drop_tree(ns)? {
                info!("dropped {ns}");
            }
        }

        Ok(())
    }

    pub fn is_open(&self) -> bool {
        matches!(&*self.state.read(), StoreState::Open(_))
    }

    pub fn collections(&self) -> Result<Arc<Collections>> {
        match &*self.state.read() {
            StoreState::Open(colls) => Ok(colls.clone()),
            _ => bail!(OplogError::NotOpen),
        }
    }

    /// Serializable with respect to every other transaction on this store.
    pub fn begin_transaction(&self) -> Transaction<'_> {
        let serial = self.txn_serial.lock();
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        Transaction::begin(id, self, serial)
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn stats(&self) -> &OplogStats {
        &self.stats
    }

    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
