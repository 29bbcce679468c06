use anyhow::Result;
use tracing::{debug, info};

use crate::interpreter::OperationInterpreter;
use crate::model::{EntryBody, LogEntry};
use crate::oplog::chunk::ChunkManager;
use crate::oplog::query::recorded_applied;
use crate::store::{Durability, LogStore, Transaction, OPLOG_NS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackOutcome {
    /// Operations undone, zero when the entry was never applied.
    pub undone: usize,
    pub purged: bool,
}

/// Undoes applied entries during rollback of a diverged secondary.
pub struct RollbackEngine<'a, I> {
    store: &'a LogStore,
    interpreter: &'a I,
}

impl<'a, I: OperationInterpreter> RollbackEngine<'a, I> {
    pub fn new(store: &'a LogStore, interpreter: &'a I) -> Self {
        Self { store, interpreter }
    }

    /// Undoes the entry's operations in exact reverse order if it is
    /// applied, then either removes it (and its chunks) or flips it back to
    /// unapplied. Everything happens in one transaction.
    pub fn rollback_entry(&self, entry: &LogEntry, purge: bool) -> Result<RollbackOutcome> {
        self.store.collections()?;

        let mut txn = self.store.begin_transaction();
        let mut undone = 0;

        if recorded_applied(&txn, entry)? {
            match &entry.body {
                EntryBody::Inline(ops) => {
                    for op in ops.iter().rev() {
                        self.interpreter.rollback(&mut txn, op)?;
                        undone += 1;
                    }
                }
                EntryBody::Overflow(oid) => {
                    debug!("rollback {} through oplog.refs {}", entry.id, oid);
                    for chunk in ChunkManager::new(self.store).read_backward(*oid) {
                        let chunk = chunk?;
                        for op in chunk.ops.iter().rev() {
                            self.interpreter.rollback(&mut txn, op)?;
                            undone += 1;
                        }
                    }
                }
            }
        } else {
            debug!("{} not applied, nothing to undo", entry.id);
        }

        {
            let _lk = self.store.locks().db_read("repl: purging entry from oplog");
            if purge {
                stage_purge(self.store, &mut txn, entry)?;
            } else {
                let unapplied = entry.clone().with_applied(false);
                txn.set_doc(OPLOG_NS, &entry.id.to_key(), &unapplied)?;
            }
        }

        txn.commit(Durability::NoSync)?;

        info!(
            "rolled back {}, undone {} ops, purged: {}",
            entry.id, undone, purge
        );
        Ok(RollbackOutcome {
            undone,
            purged: purge,
        })
    }
}

/// Stages removal of an entry and, for overflow entries, all of its chunks.
/// Returns the number of chunks staged for removal.
pub(crate) fn stage_purge(
    store: &LogStore,
    txn: &mut Transaction<'_>,
    entry: &LogEntry,
) -> Result<usize> {
    let chunks = match entry.overflow_handle() {
        Some(oid) => ChunkManager::new(store).stage_delete(txn, oid)?,
        None => 0,
    };
    txn.remove(OPLOG_NS, &entry.id.to_key());
    Ok(chunks)
}
