use anyhow::{bail, Result};
use tracing::{debug, error, trace};

use crate::error::{self, OplogError};
use crate::gtid::Gtid;
use crate::interpreter::OperationInterpreter;
use crate::model::{EntryBody, LogEntry};
use crate::oplog::chunk::ChunkManager;
use crate::oplog::query::recorded_applied;
use crate::store::{Durability, LogStore, OPLOG_NS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    AlreadyApplied,
    Applied { ops: usize },
}

/// Applies replicated entries on a secondary.
pub struct Applier<'a, I> {
    store: &'a LogStore,
    interpreter: &'a I,
}

impl<'a, I: OperationInterpreter> Applier<'a, I> {
    pub fn new(store: &'a LogStore, interpreter: &'a I) -> Self {
        Self { store, interpreter }
    }

    /// Applying an entry that is already applied does nothing. A failure to
    /// commit leaves it unknown whether the writes landed and is returned
    /// as the fatal `ApplyCommitFailed`.
    pub fn apply_entry(&self, entry: &LogEntry) -> Result<ApplyOutcome> {
        self.store.collections()?;

        let mut txn = self.store.begin_transaction();
        if recorded_applied(&txn, entry)? {
            debug!("{} already applied, skip", entry.id);
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        trace!("{} unapplied -> applying", entry.id);

        let mut count = 0;
        match &entry.body {
            EntryBody::Inline(ops) => {
                for op in ops.iter() {
                    self.interpreter.apply(&mut txn, op)?;
                    count += 1;
                }
            }
            EntryBody::Overflow(oid) => {
                debug!("apply {} through oplog.refs {}", entry.id, oid);
                for chunk in ChunkManager::new(self.store).read_forward(*oid) {
                    let chunk = chunk?;
                    for op in chunk.ops.iter() {
                        self.interpreter.apply(&mut txn, op)?;
                        count += 1;
                    }
                }
            }
        }

        {
            let _lk = self
                .store
                .locks()
                .db_read("repl: setting oplog entry's applied bit");
            let applied = entry.clone().with_applied(true);
            txn.set_doc(OPLOG_NS, &entry.id.to_key(), &applied)?;
        }

        // data writes and the applied bit land in this one commit
        apply_commit_result(entry.id, txn.commit(Durability::NoSync))?;

        trace!("{} applying -> applied", entry.id);
        Ok(ApplyOutcome::Applied { ops: count })
    }
}

/// Once the interpreter has run, a failed commit leaves it unknown whether
/// the writes landed, so every failure here is fatal.
fn apply_commit_result(gtid: Gtid, res: Result<()>) -> Result<()> {
    let Err(e) = res else {
        return Ok(());
    };

    error!("exception during commit of apply of {gtid}, aborting system: {e:#}");
    if error::is_fatal(&e) {
        return Err(e);
    }
    bail!(OplogError::ApplyCommitFailed {
        gtid,
        reason: format!("{e:#}"),
    });
}
