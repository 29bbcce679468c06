use anyhow::{ensure, Result};
use tracing::trace;

use crate::model::Operation;
use crate::store::Transaction;

/// Applies or undoes a single logged operation against the data store, as
/// part of the transaction the caller supplies.
pub trait OperationInterpreter {
    fn apply(&self, txn: &mut Transaction<'_>, op: &Operation) -> Result<()>;
    fn rollback(&self, txn: &mut Transaction<'_>, op: &Operation) -> Result<()>;
}

/// Interprets operations against sled trees, one tree per namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct SledInterpreter;

impl SledInterpreter {
    // oplog namespaces are never targets of replicated writes
    fn check_ns(ns: &str) -> Result<()> {
        ensure!(!ns.starts_with("local."), "cannot replicate writes into {ns}");
        Ok(())
    }
}

impl OperationInterpreter for SledInterpreter {
    fn apply(&self, txn: &mut Transaction<'_>, op: &Operation) -> Result<()> {
        trace!("apply {op}");
        match op {
            Operation::Noop => {}
            Operation::Insert { ns, key, value } => {
                Self::check_ns(ns)?;
                txn.insert(ns, key, value.clone());
            }
            Operation::Update { ns, key, new, .. } => {
                Self::check_ns(ns)?;
                txn.insert(ns, key, new.clone());
            }
            Operation::Delete { ns, key, .. } => {
                Self::check_ns(ns)?;
                txn.remove(ns, key);
            }
        }

        Ok(())
    }

    fn rollback(&self, txn: &mut Transaction<'_>, op: &Operation) -> Result<()> {
        trace!("rollback {op}");
        match op {
            Operation::Noop => {}
            Operation::Insert { ns, key, .. } => {
                Self::check_ns(ns)?;
                txn.remove(ns, key);
            }
            Operation::Update { ns, key, old, .. } | Operation::Delete { ns, key, old } => {
                Self::check_ns(ns)?;
                txn.insert(ns, key, old.clone());
            }
        }

        Ok(())
    }
}
