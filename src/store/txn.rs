use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use derivative::Derivative;
use parking_lot::MutexGuard;
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionResult, TransactionError, TransactionResult, Transactional,
};
use tracing::debug;

use super::LogStore;
use crate::error::OplogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Leave flushing to the engine's background flusher.
    NoSync,
    Sync,
}

/// All-or-nothing unit of work over any trees of the database. Writes are
/// staged in memory and become visible together at commit; dropping an
/// uncommitted transaction discards them. Transactions are serialized
/// against each other for their whole lifetime.
///
/// `local.*` collections are only reached through the open registry, so a
/// transaction never recreates one that was dropped underneath it.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Transaction<'a> {
    id: u64,
    #[derivative(Debug = "ignore")]
    store: &'a LogStore,
    #[derivative(Debug = "ignore")]
    _serial: MutexGuard<'a, ()>,
    writes: BTreeMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(id: u64, store: &'a LogStore, serial: MutexGuard<'a, ()>) -> Self {
        debug!("begin transaction {id}");
        Self {
            id,
            store,
            _serial: serial,
            writes: BTreeMap::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.values().map(|w| w.len()).sum()
    }

    /// Reads through the staged writes of this transaction.
    pub fn get(&self, ns: &str, key: &[u8]) -> Result<Option<Bytes>> {
        if let Some(staged) = self.writes.get(ns).and_then(|w| w.get(key)) {
            return Ok(staged.as_ref().map(|v| Bytes::copy_from_slice(v)));
        }

        let tree = self.tree(ns)?;
        Ok(tree.get(key)?.map(|v| Bytes::copy_from_slice(&v)))
    }

    pub fn insert(&mut self, ns: &str, key: &[u8], value: impl Into<Vec<u8>>) {
        self.staged(ns).insert(key.to_vec(), Some(value.into()));
    }

    pub fn remove(&mut self, ns: &str, key: &[u8]) {
        self.staged(ns).insert(key.to_vec(), None);
    }

    pub fn set_doc<T: Serialize>(&mut self, ns: &str, key: &[u8], doc: &T) -> Result<usize> {
        let raw = serde_json::to_vec(doc)?;
        let len = raw.len();
        self.insert(ns, key, raw);
        Ok(len)
    }

    /// Stages removal of every key in `start..=end`, committed or staged.
    pub fn remove_range(&mut self, ns: &str, start: &[u8], end: &[u8]) -> Result<usize> {
        let tree = self.tree(ns)?;
        let mut keys = vec![];
        for item in tree.range(start.to_vec()..=end.to_vec()) {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }

        let staged = self.staged(ns);
        for (key, value) in staged.range(start.to_vec()..=end.to_vec()) {
            if value.is_some() {
                keys.push(key.clone());
            }
        }

        keys.sort();
        keys.dedup();
        let count = keys.len();
        for key in keys {
            staged.insert(key, None);
        }

        Ok(count)
    }

    pub fn commit(mut self, durability: Durability) -> Result<()> {
        self.finished = true;

        let writes = std::mem::take(&mut self.writes);
        if writes.is_empty() {
            debug!("commit empty transaction {}", self.id);
            return Ok(());
        }

        // held until the batches land so the registry cannot be dropped
        // between resolving the trees and applying to them
        let _lk = self.store.locks().db_read("txn: committing");

        let mut trees = Vec::with_capacity(writes.len());
        let mut batches = Vec::with_capacity(writes.len());
        for (ns, staged) in writes.into_iter() {
            trees.push(self.tree(&ns)?);

            let mut batch = sled::Batch::default();
            for (key, value) in staged.into_iter() {
                match value {
                    Some(v) => batch.insert(key, v),
                    None => batch.remove(key),
                }
            }
            batches.push(batch);
        }

        let res: TransactionResult<(), ()> =
            trees
                .as_slice()
                .transaction(|views| -> ConflictableTransactionResult<(), ()> {
                    for (view, batch) in views.iter().zip(batches.iter()) {
                        view.apply_batch(batch)?;
                    }
                    Ok(())
                });
        res.map_err(commit_error)?;

        if durability == Durability::Sync {
            self.store.db().flush()?;
        }

        debug!("commit transaction {}, durability: {durability:?}", self.id);
        Ok(())
    }

    fn tree(&self, ns: &str) -> Result<sled::Tree> {
        if !ns.starts_with("local.") {
            return Ok(self.store.db().open_tree(ns)?);
        }

        let colls = self.store.collections()?;
        match colls.by_name(ns) {
            Some(tree) => Ok(tree.inner().clone()),
            None => bail!("unknown local collection {ns}"),
        }
    }

    fn staged(&mut self, ns: &str) -> &mut BTreeMap<Vec<u8>, Option<Vec<u8>>> {
        self.writes.entry(ns.to_owned()).or_default()
    }
}

pub(crate) fn commit_error(e: TransactionError<()>) -> anyhow::Error {
    anyhow!(OplogError::CommitFailed(format!("{e:?}")))
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                "abort transaction {}, discard {} staged writes",
                self.id,
                self.pending_writes()
            );
        }
    }
}
