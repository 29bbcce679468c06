//! The replicated transaction log. [`Oplog`] bundles an open [`LogStore`]
//! with the interpreter that turns logged operations into data writes, and
//! hands out the components that act on it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::prelude::*;
use tracing::debug;

use crate::config::{DEFAULT_MAX_INLINE_OPS_SIZE, DEFAULT_OVERFLOW_CHUNK_SIZE};
use crate::gtid::Gtid;
use crate::interpreter::OperationInterpreter;
use crate::model::{LogEntry, Operation, OverflowHandle, Watermarks};
use crate::store::{Durability, LogStore};

pub mod applier;
pub mod chunk;
pub mod query;
pub mod replicate;
pub mod retention;
pub mod rollback;
pub mod writer;

pub use applier::{Applier, ApplyOutcome};
pub use chunk::{BackwardChunks, ChunkManager, ForwardChunks};
pub use replicate::RemoteChunkSource;
pub use retention::{compute_expiry_threshold, RetentionManager};
pub use rollback::{RollbackEngine, RollbackOutcome};
pub use writer::Writer;

pub struct Oplog<I> {
    store: Arc<LogStore>,
    interpreter: I,
    overflow_chunk_size: usize,
    max_inline_ops_size: usize,
}

impl<I: OperationInterpreter> Oplog<I> {
    pub fn new(store: Arc<LogStore>, interpreter: I) -> Self {
        Self {
            store,
            interpreter,
            overflow_chunk_size: DEFAULT_OVERFLOW_CHUNK_SIZE,
            max_inline_ops_size: DEFAULT_MAX_INLINE_OPS_SIZE,
        }
    }

    pub fn with_limits(mut self, overflow_chunk_size: usize, max_inline_ops_size: usize) -> Self {
        self.overflow_chunk_size = overflow_chunk_size;
        self.max_inline_ops_size = max_inline_ops_size;
        self
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    pub fn interpreter(&self) -> &I {
        &self.interpreter
    }

    pub fn writer(&self) -> Writer<'_> {
        Writer::new(&self.store)
    }

    pub fn chunks(&self) -> ChunkManager<'_> {
        ChunkManager::new(&self.store)
    }

    pub fn applier(&self) -> Applier<'_, I> {
        Applier::new(&self.store, &self.interpreter)
    }

    pub fn rollback_engine(&self) -> RollbackEngine<'_, I> {
        RollbackEngine::new(&self.store, &self.interpreter)
    }

    pub fn retention(&self) -> RetentionManager<'_> {
        RetentionManager::new(&self.store)
    }

    /// Logs a locally committed transaction. Small ones go inline, anything
    /// whose encoded ops exceed the inline limit is spilled to oplog.refs
    /// under a fresh handle first.
    pub fn log_transaction(
        &self,
        gtid: Gtid,
        timestamp: DateTime<Utc>,
        hash: i64,
        ops: Vec<Operation>,
    ) -> Result<LogEntry> {
        let mut size = 0;
        for op in ops.iter() {
            size += op.encoded_len()?;
        }

        if size <= self.max_inline_ops_size {
            self.writer()
                .append_entry(gtid, timestamp, hash, ops.clone())?;
            return Ok(LogEntry::inline(gtid, timestamp, hash, ops));
        }

        debug!("{gtid} ops take {size} bytes, spill to oplog.refs");
        let oid = self.chunks().write_chunked(
            OverflowHandle::generate(),
            &ops,
            self.overflow_chunk_size,
        )?;
        self.writer()
            .append_entry_with_overflow(gtid, timestamp, hash, oid)?;

        Ok(LogEntry::overflow(gtid, timestamp, hash, oid))
    }

    pub fn apply_entry(&self, entry: &LogEntry) -> Result<ApplyOutcome> {
        self.applier().apply_entry(entry)
    }

    pub fn rollback_entry(&self, entry: &LogEntry, purge: bool) -> Result<RollbackOutcome> {
        self.rollback_engine().rollback_entry(entry, purge)
    }

    pub fn replicate_entry(&self, entry: &LogEntry) -> Result<()> {
        self.writer().replicate_entry(entry)
    }

    pub fn replicate_full_transaction<R: RemoteChunkSource>(
        &self,
        entry: &LogEntry,
        remote: &R,
    ) -> Result<bool> {
        replicate::replicate_full_transaction(&self.store, entry, remote)
    }

    /// Removes the entry and its overflow chunks in one transaction.
    pub fn purge_entry(&self, entry: &LogEntry) -> Result<()> {
        self.store.collections()?;

        let mut txn = self.store.begin_transaction();
        {
            let _lk = self.store.locks().db_read("repl: purging entry from oplog");
            rollback::stage_purge(&self.store, &mut txn, entry)?;
        }
        txn.commit(Durability::NoSync)
    }

    pub fn compact_up_to(&self, gtid: Gtid, timeout: Duration) -> Result<u64> {
        self.retention().compact_up_to(gtid, timeout)
    }

    pub fn record_watermarks(&self, marks: &Watermarks) -> Result<()> {
        self.writer().record_watermarks(marks)
    }

    pub fn load_watermarks(&self) -> Result<Option<Watermarks>> {
        query::load_watermarks(&self.store)
    }

    pub fn last_gtid(&self) -> Result<Option<Gtid>> {
        query::last_gtid(&self.store)
    }

    pub fn gtid_exists(&self, gtid: Gtid) -> Result<bool> {
        query::gtid_exists(&self.store, gtid)
    }

    pub fn find_entry(&self, gtid: Gtid) -> Result<Option<LogEntry>> {
        query::find_entry(&self.store, gtid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::SledInterpreter;
    use crate::model::EntryBody;

    fn oplog() -> Oplog<SledInterpreter> {
        let store = LogStore::temporary().unwrap();
        store.create().unwrap();
        store.open().unwrap();
        Oplog::new(Arc::new(store), SledInterpreter)
    }

    fn ops(n: usize) -> Vec<Operation> {
        (0..n)
            .map(|i| Operation::Insert {
                ns: "test.kv".into(),
                key: format!("k{:03}", i).into_bytes(),
                value: vec![0; 32],
            })
            .collect()
    }

    #[test]
    fn test_log_transaction_spills_large_ops() {
        let ops = ops(20);
        let op_len = ops[0].encoded_len().unwrap();
        let oplog = oplog().with_limits(op_len * 5, op_len * 10);

        let small = oplog
            .log_transaction(Gtid::new(1, 1), Utc::now(), 0, ops[..10].to_vec())
            .unwrap();
        assert!(matches!(small.body, EntryBody::Inline(ref v) if v.len() == 10));

        let big = oplog
            .log_transaction(Gtid::new(1, 2), Utc::now(), 0, ops.clone())
            .unwrap();
        let oid = *big.overflow_handle().unwrap();
        assert_eq!(oplog.chunks().read_forward(oid).count(), 4);
        assert_eq!(oplog.find_entry(big.id).unwrap(), Some(big));
        assert_eq!(oplog.last_gtid().unwrap(), Some(Gtid::new(1, 2)));
    }

    #[test]
    fn test_logged_entry_matches_stored() {
        let ops = ops(4);
        let op_len = ops[0].encoded_len().unwrap();
        let oplog = oplog().with_limits(op_len, op_len * 2);
        let ts = Utc.timestamp_nanos(1_700_000_000_987_654_321);

        let small = oplog
            .log_transaction(Gtid::new(2, 1), ts, 0, ops[..1].to_vec())
            .unwrap();
        let big = oplog
            .log_transaction(Gtid::new(2, 2), ts, 0, ops)
            .unwrap();
        assert!(big.overflow_handle().is_some());

        for entry in [small, big] {
            assert_eq!(entry.timestamp.timestamp_millis(), 1_700_000_000_987);
            assert_eq!(oplog.find_entry(entry.id).unwrap(), Some(entry));
        }
    }

    #[test]
    fn test_purge_entry_removes_overflow() {
        let ops = ops(6);
        let op_len = ops[0].encoded_len().unwrap();
        let oplog = oplog().with_limits(op_len * 2, op_len);

        let entry = oplog
            .log_transaction(Gtid::new(1, 1), Utc::now(), 0, ops)
            .unwrap();
        oplog.purge_entry(&entry).unwrap();

        assert!(!oplog.gtid_exists(entry.id).unwrap());
        assert!(oplog.store().collections().unwrap().refs.is_empty());
    }
}
