use anyhow::Result;
use chrono::prelude::*;
use tracing::trace;

use crate::gtid::Gtid;
use crate::model::{
    LogEntry, Operation, OverflowChunk, OverflowHandle, WatermarkRecord, Watermarks,
    MIN_LIVE_KEY, MIN_UNAPPLIED_KEY,
};
use crate::store::LogStore;

/// Every append to local.oplog.rs and local.oplog.refs goes through here so
/// byte and latency accounting stays in one place.
pub struct Writer<'a> {
    store: &'a LogStore,
}

impl<'a> Writer<'a> {
    pub fn new(store: &'a LogStore) -> Self {
        Self { store }
    }

    pub fn append_entry(
        &self,
        gtid: Gtid,
        timestamp: DateTime<Utc>,
        hash: i64,
        ops: Vec<Operation>,
    ) -> Result<()> {
        let _lk = self.store.locks().db_read("repl: logging to oplog");
        let entry = LogEntry::inline(gtid, timestamp, hash, ops);
        trace!("writing {:?} to master", entry);
        self.write_entry(&entry, true)
    }

    /// The chunks for `oid` must already be in oplog.refs.
    pub fn append_entry_with_overflow(
        &self,
        gtid: Gtid,
        timestamp: DateTime<Utc>,
        hash: i64,
        oid: OverflowHandle,
    ) -> Result<()> {
        let _lk = self.store.locks().db_read("repl: logging to oplog");
        let entry = LogEntry::overflow(gtid, timestamp, hash, oid);
        trace!("writing {:?} to master", entry);
        self.write_entry(&entry, true)
    }

    pub fn append_overflow_chunk(&self, chunk: &OverflowChunk) -> Result<()> {
        let _lk = self.store.locks().db_read("repl: logging to oplog.refs");
        let refs = self.store.collections()?.refs.clone();

        let timer = self.store.stats().start_insert();
        let len = refs.set_doc(&chunk.id.to_key(), chunk)?;
        timer.finish(len);

        Ok(())
    }

    /// Stores an entry received from a primary, marked as not yet applied.
    pub fn replicate_entry(&self, entry: &LogEntry) -> Result<()> {
        let _lk = self
            .store
            .locks()
            .db_read("repl: copying entry to local oplog");
        let entry = entry.clone().with_applied(false);
        self.write_entry(&entry, true)
    }

    /// Overwrites both replInfo records. Takes no lock, the caller is
    /// expected to hold one.
    pub fn record_watermarks(&self, marks: &Watermarks) -> Result<()> {
        let repl_info = self.store.collections()?.repl_info.clone();

        repl_info.set_doc(
            MIN_LIVE_KEY.as_bytes(),
            &WatermarkRecord {
                id: MIN_LIVE_KEY.to_owned(),
                gtid: marks.min_live,
            },
        )?;
        repl_info.set_doc(
            MIN_UNAPPLIED_KEY.as_bytes(),
            &WatermarkRecord {
                id: MIN_UNAPPLIED_KEY.to_owned(),
                gtid: marks.min_unapplied,
            },
        )?;

        Ok(())
    }

    fn write_entry(&self, entry: &LogEntry, record_stats: bool) -> Result<()> {
        let oplog = self.store.collections()?.oplog.clone();
        let key = entry.id.to_key();

        if !record_stats {
            oplog.set_doc(&key, entry)?;
            return Ok(());
        }

        let timer = self.store.stats().start_insert();
        let len = oplog.set_doc(&key, entry)?;
        timer.finish(len);

        Ok(())
    }
}
