use anyhow::{bail, Result};
use tracing::{debug, warn};

use crate::error::OplogError;
use crate::model::{LogEntry, OverflowChunk, OverflowHandle};
use crate::oplog::writer::Writer;
use crate::store::LogStore;

/// Where a secondary pulls overflow chunks from. The cursor yields chunks
/// of `oid` in seq order and may run on past them into the next handle.
pub trait RemoteChunkSource {
    type Cursor: Iterator<Item = Result<OverflowChunk>>;

    fn overflow_chunks(&self, oid: &OverflowHandle) -> Result<Self::Cursor>;
}

/// Copies an entry from the primary into the local oplog, unapplied. For
/// an overflow entry its chunks are copied first, so the entry never refers
/// to chunks that are not there yet. An overflow entry whose chunks the
/// primary does not return is not stored. Returns true for an overflow
/// entry.
pub fn replicate_full_transaction<R: RemoteChunkSource>(
    store: &LogStore,
    entry: &LogEntry,
    remote: &R,
) -> Result<bool> {
    let writer = Writer::new(store);

    let big_txn = match entry.overflow_handle() {
        Some(oid) => {
            let copied = copy_overflow_chunks(store, &writer, remote, oid)?;
            if copied == 0 {
                warn!("no oplog.refs chunks on primary for {}, ref {oid}", entry.id);
                bail!(OplogError::RemoteChunksMissing(*oid));
            }
            debug!("copied {copied} oplog.refs chunks for {}", entry.id);
            true
        }
        None => false,
    };

    writer.replicate_entry(entry)?;
    Ok(big_txn)
}

fn copy_overflow_chunks<R: RemoteChunkSource>(
    store: &LogStore,
    writer: &Writer<'_>,
    remote: &R,
    oid: &OverflowHandle,
) -> Result<usize> {
    let cursor = remote.overflow_chunks(oid)?;
    let _lk = store.locks().db_read("repl: copying oplog.refs range");

    let mut copied = 0;
    for chunk in cursor {
        let chunk = chunk?;
        if chunk.id.oid != *oid {
            break;
        }
        writer.append_overflow_chunk(&chunk)?;
        copied += 1;
    }

    Ok(copied)
}
