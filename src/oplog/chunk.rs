use anyhow::{bail, ensure, Result};
use itertools::Either;
use tracing::debug;

use crate::error::OplogError;
use crate::model::{ChunkId, Operation, OverflowChunk, OverflowHandle, CHUNK_KEY_LEN};
use crate::oplog::writer::Writer;
use crate::store::{KvStore, LogStore, Transaction, OPLOG_REFS_NS};

/// Splits oversized operation lists into numbered chunks in oplog.refs and
/// reads them back in either direction.
pub struct ChunkManager<'a> {
    store: &'a LogStore,
}

impl<'a> ChunkManager<'a> {
    pub fn new(store: &'a LogStore) -> Self {
        Self { store }
    }

    /// Every chunk holds at least one operation. A chunk is closed once
    /// adding the next operation would push it past `chunk_size_limit`
    /// bytes, so a single oversized operation still gets a chunk of its own.
    /// Sequence numbers start at 1.
    pub fn write_chunked(
        &self,
        oid: OverflowHandle,
        ops: &[Operation],
        chunk_size_limit: usize,
    ) -> Result<OverflowHandle> {
        ensure!(!ops.is_empty(), OplogError::EmptyOverflow);

        let writer = Writer::new(self.store);
        let mut seq = 0;
        let mut pending = vec![];
        let mut pending_size = 0;

        for op in ops.iter() {
            let len = op.encoded_len()?;
            if !pending.is_empty() && pending_size + len > chunk_size_limit {
                seq += 1;
                writer.append_overflow_chunk(&OverflowChunk::new(
                    oid,
                    seq,
                    std::mem::take(&mut pending),
                ))?;
                pending_size = 0;
            }
            pending.push(op.clone());
            pending_size += len;
        }

        seq += 1;
        writer.append_overflow_chunk(&OverflowChunk::new(oid, seq, pending))?;

        debug!("wrote {} ops for {} in {} chunks", ops.len(), oid, seq);
        Ok(oid)
    }

    pub fn read_forward(&self, oid: OverflowHandle) -> ForwardChunks<'a> {
        ForwardChunks {
            store: self.store,
            oid,
            last_seq: 0,
            done: false,
        }
    }

    pub fn read_backward(&self, oid: OverflowHandle) -> BackwardChunks<'a> {
        BackwardChunks {
            store: self.store,
            oid,
            upper: u64::MAX,
            last_seq: None,
            done: false,
        }
    }

    /// Operations of every chunk in log order.
    pub fn forward_operations(
        &self,
        oid: OverflowHandle,
    ) -> impl Iterator<Item = Result<Operation>> + 'a {
        self.read_forward(oid).flat_map(|chunk| match chunk {
            Ok(chunk) => Either::Left(chunk.ops.into_iter().map(Ok)),
            Err(e) => Either::Right(std::iter::once(Err(e))),
        })
    }

    /// Operations of every chunk in exact reverse log order.
    pub fn backward_operations(
        &self,
        oid: OverflowHandle,
    ) -> impl Iterator<Item = Result<Operation>> + 'a {
        self.read_backward(oid).flat_map(|chunk| match chunk {
            Ok(chunk) => Either::Left(chunk.ops.into_iter().rev().map(Ok)),
            Err(e) => Either::Right(std::iter::once(Err(e))),
        })
    }

    /// Stages removal of every chunk belonging to `oid`.
    pub fn stage_delete(&self, txn: &mut Transaction<'_>, oid: &OverflowHandle) -> Result<usize> {
        let (start, end) = chunk_bounds(oid);
        txn.remove_range(OPLOG_REFS_NS, &start, &end)
    }
}

fn chunk_bounds(oid: &OverflowHandle) -> ([u8; CHUNK_KEY_LEN], [u8; CHUNK_KEY_LEN]) {
    (
        ChunkId::new(*oid, 0).to_key(),
        ChunkId::new(*oid, u64::MAX).to_key(),
    )
}

/// Chunks of one handle in ascending seq order. Every step is a fresh point
/// query for the next key, taken under a short read lock, so the cursor
/// holds nothing between calls and may be cloned to restart from the same
/// place.
#[derive(Clone)]
pub struct ForwardChunks<'a> {
    store: &'a LogStore,
    oid: OverflowHandle,
    last_seq: u64,
    done: bool,
}

impl ForwardChunks<'_> {
    fn fetch(&mut self) -> Result<Option<OverflowChunk>> {
        let refs = self.store.collections()?.refs.clone();

        let found = {
            let _lk = self
                .store
                .locks()
                .db_read("repl: finding oplog.refs entry to apply");
            refs.kv_get_next(&ChunkId::new(self.oid, self.last_seq).to_key())?
        };

        let Some((key, raw)) = found else {
            return self.finish();
        };
        let id = ChunkId::from_key(&key)?;
        if id.oid != self.oid {
            return self.finish();
        }
        if id.seq != self.last_seq + 1 {
            bail!(OplogError::OverflowChunkGap {
                handle: self.oid,
                expected: self.last_seq + 1,
                found: id.seq,
            });
        }

        let chunk: OverflowChunk = serde_json::from_slice(&raw)?;
        debug!("read chunk {}, {} ops", chunk.id, chunk.ops.len());
        self.last_seq = id.seq;

        Ok(Some(chunk))
    }

    fn finish(&self) -> Result<Option<OverflowChunk>> {
        if self.last_seq == 0 {
            bail!(OplogError::MissingOverflowChunks(self.oid));
        }
        Ok(None)
    }
}

impl Iterator for ForwardChunks<'_> {
    type Item = Result<OverflowChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.fetch() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Chunks of one handle in descending seq order, each step the largest key
/// at or below the previous seq minus one.
#[derive(Clone)]
pub struct BackwardChunks<'a> {
    store: &'a LogStore,
    oid: OverflowHandle,
    upper: u64,
    last_seq: Option<u64>,
    done: bool,
}

impl BackwardChunks<'_> {
    fn fetch(&mut self) -> Result<Option<OverflowChunk>> {
        let refs = self.store.collections()?.refs.clone();

        let found = {
            let _lk = self
                .store
                .locks()
                .db_read("repl: finding oplog.refs entry to rollback");
            refs.kv_get_prev_or_eq(
                &ChunkId::new(self.oid, 0).to_key(),
                &ChunkId::new(self.oid, self.upper).to_key(),
            )?
        };

        let Some((key, raw)) = found else {
            return match self.last_seq {
                None => bail!(OplogError::MissingOverflowChunks(self.oid)),
                Some(1) => Ok(None),
                Some(seq) => bail!(OplogError::OverflowChunkGap {
                    handle: self.oid,
                    expected: seq - 1,
                    found: 0,
                }),
            };
        };
        let id = ChunkId::from_key(&key)?;
        if let Some(seq) = self.last_seq {
            if id.seq + 1 != seq {
                bail!(OplogError::OverflowChunkGap {
                    handle: self.oid,
                    expected: seq - 1,
                    found: id.seq,
                });
            }
        }

        let chunk: OverflowChunk = serde_json::from_slice(&raw)?;
        debug!("read chunk {}, {} ops", chunk.id, chunk.ops.len());
        self.last_seq = Some(id.seq);
        match id.seq.checked_sub(1) {
            Some(upper) => self.upper = upper,
            None => self.done = true,
        }

        Ok(Some(chunk))
    }
}

impl Iterator for BackwardChunks<'_> {
    type Item = Result<OverflowChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.fetch() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
