use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::prelude::*;
use tracing::{debug, info, warn};

use crate::gtid::Gtid;
use crate::model::LogEntry;
use crate::oplog::query::load_watermarks;
use crate::oplog::rollback::stage_purge;
use crate::store::{Durability, KvStore, LogStore};

const MILLIS_PER_HOUR: u64 = 60 * 60 * 1000;

/// Entries removed per compaction step. Each step is its own transaction.
const COMPACTION_BATCH: usize = 64;

/// Retention window in milliseconds.
pub fn compute_expiry_threshold(days: u64, hours: u64) -> u64 {
    days.saturating_mul(24)
        .saturating_add(hours)
        .saturating_mul(MILLIS_PER_HOUR)
}

pub struct RetentionManager<'a> {
    store: &'a LogStore,
}

impl<'a> RetentionManager<'a> {
    pub fn new(store: &'a LogStore) -> Self {
        Self { store }
    }

    /// Removes applied entries with GTID at or below `gtid`, together with
    /// their chunks, in steps. Stops early at the first unapplied entry or
    /// once `timeout` has passed after a step. Returns the number of steps
    /// that committed.
    pub fn compact_up_to(&self, gtid: Gtid, timeout: Duration) -> Result<u64> {
        let oplog = self.store.collections()?.oplog.clone();
        let deadline = Instant::now() + timeout;
        let mut steps = 0;
        let mut removed = 0;

        loop {
            let mut txn = self.store.begin_transaction();
            let mut batch = 0;
            let mut blocked = false;

            {
                let _lk = self.store.locks().db_read("repl: optimizing oplog");
                for item in oplog.kv_range(&Gtid::MIN.to_key(), &gtid.to_key())? {
                    let (_, raw) = item?;
                    let entry: LogEntry = serde_json::from_slice(&raw)?;
                    if !entry.applied {
                        warn!("compaction reached unapplied entry {}, stop", entry.id);
                        blocked = true;
                        break;
                    }

                    stage_purge(self.store, &mut txn, &entry)?;
                    batch += 1;
                    if batch >= COMPACTION_BATCH {
                        break;
                    }
                }
            }

            if batch == 0 {
                break;
            }
            txn.commit(Durability::NoSync)?;
            steps += 1;
            removed += batch;
            debug!("compaction step {steps} removed {batch} entries");

            if blocked || Instant::now() >= deadline {
                break;
            }
        }

        if removed > 0 {
            info!("compacted oplog up to {gtid}, removed {removed} entries in {steps} steps");
        }
        Ok(steps)
    }

    /// Largest GTID whose entry is older than `threshold_ms` before `now`,
    /// always strictly below minLive when watermarks are recorded.
    pub fn expired_boundary(&self, now: DateTime<Utc>, threshold_ms: u64) -> Result<Option<Gtid>> {
        let oplog = self.store.collections()?.oplog.clone();
        let watermarks = load_watermarks(self.store)?;
        let window = chrono::Duration::milliseconds(threshold_ms.min(i64::MAX as u64) as i64);
        let Some(cutoff) = now.checked_sub_signed(window) else {
            return Ok(None);
        };

        let _lk = self
            .store
            .locks()
            .db_read("repl: finding expired oplog entries");

        let mut boundary = None;
        for item in oplog.kv_range(&Gtid::MIN.to_key(), &Gtid::MAX.to_key())? {
            let (_, raw) = item?;
            let entry: LogEntry = serde_json::from_slice(&raw)?;
            if entry.timestamp >= cutoff {
                break;
            }
            if let Some(marks) = watermarks {
                if entry.id >= marks.min_live {
                    break;
                }
            }
            boundary = Some(entry.id);
        }

        Ok(boundary)
    }
}
