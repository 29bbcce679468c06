use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Insert instrumentation for the oplog and oplog.refs collections.
#[derive(Default)]
pub struct OplogStats {
    inserts: AtomicU64,
    insert_bytes: AtomicU64,
    insert_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OplogStatsSnapshot {
    pub inserts: u64,
    pub insert_bytes: u64,
    pub insert_micros: u64,
}

impl OplogStats {
    pub fn start_insert(&self) -> InsertTimer<'_> {
        InsertTimer {
            stats: self,
            start: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> OplogStatsSnapshot {
        OplogStatsSnapshot {
            inserts: self.inserts.load(Ordering::Relaxed),
            insert_bytes: self.insert_bytes.load(Ordering::Relaxed),
            insert_micros: self.insert_micros.load(Ordering::Relaxed),
        }
    }
}

/// Times one insert. Only a finished timer is counted, so an insert that
/// failed and dropped its timer leaves the counters alone.
pub struct InsertTimer<'a> {
    stats: &'a OplogStats,
    start: Instant,
}

impl InsertTimer<'_> {
    pub fn finish(self, bytes: usize) {
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .insert_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.stats
            .insert_micros
            .fetch_add(self.start.elapsed().as_micros() as u64, Ordering::Relaxed);
    }
}
