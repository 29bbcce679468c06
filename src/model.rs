//! Documents persisted by the oplog: log entries, overflow chunks and the
//! replInfo watermarks, plus the order-preserving keys they are stored under.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{bail, Result};
use chrono::prelude::*;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::OplogError;
use crate::gtid::Gtid;

pub const OVERFLOW_HANDLE_LEN: usize = 12;
pub const CHUNK_KEY_LEN: usize = OVERFLOW_HANDLE_LEN + 8;

pub const MIN_LIVE_KEY: &str = "minLive";
pub const MIN_UNAPPLIED_KEY: &str = "minUnapplied";

/// A single logged write, interpreted by an `OperationInterpreter`. Update
/// and delete carry the pre-image so they can be undone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Operation {
    #[serde(rename = "n")]
    Noop,
    #[serde(rename = "i")]
    Insert {
        ns: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    #[serde(rename = "u")]
    Update {
        ns: String,
        key: Vec<u8>,
        old: Vec<u8>,
        new: Vec<u8>,
    },
    #[serde(rename = "d")]
    Delete {
        ns: String,
        key: Vec<u8>,
        old: Vec<u8>,
    },
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Noop => "noop",
            Operation::Insert { .. } => "insert",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
        }
    }

    pub fn ns(&self) -> Option<&str> {
        match self {
            Operation::Noop => None,
            Operation::Insert { ns, .. }
            | Operation::Update { ns, .. }
            | Operation::Delete { ns, .. } => Some(ns),
        }
    }

    /// Size of the operation as stored, used for chunk accounting.
    pub fn encoded_len(&self) -> Result<usize> {
        Ok(serde_json::to_vec(self)?.len())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.ns() {
            Some(ns) => write!(f, "{} on {}", self.as_str(), ns),
            None => f.write_str(self.as_str()),
        }
    }
}

static HANDLE_COUNTER: AtomicU32 = AtomicU32::new(0);
static HANDLE_SALT: Lazy<u8> = Lazy::new(|| (Utc::now().timestamp_subsec_nanos() & 0xFF) as u8);

/// Opaque 12 byte identifier naming a chunk sequence in oplog.refs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OverflowHandle(pub [u8; OVERFLOW_HANDLE_LEN]);

impl OverflowHandle {
    /// seconds(4) | pid(4) | salt(1) | counter(3)
    pub fn generate() -> Self {
        let secs = Utc::now().timestamp() as u32;
        let pid = std::process::id();
        let counter = HANDLE_COUNTER.fetch_add(1, Ordering::Relaxed);

        let mut raw = [0u8; OVERFLOW_HANDLE_LEN];
        raw[..4].copy_from_slice(&secs.to_be_bytes());
        raw[4..8].copy_from_slice(&pid.to_be_bytes());
        raw[8] = *HANDLE_SALT;
        raw[9..].copy_from_slice(&counter.to_be_bytes()[1..]);
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for OverflowHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId {
    pub oid: OverflowHandle,
    pub seq: u64,
}

impl ChunkId {
    pub fn new(oid: OverflowHandle, seq: u64) -> Self {
        Self { oid, seq }
    }

    pub fn to_key(&self) -> [u8; CHUNK_KEY_LEN] {
        let mut key = [0u8; CHUNK_KEY_LEN];
        key[..OVERFLOW_HANDLE_LEN].copy_from_slice(self.oid.as_bytes());
        key[OVERFLOW_HANDLE_LEN..].copy_from_slice(&self.seq.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Result<Self> {
        if key.len() != CHUNK_KEY_LEN {
            bail!(OplogError::InvalidKey {
                what: "oplog.refs",
                len: key.len(),
            });
        }

        let mut oid = [0u8; OVERFLOW_HANDLE_LEN];
        let mut seq = [0u8; 8];
        oid.copy_from_slice(&key[..OVERFLOW_HANDLE_LEN]);
        seq.copy_from_slice(&key[OVERFLOW_HANDLE_LEN..]);

        Ok(Self {
            oid: OverflowHandle(oid),
            seq: u64::from_be_bytes(seq),
        })
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.oid, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverflowChunk {
    #[serde(rename = "_id")]
    pub id: ChunkId,
    pub ops: Vec<Operation>,
}

impl OverflowChunk {
    pub fn new(oid: OverflowHandle, seq: u64, ops: Vec<Operation>) -> Self {
        Self {
            id: ChunkId::new(oid, seq),
            ops,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryBody {
    Inline(Vec<Operation>),
    Overflow(OverflowHandle),
}

impl EntryBody {
    pub fn overflow_handle(&self) -> Option<&OverflowHandle> {
        match self {
            EntryBody::Overflow(h) => Some(h),
            EntryBody::Inline(_) => None,
        }
    }
}

/// One transaction in local.oplog.rs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEntry", into = "RawEntry")]
pub struct LogEntry {
    pub id: Gtid,
    pub timestamp: DateTime<Utc>,
    pub hash: i64,
    pub applied: bool,
    pub body: EntryBody,
}

/// Entries are stored with millisecond timestamps; constructing them at the
/// same precision keeps an entry equal to what reading it back returns.
fn to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts.timestamp_millis())
        .single()
        .unwrap_or(ts)
}

impl LogEntry {
    pub fn inline(id: Gtid, timestamp: DateTime<Utc>, hash: i64, ops: Vec<Operation>) -> Self {
        Self {
            id,
            timestamp: to_millis(timestamp),
            hash,
            applied: true,
            body: EntryBody::Inline(ops),
        }
    }

    pub fn overflow(id: Gtid, timestamp: DateTime<Utc>, hash: i64, oid: OverflowHandle) -> Self {
        Self {
            id,
            timestamp: to_millis(timestamp),
            hash,
            applied: true,
            body: EntryBody::Overflow(oid),
        }
    }

    pub fn with_applied(mut self, applied: bool) -> Self {
        self.applied = applied;
        self
    }

    pub fn overflow_handle(&self) -> Option<&OverflowHandle> {
        self.body.overflow_handle()
    }
}

// On-disk shape, fields probed by presence. Only ever converted at the
// serialization boundary.
#[derive(Serialize, Deserialize)]
struct RawEntry {
    #[serde(rename = "_id")]
    id: Gtid,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    ts: DateTime<Utc>,
    h: i64,
    a: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ops: Option<Vec<Operation>>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    oid: Option<OverflowHandle>,
}

impl TryFrom<RawEntry> for LogEntry {
    type Error = OplogError;

    fn try_from(raw: RawEntry) -> Result<Self, Self::Error> {
        let body = match (raw.ops, raw.oid) {
            (Some(ops), None) => EntryBody::Inline(ops),
            (None, Some(oid)) => EntryBody::Overflow(oid),
            (None, None) => return Err(OplogError::EmptyEntry),
            (Some(_), Some(_)) => return Err(OplogError::AmbiguousEntry),
        };

        Ok(LogEntry {
            id: raw.id,
            timestamp: raw.ts,
            hash: raw.h,
            applied: raw.a,
            body,
        })
    }
}

impl From<LogEntry> for RawEntry {
    fn from(entry: LogEntry) -> Self {
        let (ops, oid) = match entry.body {
            EntryBody::Inline(ops) => (Some(ops), None),
            EntryBody::Overflow(oid) => (None, Some(oid)),
        };

        RawEntry {
            id: entry.id,
            ts: entry.timestamp,
            h: entry.hash,
            a: entry.applied,
            ops,
            oid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    pub min_live: Gtid,
    pub min_unapplied: Gtid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "GTID")]
    pub gtid: Gtid,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(key: &str) -> Operation {
        Operation::Insert {
            ns: "test.coll".into(),
            key: key.as_bytes().to_vec(),
            value: b"v".to_vec(),
        }
    }

    #[test]
    fn test_entry_document_shape() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let entry = LogEntry::inline(Gtid::new(1, 5), ts, -7, vec![insert("a")]);

        let doc: serde_json::Value = serde_json::to_value(&entry).unwrap();
        assert_eq!(doc["ts"], 1_700_000_000_123i64);
        assert_eq!(doc["h"], -7);
        assert_eq!(doc["a"], true);
        assert!(doc.get("ops").is_some());
        assert!(doc.get("ref").is_none());

        let back: LogEntry = serde_json::from_value(doc).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_entry_timestamp_kept_to_millis() {
        let ts = Utc.timestamp_nanos(1_700_000_000_123_456_789);
        let entry = LogEntry::overflow(Gtid::new(1, 6), ts, 0, OverflowHandle([9; 12]));
        assert_eq!(entry.timestamp.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(entry.timestamp.timestamp_subsec_nanos(), 123_000_000);

        let raw = serde_json::to_vec(&entry).unwrap();
        assert_eq!(serde_json::from_slice::<LogEntry>(&raw).unwrap(), entry);
    }

    #[test]
    fn test_entry_body_must_be_exactly_one() {
        let neither = serde_json::json!({
            "_id": {"primary": 0, "seq": 1}, "ts": 0, "h": 0, "a": true,
        });
        assert!(serde_json::from_value::<LogEntry>(neither).is_err());

        let both = serde_json::json!({
            "_id": {"primary": 0, "seq": 1}, "ts": 0, "h": 0, "a": true,
            "ops": [], "ref": [0,0,0,0,0,0,0,0,0,0,0,1],
        });
        assert!(serde_json::from_value::<LogEntry>(both).is_err());
    }

    #[test]
    fn test_chunk_keys_sort_by_handle_then_seq() {
        let a = OverflowHandle([1; OVERFLOW_HANDLE_LEN]);
        let b = OverflowHandle([2; OVERFLOW_HANDLE_LEN]);

        assert!(ChunkId::new(a, 1).to_key() < ChunkId::new(a, 2).to_key());
        assert!(ChunkId::new(a, u64::MAX).to_key() < ChunkId::new(b, 0).to_key());
        assert_eq!(
            ChunkId::from_key(&ChunkId::new(b, 300).to_key()).unwrap(),
            ChunkId::new(b, 300)
        );
    }

    #[test]
    fn test_generated_handles_are_distinct() {
        let h1 = OverflowHandle::generate();
        let h2 = OverflowHandle::generate();
        assert_ne!(h1, h2);
        assert_eq!(h1.to_string().len(), OVERFLOW_HANDLE_LEN * 2);
    }
}
