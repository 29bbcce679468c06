use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;

use oplog::interpreter::{OperationInterpreter, SledInterpreter};
use oplog::oplog::{compute_expiry_threshold, ApplyOutcome};
use oplog::store::{KvStore, Transaction};
use oplog::{Gtid, LogEntry, LogStore, Oplog, Operation, OverflowHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Apply(Vec<u8>),
    Rollback(Vec<u8>),
}

/// Forwards to the sled interpreter and remembers the order of calls.
#[derive(Clone, Default)]
struct Recorder {
    steps: Arc<Mutex<Vec<Step>>>,
}

impl Recorder {
    fn take(&self) -> Vec<Step> {
        std::mem::take(&mut *self.steps.lock())
    }
}

fn key_of(op: &Operation) -> Vec<u8> {
    match op {
        Operation::Noop => vec![],
        Operation::Insert { key, .. }
        | Operation::Update { key, .. }
        | Operation::Delete { key, .. } => key.clone(),
    }
}

impl OperationInterpreter for Recorder {
    fn apply(&self, txn: &mut Transaction<'_>, op: &Operation) -> Result<()> {
        self.steps.lock().push(Step::Apply(key_of(op)));
        SledInterpreter.apply(txn, op)
    }

    fn rollback(&self, txn: &mut Transaction<'_>, op: &Operation) -> Result<()> {
        self.steps.lock().push(Step::Rollback(key_of(op)));
        SledInterpreter.rollback(txn, op)
    }
}

const DATA_NS: &str = "test.big";

fn open_oplog() -> (Oplog<Recorder>, Recorder) {
    let store = LogStore::temporary().unwrap();
    store.create().unwrap();
    store.open().unwrap();

    let recorder = Recorder::default();
    (Oplog::new(Arc::new(store), recorder.clone()), recorder)
}

fn inserts(n: usize) -> Vec<Operation> {
    (0..n)
        .map(|i| Operation::Insert {
            ns: DATA_NS.into(),
            key: format!("k{:04}", i).into_bytes(),
            value: b"value".to_vec(),
        })
        .collect()
}

fn data_snapshot(oplog: &Oplog<Recorder>) -> Vec<(Vec<u8>, Vec<u8>)> {
    oplog
        .store()
        .db()
        .open_tree(DATA_NS)
        .unwrap()
        .iter()
        .map(|kv| {
            let (k, v) = kv.unwrap();
            (k.to_vec(), v.to_vec())
        })
        .collect()
}

/// Entry GTID=6 with 500 ops spread over 5 chunks of 100, not yet applied.
fn big_entry(oplog: &Oplog<Recorder>) -> (LogEntry, Vec<Operation>) {
    let ops = inserts(500);
    let op_len = ops[0].encoded_len().unwrap();

    let oid = oplog
        .chunks()
        .write_chunked(OverflowHandle::generate(), &ops, op_len * 100)
        .unwrap();
    let entry = LogEntry::overflow(Gtid::new(0, 6), Utc::now(), 66, oid).with_applied(false);
    oplog.replicate_entry(&entry).unwrap();

    (entry, ops)
}

#[test]
fn scenario_a_applied_entry_is_not_reexecuted() {
    let (oplog, recorder) = open_oplog();
    let gtid = Gtid::new(0, 5);

    oplog
        .writer()
        .append_entry(gtid, Utc::now(), 5, inserts(3))
        .unwrap();
    let entry = oplog.find_entry(gtid).unwrap().unwrap();
    assert!(entry.applied);

    assert_eq!(
        oplog.apply_entry(&entry).unwrap(),
        ApplyOutcome::AlreadyApplied
    );
    assert!(recorder.take().is_empty());
    assert_eq!(oplog.find_entry(gtid).unwrap(), Some(entry));
}

#[test]
fn scenario_b_overflow_apply_in_order() {
    let (oplog, recorder) = open_oplog();
    let (entry, ops) = big_entry(&oplog);

    let chunks: Vec<_> = oplog
        .chunks()
        .read_forward(*entry.overflow_handle().unwrap())
        .map(|c| c.unwrap().ops.len())
        .collect();
    assert_eq!(chunks, vec![100; 5]);

    assert_eq!(
        oplog.apply_entry(&entry).unwrap(),
        ApplyOutcome::Applied { ops: 500 }
    );

    let expected: Vec<_> = ops.iter().map(|op| Step::Apply(key_of(op))).collect();
    assert_eq!(recorder.take(), expected);
    assert!(oplog.find_entry(entry.id).unwrap().unwrap().applied);
    assert_eq!(data_snapshot(&oplog).len(), 500);
}

#[test]
fn scenario_c_rollback_in_exact_reverse() {
    let (oplog, recorder) = open_oplog();
    let (entry, ops) = big_entry(&oplog);
    oplog.apply_entry(&entry).unwrap();
    recorder.take();

    let outcome = oplog.rollback_entry(&entry, false).unwrap();
    assert_eq!(outcome.undone, 500);
    assert!(!outcome.purged);

    let steps = recorder.take();
    assert_eq!(steps.first(), Some(&Step::Rollback(b"k0499".to_vec())));
    assert_eq!(steps.last(), Some(&Step::Rollback(b"k0000".to_vec())));
    let expected: Vec<_> = ops
        .iter()
        .rev()
        .map(|op| Step::Rollback(key_of(op)))
        .collect();
    assert_eq!(steps, expected);

    assert!(!oplog.find_entry(entry.id).unwrap().unwrap().applied);
    assert_eq!(oplog.store().collections().unwrap().refs.len(), 5);
    assert!(data_snapshot(&oplog).is_empty());
}

#[test]
fn scenario_d_expiry_threshold() {
    assert_eq!(compute_expiry_threshold(2, 3), 183_600_000);
}

#[test]
fn prop_last_gtid_follows_appends() {
    let (oplog, _) = open_oplog();

    let mut gtid = Gtid::new(0, 1);
    for i in 0..50 {
        if i == 30 {
            // new primary
            gtid = Gtid::new(1, 0);
        }
        oplog
            .writer()
            .append_entry(gtid, Utc::now(), i, vec![Operation::Noop])
            .unwrap();
        assert_eq!(oplog.last_gtid().unwrap(), Some(gtid));
        gtid = gtid.next().unwrap();
    }
}

#[test]
fn prop_apply_twice_same_as_once() {
    let (oplog, _) = open_oplog();
    let (entry, _) = big_entry(&oplog);

    oplog.apply_entry(&entry).unwrap();
    let data = data_snapshot(&oplog);
    let stored = oplog.find_entry(entry.id).unwrap();

    assert_eq!(
        oplog.apply_entry(&entry).unwrap(),
        ApplyOutcome::AlreadyApplied
    );
    assert_eq!(data_snapshot(&oplog), data);
    assert_eq!(oplog.find_entry(entry.id).unwrap(), stored);
}

#[test]
fn prop_chunking_round_trips_for_any_limit() {
    let (oplog, _) = open_oplog();
    let ops: Vec<_> = (0..40)
        .map(|i| Operation::Update {
            ns: DATA_NS.into(),
            key: format!("k{}", i).into_bytes(),
            old: vec![1; i % 7],
            new: vec![2; (i * 3) % 11],
        })
        .collect();
    let total: usize = ops.iter().map(|op| op.encoded_len().unwrap()).sum();

    for limit in [1, 50, 200, 1000, total] {
        let oid = oplog
            .chunks()
            .write_chunked(OverflowHandle::generate(), &ops, limit)
            .unwrap();
        let back: Vec<_> = oplog
            .chunks()
            .forward_operations(oid)
            .map(|op| op.unwrap())
            .collect();
        assert_eq!(back, ops, "limit {limit}");
    }

    let oid = oplog
        .chunks()
        .write_chunked(OverflowHandle::generate(), &ops, total)
        .unwrap();
    assert_eq!(oplog.chunks().read_forward(oid).count(), 1);
}

#[test]
fn prop_rollback_then_apply_restores_post_apply_state() {
    let (oplog, _) = open_oplog();
    let (entry, _) = big_entry(&oplog);

    oplog.apply_entry(&entry).unwrap();
    let after_apply = data_snapshot(&oplog);

    oplog.rollback_entry(&entry, false).unwrap();
    assert!(data_snapshot(&oplog).is_empty());

    // even a copy that claims to be applied gets re-applied
    let stale = entry.clone().with_applied(true);
    assert_eq!(
        oplog.apply_entry(&stale).unwrap(),
        ApplyOutcome::Applied { ops: 500 }
    );
    assert_eq!(data_snapshot(&oplog), after_apply);
}

#[test]
fn prop_purge_leaves_nothing_readable() {
    let (oplog, _) = open_oplog();
    let (entry, _) = big_entry(&oplog);
    let oid = *entry.overflow_handle().unwrap();
    oplog.apply_entry(&entry).unwrap();

    let outcome = oplog.rollback_entry(&entry, true).unwrap();
    assert!(outcome.purged);

    assert!(oplog.find_entry(entry.id).unwrap().is_none());
    assert!(oplog.chunks().read_forward(oid).next().unwrap().is_err());
    let refs = oplog.store().collections().unwrap().refs.clone();
    assert!(refs.kv_last().unwrap().is_none());
    assert!(data_snapshot(&oplog).is_empty());
}

#[test]
fn lifecycle_delete_and_recreate() {
    let (oplog, _) = open_oplog();
    oplog
        .writer()
        .append_entry(Gtid::new(0, 1), Utc::now(), 0, vec![Operation::Noop])
        .unwrap();

    let store = oplog.store();
    store.delete().unwrap();
    assert!(!store.is_open());
    assert!(oplog.last_gtid().is_err());

    assert!(store.create().unwrap());
    store.open().unwrap();
    assert_eq!(oplog.last_gtid().unwrap(), None);
}
