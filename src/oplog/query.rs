use anyhow::{bail, Result};

use crate::error::OplogError;
use crate::gtid::Gtid;
use crate::model::{LogEntry, WatermarkRecord, Watermarks, MIN_LIVE_KEY, MIN_UNAPPLIED_KEY};
use crate::store::{KvStore, LogStore, Transaction, OPLOG_NS};

/// Highest GTID in the oplog, none when it is empty.
pub fn last_gtid(store: &LogStore) -> Result<Option<Gtid>> {
    let oplog = store.collections()?.oplog.clone();
    let _lk = store.locks().db_read("repl: finding last GTID in oplog");

    match oplog.kv_last()? {
        Some((key, _)) => Ok(Some(Gtid::from_key(&key)?)),
        None => Ok(None),
    }
}

pub fn gtid_exists(store: &LogStore, gtid: Gtid) -> Result<bool> {
    let oplog = store.collections()?.oplog.clone();
    let _lk = store.locks().db_read("repl: querying for GTID in oplog");

    Ok(oplog.kv_get(&gtid.to_key())?.is_some())
}

pub fn find_entry(store: &LogStore, gtid: Gtid) -> Result<Option<LogEntry>> {
    let oplog = store.collections()?.oplog.clone();
    let _lk = store.locks().db_read("repl: querying for GTID in oplog");

    oplog.get_doc(&gtid.to_key())
}

/// Both records or neither; one without the other means replInfo was
/// damaged.
pub fn load_watermarks(store: &LogStore) -> Result<Option<Watermarks>> {
    let repl_info = store.collections()?.repl_info.clone();
    let _lk = store.locks().db_read("repl: loading replInfo");

    let min_live: Option<WatermarkRecord> = repl_info.get_doc(MIN_LIVE_KEY.as_bytes())?;
    let min_unapplied: Option<WatermarkRecord> =
        repl_info.get_doc(MIN_UNAPPLIED_KEY.as_bytes())?;

    match (min_live, min_unapplied) {
        (Some(live), Some(unapplied)) => Ok(Some(Watermarks {
            min_live: live.gtid,
            min_unapplied: unapplied.gtid,
        })),
        (None, None) => Ok(None),
        (None, Some(_)) => bail!(OplogError::MissingWatermark(MIN_LIVE_KEY)),
        (Some(_), None) => bail!(OplogError::MissingWatermark(MIN_UNAPPLIED_KEY)),
    }
}

/// The applied flag as the oplog currently records it. A caller may hold a
/// stale copy of the entry; the stored one wins when present.
pub(crate) fn recorded_applied(txn: &Transaction<'_>, entry: &LogEntry) -> Result<bool> {
    match txn.get(OPLOG_NS, &entry.id.to_key())? {
        Some(raw) => {
            let stored: LogEntry = serde_json::from_slice(&raw)?;
            Ok(stored.applied)
        }
        None => Ok(entry.applied),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::Operation;
    use crate::oplog::writer::Writer;

    #[test]
    fn test_queries_on_empty_and_filled_oplog() {
        let store = LogStore::temporary().unwrap();
        store.create().unwrap();
        store.open().unwrap();

        assert_eq!(last_gtid(&store).unwrap(), None);
        assert!(load_watermarks(&store).unwrap().is_none());

        let writer = Writer::new(&store);
        for seq in [3, 1, 2] {
            writer
                .append_entry(Gtid::new(1, seq), Utc::now(), 0, vec![Operation::Noop])
                .unwrap();
        }

        assert_eq!(last_gtid(&store).unwrap(), Some(Gtid::new(1, 3)));
        assert!(gtid_exists(&store, Gtid::new(1, 2)).unwrap());
        assert!(!gtid_exists(&store, Gtid::new(1, 4)).unwrap());
        assert_eq!(
            find_entry(&store, Gtid::new(1, 1)).unwrap().unwrap().id,
            Gtid::new(1, 1)
        );
    }

    #[test]
    fn test_half_written_watermarks_are_fatal() {
        let store = LogStore::temporary().unwrap();
        store.create().unwrap();
        let colls = store.open().unwrap();

        colls
            .repl_info
            .set_doc(
                MIN_LIVE_KEY.as_bytes(),
                &WatermarkRecord {
                    id: MIN_LIVE_KEY.into(),
                    gtid: Gtid::new(0, 1),
                },
            )
            .unwrap();

        let err = load_watermarks(&store).unwrap_err();
        assert_eq!(
            err.downcast_ref::<OplogError>(),
            Some(&OplogError::MissingWatermark(MIN_UNAPPLIED_KEY))
        );
        assert!(crate::error::is_fatal(&err));
    }
}
