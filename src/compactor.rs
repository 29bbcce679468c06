use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwapOption;
use chrono::prelude::*;
use parking_lot::Mutex;
use tokio::{select, sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use crate::config::{
    DEFAULT_COMPACTION_INTERVAL_SECS, DEFAULT_COMPACTION_TIMEOUT_MS, DEFAULT_EXPIRE_OPLOG_DAYS,
    DEFAULT_EXPIRE_OPLOG_HOURS,
};
use crate::error::abort_on_fatal;
use crate::gtid::Gtid;
use crate::oplog::{compute_expiry_threshold, RetentionManager};
use crate::store::LogStore;

/// Finds entries past the retention window and compacts up to them.
/// Returns the boundary and the number of steps taken, none when nothing
/// has expired or expiry is turned off.
pub fn compact_expired(
    store: &LogStore,
    now: DateTime<Utc>,
    threshold_ms: u64,
    timeout: Duration,
) -> Result<Option<(Gtid, u64)>> {
    if threshold_ms == 0 {
        return Ok(None);
    }

    let retention = RetentionManager::new(store);
    let Some(boundary) = retention.expired_boundary(now, threshold_ms)? else {
        debug!("no expired oplog entries");
        return Ok(None);
    };

    let steps = retention.compact_up_to(boundary, timeout)?;
    Ok(Some((boundary, steps)))
}

/// Periodic retention pass over the oplog, run on the tokio runtime with
/// the compaction itself on the blocking pool.
#[derive(TypedBuilder)]
pub struct Compactor {
    store: Arc<LogStore>,

    #[builder(default = DEFAULT_EXPIRE_OPLOG_DAYS)]
    expire_days: u64,
    #[builder(default = DEFAULT_EXPIRE_OPLOG_HOURS)]
    expire_hours: u64,
    #[builder(default_code = r#"Duration::from_secs(DEFAULT_COMPACTION_INTERVAL_SECS)"#)]
    interval: Duration,
    #[builder(default_code = r#"Duration::from_millis(DEFAULT_COMPACTION_TIMEOUT_MS)"#)]
    timeout: Duration,

    #[builder(default)]
    stop_ch: ArcSwapOption<mpsc::Sender<()>>,
    #[builder(default)]
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Compactor {
    pub fn threshold_ms(&self) -> u64 {
        compute_expiry_threshold(self.expire_days, self.expire_hours)
    }

    pub fn is_running(&self) -> bool {
        self.stop_ch.load().is_some()
    }

    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.is_running() {
            warn!("compactor already running");
            return;
        }

        let (tx, mut rx) = mpsc::channel(1);
        self.stop_ch.store(Some(Arc::new(tx)));

        let store = self.store.clone();
        let threshold = self.threshold_ms();
        let timeout = self.timeout;
        let mut ticker = tokio::time::interval(self.interval);

        info!(
            "start compactor, interval: {:?}, expire after {} ms",
            self.interval, threshold
        );
        let handle = tokio::spawn(async move {
            loop {
                select! {
                    _ = rx.recv() => {
                        break;
                    }
                    _ = ticker.tick() => {
                        let store = store.clone();
                        let res = tokio::task::spawn_blocking(move || {
                            compact_expired(&store, Utc::now(), threshold, timeout)
                        })
                        .await;

                        match res {
                            Ok(Ok(Some((boundary, steps)))) => {
                                info!("compacted expired oplog up to {boundary} in {steps} steps");
                            }
                            Ok(Ok(None)) => {}
                            Ok(Err(e)) => {
                                if let Err(e) = abort_on_fatal::<()>(Err(e)) {
                                    warn!("oplog compaction failed, retry next tick: {e:#}");
                                }
                            }
                            Err(e) => {
                                error!("oplog compaction task failed: {e}");
                            }
                        }
                    }
                }
            }

            info!("compactor stopped ...");
        });

        *self.handle.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.stop_ch.swap(None) {
            let _ = tx.send(()).await;
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("failed to join compactor, err: {}", e);
            }
        }
    }
}
