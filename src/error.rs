use thiserror::Error;
use tracing::error;

use crate::gtid::Gtid;
use crate::model::OverflowHandle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OplogError {
    #[error("log store is not open")]
    NotOpen,
    #[error("{0} missing. did you drop it? if so restart server")]
    MissingCollection(&'static str),

    #[error("oplog entry carries neither ops nor ref")]
    EmptyEntry,
    #[error("oplog entry carries both ops and ref")]
    AmbiguousEntry,
    #[error("invalid {what} key, length: {len}")]
    InvalidKey { what: &'static str, len: usize },

    #[error("no oplog.refs chunks for {0}")]
    MissingOverflowChunks(OverflowHandle),
    #[error("oplog.refs gap for {handle}, expected seq {expected}, found {found}")]
    OverflowChunkGap {
        handle: OverflowHandle,
        expected: u64,
        found: u64,
    },
    #[error("empty operation list for overflow")]
    EmptyOverflow,
    #[error("primary returned no oplog.refs chunks for {0}")]
    RemoteChunksMissing(OverflowHandle),

    #[error("replInfo record {0} missing")]
    MissingWatermark(&'static str),

    #[error("commit failed while applying {gtid}, state unknown: {reason}")]
    ApplyCommitFailed { gtid: Gtid, reason: String },
    #[error("transaction commit failed: {0}")]
    CommitFailed(String),
}

impl OplogError {
    /// Errors in this class leave the node unable to tell what is durable,
    /// the only safe response is to stop the process.
    pub fn is_fatal(&self) -> bool {
        match self {
            OplogError::NotOpen
            | OplogError::MissingCollection(_)
            | OplogError::EmptyEntry
            | OplogError::AmbiguousEntry
            | OplogError::InvalidKey { .. }
            | OplogError::MissingOverflowChunks(_)
            | OplogError::OverflowChunkGap { .. }
            | OplogError::MissingWatermark(_)
            | OplogError::ApplyCommitFailed { .. } => true,
            OplogError::EmptyOverflow
            | OplogError::RemoteChunksMissing(_)
            | OplogError::CommitFailed(_) => false,
        }
    }
}

pub fn is_fatal(e: &anyhow::Error) -> bool {
    e.downcast_ref::<OplogError>()
        .map(OplogError::is_fatal)
        .unwrap_or(false)
}

/// Top-level handler for the unrecoverable error class. Anything else is
/// handed back to the caller.
pub fn abort_on_fatal<T>(res: anyhow::Result<T>) -> anyhow::Result<T> {
    match res {
        Err(e) if is_fatal(&e) => {
            error!("unrecoverable oplog failure, aborting system: {e:#}");
            std::process::abort();
        }
        other => other,
    }
}
