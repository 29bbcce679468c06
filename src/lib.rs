pub mod compactor;
pub mod config;
pub mod error;
pub mod gtid;
pub mod interpreter;
pub mod model;
pub mod oplog;
pub mod stats;
pub mod store;

pub use error::OplogError;
pub use gtid::Gtid;
pub use model::{EntryBody, LogEntry, Operation, OverflowChunk, OverflowHandle, Watermarks};
pub use oplog::Oplog;
pub use store::LogStore;
