use anyhow::Result;
use bytes::Bytes;

mod locks;
mod sledkv;

pub use locks::{DbReadLock, DbWriteLock, HeldLock, LockManager, LockMode};
pub use sledkv::SledTree;

/// Ordered key-value access to one collection. Keys compare bytewise.
pub trait KvStore: Clone {
    fn kv_get(&self, key: &[u8]) -> Result<Option<Bytes>>;
    fn kv_set(&self, key: &[u8], value: Bytes) -> Result<()>;
    fn kv_delete(&self, key: &[u8]) -> Result<Option<Bytes>>;
    /// Removes `start_key..=end_key`, returns how many keys went away.
    fn kv_delete_range(&self, start_key: &[u8], end_key: &[u8]) -> Result<usize>;

    /// Smallest key strictly greater than `key`.
    fn kv_get_next(&self, key: &[u8]) -> Result<Option<(Bytes, Bytes)>>;
    /// Largest key within `lower..=upper`.
    fn kv_get_prev_or_eq(&self, lower: &[u8], upper: &[u8]) -> Result<Option<(Bytes, Bytes)>>;
    fn kv_last(&self) -> Result<Option<(Bytes, Bytes)>>;

    fn kv_range(
        &self,
        start_key: &[u8],
        end_key: &[u8],
    ) -> Result<impl Iterator<Item = Result<(Bytes, Bytes)>>>;
}
