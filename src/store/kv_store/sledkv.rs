use anyhow::Result;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use sled::IVec;
use tracing::debug;

use super::KvStore;

/// One collection of the log store, backed by a sled tree.
#[derive(Clone)]
pub struct SledTree {
    name: &'static str,
    tree: sled::Tree,
}

fn to_bytes(v: IVec) -> Bytes {
    Bytes::copy_from_slice(&v)
}

fn to_pair((k, v): (IVec, IVec)) -> (Bytes, Bytes) {
    (to_bytes(k), to_bytes(v))
}

impl SledTree {
    pub fn new(name: &'static str, tree: sled::Tree) -> Self {
        Self { name, tree }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn inner(&self) -> &sled::Tree {
        &self.tree
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn get_doc<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.kv_get(key)? {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        }
    }

    /// Returns the encoded size of the document.
    pub fn set_doc<T: Serialize>(&self, key: &[u8], doc: &T) -> Result<usize> {
        let raw = serde_json::to_vec(doc)?;
        let len = raw.len();
        self.kv_set(key, raw.into())?;
        Ok(len)
    }
}

impl KvStore for SledTree {
    fn kv_get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.tree.get(key)?.map(to_bytes))
    }

    fn kv_set(&self, key: &[u8], value: Bytes) -> Result<()> {
        self.tree.insert(key, value.to_vec())?;
        Ok(())
    }

    fn kv_delete(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.tree.remove(key)?.map(to_bytes))
    }

    fn kv_delete_range(&self, start_key: &[u8], end_key: &[u8]) -> Result<usize> {
        let mut batch = sled::Batch::default();
        let mut count = 0;
        for item in self.tree.range(start_key.to_vec()..=end_key.to_vec()) {
            let (key, _) = item?;
            batch.remove(key);
            count += 1;
        }

        self.tree.apply_batch(batch)?;
        debug!("delete range in {}, {count} keys removed", self.name);

        Ok(count)
    }

    fn kv_get_next(&self, key: &[u8]) -> Result<Option<(Bytes, Bytes)>> {
        Ok(self.tree.get_gt(key)?.map(to_pair))
    }

    fn kv_get_prev_or_eq(&self, lower: &[u8], upper: &[u8]) -> Result<Option<(Bytes, Bytes)>> {
        if lower > upper {
            return Ok(None);
        }

        match self.tree.range(lower.to_vec()..=upper.to_vec()).next_back() {
            None => Ok(None),
            Some(item) => Ok(Some(to_pair(item?))),
        }
    }

    fn kv_last(&self) -> Result<Option<(Bytes, Bytes)>> {
        Ok(self.tree.last()?.map(to_pair))
    }

    fn kv_range(
        &self,
        start_key: &[u8],
        end_key: &[u8],
    ) -> Result<impl Iterator<Item = Result<(Bytes, Bytes)>>> {
        Ok(self
            .tree
            .range(start_key.to_vec()..=end_key.to_vec())
            .map(|item| item.map(to_pair).map_err(anyhow::Error::from)))
    }
}
