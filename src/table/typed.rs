use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::global::GlobalTable;
use super::types::ShardId;
use crate::error::FatalError;

/// Typed facade over a [`GlobalTable`]: encodes keys and values with bincode
/// at the rim so everything below the facade moves bytes.
pub struct TypedTable<K, V> {
    inner: Arc<GlobalTable>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for TypedTable<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K, V> TypedTable<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    pub fn new(inner: Arc<GlobalTable>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub fn inner(&self) -> &Arc<GlobalTable> {
        &self.inner
    }

    pub fn num_shards(&self) -> usize {
        self.inner.num_shards()
    }

    pub fn put(&self, key: &K, value: &V) -> Result<()> {
        self.inner
            .put(bincode::serialize(key)?, bincode::serialize(value)?)
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        match self.inner.get(&bincode::serialize(key)?).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_local(&self, key: &K) -> Result<Option<V>> {
        match self.inner.get_local(&bincode::serialize(key)?)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        self.inner.contains(&bincode::serialize(key)?)
    }

    /// Decoded point-in-time copy of one shard's pairs.
    pub fn shard_pairs(&self, shard: ShardId) -> Result<Vec<(K, V)>> {
        self.inner
            .partition(shard)
            .snapshot_pairs()
            .into_iter()
            .map(|(k, v)| Ok((decode(&k)?, decode(&v)?)))
            .collect()
    }

    /// Mutate every pair of a locally-owned shard in place, bypassing the
    /// accumulator. This is how kernels rewrite their own shard's values
    /// (assignments, resets) without flowing through combine semantics.
    pub fn for_each_local_mut(&self, shard: ShardId, mut f: impl FnMut(&K, &mut V)) -> Result<()> {
        let partition = self.inner.partition(shard);
        for (key_bytes, value_bytes) in partition.snapshot_pairs() {
            let key: K = decode(&key_bytes)?;
            let mut value: V = decode(&value_bytes)?;
            f(&key, &mut value);
            partition.insert_raw(key_bytes, bincode::serialize(&value)?);
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| {
        FatalError::Deserialize {
            what: "typed table entry",
            source: e,
        }
        .into()
    })
}
