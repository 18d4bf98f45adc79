use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::FatalError;

pub type TableId = i32;
pub type ShardId = usize;
/// Worker ids are 0-based; −1 marks an unassigned shard.
pub type WorkerId = i32;

pub const UNASSIGNED: WorkerId = -1;

type CombineFn = Arc<dyn Fn(&[u8], &[u8]) -> Result<Vec<u8>> + Send + Sync>;
type ShardFn = Arc<dyn Fn(&[u8], usize) -> Result<usize> + Send + Sync>;

/// Combine function applied when two writes to the same key meet, in a write
/// buffer or on arrival at the owner. Must be commutative and associative.
///
/// The well-known variants operate on bincode-encoded scalars; `Custom`
/// carries an opaque user function over encoded values (built with
/// [`Accumulator::custom`] for typed ones).
#[derive(Clone)]
pub enum Accumulator {
    Replace,
    SumI64,
    SumF64,
    MinI64,
    MinF64,
    MaxI64,
    MaxF64,
    Custom(CombineFn),
}

impl Accumulator {
    /// Wrap a typed combine function into an accumulator over encoded values.
    pub fn custom<V, F>(f: F) -> Self
    where
        V: Serialize + DeserializeOwned,
        F: Fn(V, V) -> V + Send + Sync + 'static,
    {
        Accumulator::Custom(Arc::new(move |a, b| {
            let left: V = decode(a)?;
            let right: V = decode(b)?;
            Ok(bincode::serialize(&f(left, right))?)
        }))
    }

    /// Fold `incoming` into `current`, producing the merged encoded value.
    pub fn combine(&self, current: &[u8], incoming: &[u8]) -> Result<Vec<u8>> {
        match self {
            Accumulator::Replace => Ok(incoming.to_vec()),
            Accumulator::SumI64 => merge::<i64>(current, incoming, |a, b| a + b),
            Accumulator::SumF64 => merge::<f64>(current, incoming, |a, b| a + b),
            Accumulator::MinI64 => merge::<i64>(current, incoming, |a, b| a.min(b)),
            Accumulator::MinF64 => merge::<f64>(current, incoming, |a, b| a.min(b)),
            Accumulator::MaxI64 => merge::<i64>(current, incoming, |a, b| a.max(b)),
            Accumulator::MaxF64 => merge::<f64>(current, incoming, |a, b| a.max(b)),
            Accumulator::Custom(f) => f(current, incoming),
        }
    }
}

impl fmt::Debug for Accumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Accumulator::Replace => "Replace",
            Accumulator::SumI64 => "SumI64",
            Accumulator::SumF64 => "SumF64",
            Accumulator::MinI64 => "MinI64",
            Accumulator::MinF64 => "MinF64",
            Accumulator::MaxI64 => "MaxI64",
            Accumulator::MaxF64 => "MaxF64",
            Accumulator::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

fn merge<V>(current: &[u8], incoming: &[u8], f: impl Fn(V, V) -> V) -> Result<Vec<u8>>
where
    V: Serialize + DeserializeOwned,
{
    let left: V = decode(current)?;
    let right: V = decode(incoming)?;
    Ok(bincode::serialize(&f(left, right))?)
}

fn decode<V: DeserializeOwned>(bytes: &[u8]) -> Result<V> {
    bincode::deserialize(bytes).map_err(|e| {
        FatalError::Deserialize {
            what: "table value",
            source: e,
        }
        .into()
    })
}

/// Maps a key to the shard that owns it.
#[derive(Clone)]
pub enum Sharder {
    /// Key decoded as a bincode `i64`, sharded by modulo.
    Mod,
    /// Hash of the raw key bytes, modulo the shard count.
    Hash,
    Custom(ShardFn),
}

impl Sharder {
    pub fn custom<K, F>(f: F) -> Self
    where
        K: DeserializeOwned,
        F: Fn(&K, usize) -> usize + Send + Sync + 'static,
    {
        Sharder::Custom(Arc::new(move |key, shards| {
            let key: K = decode(key)?;
            Ok(f(&key, shards))
        }))
    }

    pub fn shard(&self, key: &[u8], num_shards: usize) -> Result<ShardId> {
        match self {
            Sharder::Mod => {
                let k: i64 = decode(key)?;
                Ok(k.rem_euclid(num_shards as i64) as ShardId)
            }
            Sharder::Hash => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                key.hash(&mut hasher);
                Ok((hasher.finish() % num_shards as u64) as ShardId)
            }
            Sharder::Custom(f) => Ok(f(key, num_shards)? % num_shards),
        }
    }
}

impl fmt::Debug for Sharder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Sharder::Mod => "Mod",
            Sharder::Hash => "Hash",
            Sharder::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

/// Everything a table declares at registration time.
#[derive(Clone, Debug)]
pub struct TableDescriptor {
    pub id: TableId,
    pub num_shards: usize,
    pub sharder: Sharder,
    pub accumulator: Accumulator,
}

impl TableDescriptor {
    pub fn new(id: TableId, num_shards: usize, sharder: Sharder, accumulator: Accumulator) -> Self {
        Self {
            id,
            num_shards,
            sharder,
            accumulator,
        }
    }
}
