//! Data-path wire records.
//!
//! A [`TableDelta`] is the single envelope for everything that moves table
//! data between workers: buffered-write flushes, remote-read responses and
//! epoch markers all reuse it, distinguished by the `marker` and
//! `missing_key` fields.

use serde::{Deserialize, Serialize};

use super::types::{TableId, WorkerId};

/// A batch of (key, value) updates for one shard.
///
/// Large flushes stream as several deltas with `done = false` on all but the
/// final fragment; the `done` flag is also what clears a taint on a shard
/// whose ownership just moved. `epoch` stamps the sender's checkpoint epoch
/// so receivers can log late writes; a non-negative `marker` turns the
/// record into an epoch marker carrying no data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDelta {
    pub source: WorkerId,
    pub table: TableId,
    pub shard: i32,
    pub pairs: Vec<(Vec<u8>, Vec<u8>)>,
    pub done: bool,
    pub epoch: i64,
    pub marker: i64,
    /// Only meaningful when the envelope answers a `GetRequest`.
    pub missing_key: bool,
}

impl TableDelta {
    pub fn new(source: WorkerId, table: TableId, shard: i32, epoch: i64) -> Self {
        Self {
            source,
            table,
            shard,
            pairs: Vec::new(),
            done: false,
            epoch,
            marker: -1,
            missing_key: false,
        }
    }

    /// An epoch marker: no data, `done` set, `marker` carrying the epoch.
    pub fn epoch_marker(source: WorkerId, epoch: i64) -> Self {
        Self {
            source,
            table: -1,
            shard: -1,
            pairs: Vec::new(),
            done: true,
            epoch,
            marker: epoch,
            missing_key: false,
        }
    }

    pub fn is_marker(&self) -> bool {
        self.marker >= 0
    }

    /// Payload size of the carried pairs, used for flush budgeting.
    pub fn pair_bytes(&self) -> usize {
        self.pairs.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

/// Point remote read: answered by the shard owner with a `TableDelta`
/// carrying one pair, or `missing_key = true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub table: TableId,
    pub shard: i32,
    pub key: Vec<u8>,
}
