//! Errors that indicate the cluster can no longer continue correctly.
//!
//! Network-level failures are retried at the send layer and never surface
//! here; a missing key on a read is a normal `None` result. What remains are
//! protocol invariant violations: a delta routed to a worker that does not
//! own the target shard, a malformed frame on the data path, or a dispatch
//! request naming a kernel the worker never registered. These abort the
//! worker run.

use thiserror::Error;

use crate::table::types::{TableId, WorkerId};

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("delta for table {table} shard {shard} arrived at worker {worker}, owner is {owner}")]
    RoutingViolation {
        table: TableId,
        shard: i32,
        worker: WorkerId,
        owner: WorkerId,
    },

    #[error("kernel dispatched to worker {worker} for table {table} shard {shard} owned by {owner}")]
    ShardNotOwned {
        table: TableId,
        shard: i32,
        worker: WorkerId,
        owner: WorkerId,
    },

    #[error("no table registered under id {0}")]
    UnknownTable(TableId),

    #[error("no kernel registered under name '{0}'")]
    UnknownKernel(String),

    #[error("kernel '{kernel}' has no method '{method}'")]
    UnknownMethod { kernel: String, method: String },

    #[error("shard {shard} of table {table} has no assigned owner")]
    UnassignedShard { table: TableId, shard: i32 },

    #[error("malformed {what}: {source}")]
    Deserialize {
        what: &'static str,
        #[source]
        source: bincode::Error,
    },
}
