//! Control-plane wire records exchanged between the master and workers.

use serde::{Deserialize, Serialize};

use crate::table::types::{TableId, WorkerId};

/// First message a worker sends after connecting: identity and how many
/// kernel invocations it accepts concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorker {
    pub id: WorkerId,
    pub slots: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Assignment {
    pub table: TableId,
    pub shard: i32,
    pub new_worker: WorkerId,
}

/// Ownership updates. Broadcast in full at startup, targeted at the victim
/// and thief when a shard moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub assignments: Vec<Assignment>,
}

/// One kernel invocation on one shard. Echoed back verbatim as the
/// completion report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunKernel {
    pub kernel: String,
    pub method: String,
    pub table: TableId,
    pub shard: i32,
    /// JSON-encoded run parameters (bincode cannot carry a self-describing
    /// value, so the JSON text travels as a string).
    pub args_json: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CheckpointCmd {
    pub epoch: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RestoreCmd {
    pub epoch: i64,
}

/// Commit record the master writes after every worker reports a finished
/// checkpoint at the epoch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: i64,
}
