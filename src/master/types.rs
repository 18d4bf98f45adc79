use std::collections::HashSet;

use crate::table::types::{TableId, WorkerId};

/// A named kernel run over one table, dispatched shard-by-shard.
#[derive(Debug, Clone)]
pub struct RunDescriptor {
    pub kernel: String,
    pub method: String,
    pub table: TableId,
    pub args: serde_json::Value,
}

impl RunDescriptor {
    pub fn new(kernel: &str, method: &str, table: TableId) -> Self {
        Self {
            kernel: kernel.to_string(),
            method: method.to_string(),
            table,
            args: serde_json::Value::Null,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn args_json(&self) -> String {
        if self.args.is_null() {
            String::new()
        } else {
            self.args.to_string()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Assigned,
    Working,
    Finished,
}

/// One kernel invocation within a run.
#[derive(Debug)]
pub struct Task {
    pub table: TableId,
    pub shard: i32,
    pub worker: WorkerId,
    pub status: TaskStatus,
}

/// The master's view of one worker.
#[derive(Debug)]
pub struct WorkerState {
    pub id: WorkerId,
    pub slots: usize,
    pub shards: HashSet<(TableId, i32)>,
}

impl WorkerState {
    pub fn new(id: WorkerId, slots: usize) -> Self {
        Self {
            id,
            slots: slots.max(1),
            shards: HashSet::new(),
        }
    }
}
