use std::sync::Arc;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::table::types::{ShardId, TableId};
use crate::table::{TableRegistry, TypedTable};

/// Everything a kernel invocation sees of the cluster.
pub struct KernelContext {
    tables: Arc<TableRegistry>,
    table: TableId,
    shard: ShardId,
    args: serde_json::Value,
}

impl KernelContext {
    pub fn new(
        tables: Arc<TableRegistry>,
        table: TableId,
        shard: ShardId,
        args: serde_json::Value,
    ) -> Self {
        Self {
            tables,
            table,
            shard,
            args,
        }
    }

    /// The table this invocation was dispatched against.
    pub fn current_table(&self) -> TableId {
        self.table
    }

    /// The shard this invocation owns for the duration of the run.
    pub fn current_shard(&self) -> ShardId {
        self.shard
    }

    /// Run parameters from the dispatching descriptor.
    pub fn args(&self) -> &serde_json::Value {
        &self.args
    }

    pub fn table<K, V>(&self, id: TableId) -> Result<TypedTable<K, V>>
    where
        K: Serialize + DeserializeOwned,
        V: Serialize + DeserializeOwned,
    {
        self.tables.typed(id)
    }
}
