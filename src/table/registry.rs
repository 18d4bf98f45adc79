use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::global::{GlobalTable, TableRuntime};
use super::typed::TypedTable;
use super::types::{TableDescriptor, TableId};
use crate::error::FatalError;

/// Id-keyed registry of every table on this process.
///
/// Tables are created before the node enters its main loops and live for the
/// process lifetime; the worker attaches its routing context to all of them
/// once at startup.
pub struct TableRegistry {
    tables: DashMap<TableId, Arc<GlobalTable>>,
}

impl TableRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tables: DashMap::new(),
        })
    }

    pub fn create(&self, descriptor: TableDescriptor) -> Arc<GlobalTable> {
        let id = descriptor.id;
        let table = GlobalTable::new(descriptor);
        if self.tables.insert(id, table.clone()).is_some() {
            tracing::warn!("Table {} re-registered, replacing previous", id);
        }
        table
    }

    pub fn get(&self, id: TableId) -> Option<Arc<GlobalTable>> {
        self.tables.get(&id).map(|t| t.clone())
    }

    pub fn require(&self, id: TableId) -> Result<Arc<GlobalTable>> {
        self.get(id).ok_or_else(|| FatalError::UnknownTable(id).into())
    }

    pub fn typed<K, V>(&self, id: TableId) -> Result<TypedTable<K, V>>
    where
        K: Serialize + DeserializeOwned,
        V: Serialize + DeserializeOwned,
    {
        Ok(TypedTable::new(self.require(id)?))
    }

    /// All tables in id order.
    pub fn all(&self) -> Vec<Arc<GlobalTable>> {
        let mut tables: Vec<_> = self.tables.iter().map(|t| t.value().clone()).collect();
        tables.sort_by_key(|t| t.id());
        tables
    }

    pub fn attach(&self, runtime: TableRuntime) {
        for table in self.tables.iter() {
            table.value().attach(runtime.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self {
            tables: DashMap::new(),
        }
    }
}
