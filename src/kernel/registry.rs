use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

use super::context::KernelContext;

/// A user computation bound to one shard of one table.
///
/// `invoke` dispatches on the method name from the run descriptor; an
/// unrecognized name must be reported as an error (the task is malformed, and
/// the worker treats it as fatal).
#[async_trait]
pub trait Kernel: Send {
    /// Called once, after the instance is created for its (table, shard).
    async fn init(&mut self, _ctx: &KernelContext) -> Result<()> {
        Ok(())
    }

    async fn invoke(&mut self, method: &str, ctx: &KernelContext) -> Result<()>;
}

pub type KernelFactory = Arc<dyn Fn() -> Box<dyn Kernel> + Send + Sync>;

/// Named kernel factories, registered before the worker enters its loops.
pub struct KernelRegistry {
    kernels: DashMap<String, KernelFactory>,
}

impl KernelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            kernels: DashMap::new(),
        })
    }

    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Kernel> + Send + Sync + 'static,
    {
        self.kernels.insert(name.to_string(), Arc::new(factory));
        tracing::info!("Registered kernel: {}", name);
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn Kernel>> {
        self.kernels.get(name).map(|factory| factory.value()())
    }

    pub fn has_kernel(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self {
            kernels: DashMap::new(),
        }
    }
}
