//! Kernel Execution Module
//!
//! Kernels are user computations invoked on (table, shard) pairs. They are
//! registered by name with a factory; the worker lazily creates one instance
//! per (kernel, table, shard) on first dispatch and keeps it until shutdown,
//! so re-running a kernel on the same shard reuses its state.
//!
//! Kernel code touches cluster state only through the [`KernelContext`]:
//! typed table handles, the current shard index, and the run's parameters.

pub mod context;
pub mod registry;

pub use context::KernelContext;
pub use registry::{Kernel, KernelRegistry};
