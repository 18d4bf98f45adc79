//! Partitioned Table Module
//!
//! Implements the distributed in-memory tables kernels compute against.
//!
//! ## Core Concepts
//! - **Sharding**: A table is split into a fixed number of shards; a sharding
//!   function maps every key to exactly one shard, and each shard has exactly
//!   one owning worker at any instant.
//! - **Buffered writes**: On a non-owner, the shard's partition is a write
//!   buffer. Updates accumulate there (combined by the table's accumulator on
//!   key collision) until a flush serializes them into delta batches for the
//!   owner.
//! - **Accumulators**: A commutative, associative combine function defines
//!   the semantics of concurrent writes to one key; the final value is the
//!   fold of all writes regardless of arrival order.
//! - **Checkpointing**: Owned shards snapshot to disk at an epoch cut; late
//!   deltas from slower peers are appended to a delta log and replayed on
//!   restore.

pub mod checkpoint;
pub mod global;
pub mod local;
pub mod protocol;
pub mod registry;
pub mod typed;
pub mod types;

pub use global::GlobalTable;
pub use local::LocalTable;
pub use registry::TableRegistry;
pub use typed::TypedTable;
pub use types::{Accumulator, Sharder, TableDescriptor};

#[cfg(test)]
mod tests;
