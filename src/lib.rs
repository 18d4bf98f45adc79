//! Distributed Partitioned Tables Library
//!
//! This library crate defines the core of a distributed in-memory key-value
//! store coupled with a kernel execution runtime: user computations run on
//! the worker that owns a shard, writes to remote shards are buffered and
//! flushed as accumulated deltas at kernel boundaries, and the master drives
//! dispatch, work stealing and distributed checkpoints.
//!
//! ## Architecture Modules
//!
//! - **`transport`**: rank-addressed point-to-point messaging with tags,
//!   non-blocking send handles, and probe-for-available over TCP.
//! - **`table`**: the partitioned-table runtime: sharding and accumulator
//!   registry, per-shard local storage, owner routing, buffered remote
//!   writes, and checkpoint snapshots with delta logs.
//! - **`kernel`**: named kernel registration and the execution context
//!   kernels see the cluster through.
//! - **`worker`**: the two-loop engine executing kernels and serving the
//!   data plane, with tracked sends and epoch handling.
//! - **`master`**: shard assignment, kernel dispatch, idle-worker stealing,
//!   and checkpoint/restore orchestration.

pub mod config;
pub mod error;

#[cfg(test)]
pub(crate) mod testutil;
pub mod kernel;
pub mod master;
pub mod table;
pub mod transport;
pub mod worker;
