//! Master Controller Module
//!
//! Rank 0 of the cluster. The master is the authority on shard ownership:
//! it collects worker registrations, assigns every shard round-robin at
//! startup, and broadcasts the assignment before any kernel is dispatched.
//!
//! ## Responsibilities
//! - **Dispatch**: `run_one` / `run_all` / `run_range` expand a run
//!   descriptor into per-shard tasks, keep at most `slots` in flight per
//!   worker, and block until every task reports done.
//! - **Work stealing**: a worker with nothing left to run takes an unstarted
//!   task from the most loaded peer, shard ownership moving with it.
//! - **Checkpoint orchestration**: epoch broadcast, completion collection,
//!   commit records, pruning, and restore.

pub mod controller;
pub mod protocol;
pub mod types;

pub use controller::Master;
pub use types::RunDescriptor;

#[cfg(test)]
mod tests;
