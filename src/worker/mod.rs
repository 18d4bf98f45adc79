//! Worker Engine Module
//!
//! The per-process engine that executes kernels against locally-owned shards
//! and services the data plane for its peers.
//!
//! ## Architecture
//! Two cooperating loops run as separate tasks so a kernel blocked on a
//! remote read can never deadlock with a peer reading our shards:
//! - **Kernel loop**: dequeues dispatch requests, runs the kernel, flushes
//!   every table's buffered writes, and drains the network to quiescence
//!   before reporting completion.
//! - **Table loop**: answers remote point reads, deferring requests against
//!   tainted shards until the previous owner's final delta lands.
//!
//! Every non-blocking send is tracked; sends that do not complete within the
//! network timeout are cancelled and retransmitted with the same payload.
//! Epoch markers received on the data channels drive the distributed
//! checkpoint cut.

pub mod engine;
pub mod outbox;

pub use engine::Worker;
pub use outbox::Outbox;
