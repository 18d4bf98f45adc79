//! Cluster Transport Module
//!
//! Rank-addressed point-to-point messaging over TCP. Every process in the
//! cluster is a rank (0 = master, 1..=N = workers) with a fixed endpoint;
//! frames carry a message tag and an opaque bincode payload.
//!
//! ## Mechanism
//! - **Framing**: `{tag, length, payload}` frames over one TCP connection per
//!   (sender, receiver) pair, preceded by a handshake carrying the sender's
//!   rank. A single reader task per connection demultiplexes incoming frames
//!   into per-(source, tag) queues; a single writer task per peer keeps sends
//!   in program order.
//! - **Non-blocking sends**: `isend` returns a handle that can be tested for
//!   completion and cancelled before the frame reaches the socket, which is
//!   what the retransmit-on-timeout path relies on.
//! - **Probing**: `probe`/`try_recv` inspect the queues without blocking;
//!   `recv` polls with a short sleep between checks.

pub mod service;
pub mod types;

pub use service::{SendHandle, Transport};
pub use types::MsgTag;

#[cfg(test)]
mod tests;
