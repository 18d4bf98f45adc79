use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;

use crate::transport::{MsgTag, SendHandle, Transport};

/// An in-flight non-blocking send.
struct SendRequest {
    target: usize,
    tag: MsgTag,
    payload: Vec<u8>,
    handle: SendHandle,
    sent_at: Instant,
    failures: u32,
}

/// Tracks every outstanding non-blocking send for one worker.
///
/// `collect_pending` reaps completed sends and retransmits those older than
/// the network timeout with the same payload, target and tag. The sum of
/// outstanding payload bytes is the worker's `pending_network_bytes` signal.
pub struct Outbox {
    transport: Arc<Transport>,
    requests: Mutex<Vec<SendRequest>>,
    network_timeout: Duration,
}

impl Outbox {
    pub fn new(transport: Arc<Transport>, network_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            transport,
            requests: Mutex::new(Vec::new()),
            network_timeout,
        })
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn send_tracked(&self, target: usize, tag: MsgTag, payload: Vec<u8>) {
        let handle = self.transport.isend(target, tag, payload.clone());
        self.requests.lock().unwrap().push(SendRequest {
            target,
            tag,
            payload,
            handle,
            sent_at: Instant::now(),
            failures: 0,
        });
    }

    pub fn send_tracked_msg<T: Serialize>(&self, target: usize, tag: MsgTag, msg: &T) -> Result<()> {
        self.send_tracked(target, tag, bincode::serialize(msg)?);
        Ok(())
    }

    /// Drop finished sends; cancel and retransmit timed-out ones.
    pub fn collect_pending(&self) {
        let mut requests = self.requests.lock().unwrap();
        if requests.is_empty() {
            return;
        }

        let timeout = self.network_timeout;
        let transport = &self.transport;
        requests.retain_mut(|request| {
            if request.handle.is_finished() {
                if request.failures > 0 {
                    tracing::info!(
                        "Send of {} bytes to rank {} succeeded after {} failure(s)",
                        request.payload.len(),
                        request.target,
                        request.failures
                    );
                }
                return false;
            }
            if request.sent_at.elapsed() > timeout {
                tracing::warn!(
                    "Send of {} bytes to rank {} timed out, retransmitting",
                    request.payload.len(),
                    request.target
                );
                request.handle.cancel();
                request.failures += 1;
                request.handle =
                    transport.isend(request.target, request.tag, request.payload.clone());
                request.sent_at = Instant::now();
            }
            true
        });
    }

    /// Payload bytes of every send not yet confirmed written.
    pub fn pending_bytes(&self) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.payload.len())
            .sum()
    }

    pub fn outstanding(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}
