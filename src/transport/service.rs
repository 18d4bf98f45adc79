use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use super::types::MsgTag;
use crate::error::FatalError;

/// Frames larger than this are treated as protocol corruption.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

const CONNECT_RETRY: Duration = Duration::from_millis(100);

struct OutFrame {
    tag: MsgTag,
    payload: Vec<u8>,
    done: oneshot::Sender<()>,
    cancelled: Arc<AtomicBool>,
}

/// Completion handle for a non-blocking send.
///
/// `is_finished` reports whether the frame has been written to the socket.
/// `cancel` marks a frame that has not yet been written as dead; the writer
/// skips it, and the handle never completes.
pub struct SendHandle {
    done: oneshot::Receiver<()>,
    finished: bool,
    cancelled: Arc<AtomicBool>,
}

impl SendHandle {
    pub fn is_finished(&mut self) -> bool {
        if self.finished {
            return true;
        }
        match self.done.try_recv() {
            Ok(()) => {
                self.finished = true;
                true
            }
            Err(_) => false,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Point-to-point transport for one cluster process.
///
/// All processes share the same endpoint table; `endpoints[rank]` is the
/// address this process listens on. Outbound connections are opened lazily on
/// first send to a peer (the self-rank included; markers and self-reads loop
/// back through the listener like any other traffic).
pub struct Transport {
    rank: usize,
    endpoints: Vec<SocketAddr>,
    inbox: DashMap<(usize, u8), VecDeque<Vec<u8>>>,
    writers: Mutex<HashMap<usize, mpsc::UnboundedSender<OutFrame>>>,
    poll_interval: Duration,
    delay_next_send_ms: AtomicU64,
}

impl Transport {
    /// Bind the listener for `rank` and start accepting peer connections.
    pub async fn bind(
        rank: usize,
        endpoints: Vec<SocketAddr>,
        poll_interval: Duration,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(endpoints[rank]).await?;
        Ok(Self::with_listener(rank, endpoints, listener, poll_interval))
    }

    /// Same as [`Transport::bind`] but with a pre-bound listener, so test
    /// clusters can allocate ephemeral ports before the endpoint table is
    /// assembled.
    pub fn with_listener(
        rank: usize,
        endpoints: Vec<SocketAddr>,
        listener: TcpListener,
        poll_interval: Duration,
    ) -> Arc<Self> {
        let transport = Arc::new(Self {
            rank,
            endpoints,
            inbox: DashMap::new(),
            writers: Mutex::new(HashMap::new()),
            poll_interval,
            delay_next_send_ms: AtomicU64::new(0),
        });

        let accept = transport.clone();
        tokio::spawn(async move {
            accept.accept_loop(listener).await;
        });

        transport
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn cluster_size(&self) -> usize {
        self.endpoints.len()
    }

    pub fn num_workers(&self) -> usize {
        self.endpoints.len() - 1
    }

    /// Delay the next frame written by any writer task. Test hook for the
    /// send-timeout path.
    pub fn delay_next_send(&self, delay: Duration) {
        self.delay_next_send_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let reader = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = reader.connection_loop(stream).await {
                            tracing::debug!("Peer connection closed: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
            }
        }
    }

    async fn connection_loop(self: Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let source = stream.read_u32().await? as usize;

        loop {
            let tag = stream.read_u8().await?;
            let len = stream.read_u32().await?;
            if len > MAX_FRAME_BYTES {
                anyhow::bail!("frame of {} bytes from rank {} exceeds limit", len, source);
            }
            let mut payload = vec![0u8; len as usize];
            stream.read_exact(&mut payload).await?;

            self.inbox
                .entry((source, tag))
                .or_default()
                .push_back(payload);
        }
    }

    fn writer_for(self: &Arc<Self>, peer: usize) -> mpsc::UnboundedSender<OutFrame> {
        let mut writers = self.writers.lock().unwrap();
        writers
            .entry(peer)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let transport = self.clone();
                tokio::spawn(async move {
                    transport.writer_loop(peer, rx).await;
                });
                tx
            })
            .clone()
    }

    async fn connect(&self, peer: usize) -> TcpStream {
        loop {
            match TcpStream::connect(self.endpoints[peer]).await {
                Ok(mut stream) => {
                    if stream.write_u32(self.rank as u32).await.is_ok() {
                        return stream;
                    }
                }
                Err(e) => {
                    tracing::warn!("Connect to rank {} failed: {}, retrying", peer, e);
                }
            }
            tokio::time::sleep(CONNECT_RETRY).await;
        }
    }

    async fn writer_loop(self: Arc<Self>, peer: usize, mut rx: mpsc::UnboundedReceiver<OutFrame>) {
        let mut stream = self.connect(peer).await;

        while let Some(frame) = rx.recv().await {
            let delay = self.delay_next_send_ms.swap(0, Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if frame.cancelled.load(Ordering::SeqCst) {
                continue;
            }

            loop {
                match Self::write_frame(&mut stream, &frame).await {
                    Ok(()) => {
                        let _ = frame.done.send(());
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Write to rank {} failed: {}, reconnecting", peer, e);
                        stream = self.connect(peer).await;
                        if frame.cancelled.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn write_frame(stream: &mut TcpStream, frame: &OutFrame) -> std::io::Result<()> {
        stream.write_u8(frame.tag as u8).await?;
        stream.write_u32(frame.payload.len() as u32).await?;
        stream.write_all(&frame.payload).await?;
        stream.flush().await
    }

    /// Non-blocking send; the returned handle tracks socket completion.
    pub fn isend(self: &Arc<Self>, peer: usize, tag: MsgTag, payload: Vec<u8>) -> SendHandle {
        let (done_tx, done_rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let frame = OutFrame {
            tag,
            payload,
            done: done_tx,
            cancelled: cancelled.clone(),
        };
        // An unbounded enqueue never fails while the writer task lives.
        let _ = self.writer_for(peer).send(frame);
        SendHandle {
            done: done_rx,
            finished: false,
            cancelled,
        }
    }

    /// Ordered, buffered send without completion tracking.
    pub fn send(self: &Arc<Self>, peer: usize, tag: MsgTag, payload: Vec<u8>) {
        let _ = self.isend(peer, tag, payload);
    }

    pub fn send_msg<T: Serialize>(self: &Arc<Self>, peer: usize, tag: MsgTag, msg: &T) -> Result<()> {
        let payload = bincode::serialize(msg)?;
        self.send(peer, tag, payload);
        Ok(())
    }

    /// Send `msg` to every worker rank (1..=N).
    pub fn broadcast_msg<T: Serialize>(self: &Arc<Self>, tag: MsgTag, msg: &T) -> Result<()> {
        let payload = bincode::serialize(msg)?;
        for rank in 1..self.endpoints.len() {
            self.send(rank, tag, payload.clone());
        }
        Ok(())
    }

    /// Non-blocking check for an available message: `Some((source, size))`.
    pub fn probe(&self, peer: Option<usize>, tag: MsgTag) -> Option<(usize, usize)> {
        match peer {
            Some(p) => self
                .inbox
                .get(&(p, tag as u8))
                .and_then(|q| q.front().map(|b| (p, b.len()))),
            None => {
                for entry in self.inbox.iter() {
                    let (source, t) = *entry.key();
                    if t == tag as u8 {
                        if let Some(b) = entry.value().front() {
                            return Some((source, b.len()));
                        }
                    }
                }
                None
            }
        }
    }

    pub fn try_recv(&self, peer: Option<usize>, tag: MsgTag) -> Option<(usize, Vec<u8>)> {
        match peer {
            Some(p) => self
                .inbox
                .get_mut(&(p, tag as u8))
                .and_then(|mut q| q.pop_front().map(|b| (p, b))),
            None => {
                for mut entry in self.inbox.iter_mut() {
                    let (source, t) = *entry.key();
                    if t == tag as u8 {
                        if let Some(b) = entry.value_mut().pop_front() {
                            return Some((source, b));
                        }
                    }
                }
                None
            }
        }
    }

    /// Polling receive: check, sleep, repeat.
    pub async fn recv(&self, peer: Option<usize>, tag: MsgTag) -> (usize, Vec<u8>) {
        loop {
            if let Some(found) = self.try_recv(peer, tag) {
                return found;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Typed non-blocking receive. A payload that does not deserialize is a
    /// protocol violation, not a recoverable condition.
    pub fn try_read<T: DeserializeOwned>(
        &self,
        peer: Option<usize>,
        tag: MsgTag,
    ) -> Result<Option<(usize, T)>> {
        match self.try_recv(peer, tag) {
            None => Ok(None),
            Some((source, payload)) => {
                let msg = bincode::deserialize(&payload).map_err(|e| FatalError::Deserialize {
                    what: "message payload",
                    source: e,
                })?;
                Ok(Some((source, msg)))
            }
        }
    }

    /// Typed polling receive.
    pub async fn read<T: DeserializeOwned>(
        &self,
        peer: Option<usize>,
        tag: MsgTag,
    ) -> Result<(usize, T)> {
        loop {
            if let Some(found) = self.try_read(peer, tag)? {
                return Ok(found);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
