use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::config::Config;
use crate::error::FatalError;
use crate::kernel::{Kernel, KernelContext, KernelRegistry};
use crate::master::protocol::{
    CheckpointCmd, RegisterWorker, RestoreCmd, RunKernel, ShardAssignment,
};
use crate::table::protocol::{GetRequest, TableDelta};
use crate::table::types::{ShardId, TableId, WorkerId, UNASSIGNED};
use crate::table::GlobalTable;
use crate::table::global::TableRuntime;
use crate::table::TableRegistry;
use crate::transport::types::{rank_of_worker, MASTER_RANK};
use crate::transport::{MsgTag, Transport};

use super::outbox::Outbox;

const STATS_INTERVAL: Duration = Duration::from_secs(10);
const MISS_LIMIT: u32 = 1000;

/// A peer worker as seen from here: identity plus the last epoch marker
/// received on its data channel.
struct PeerStub {
    id: WorkerId,
    epoch: AtomicI64,
}

#[derive(Default)]
struct Stats {
    puts_in: AtomicU64,
    gets_in: AtomicU64,
    bytes_in: AtomicU64,
}

type KernelKey = (String, TableId, ShardId);

/// One worker process: owns a subset of every table's shards, executes
/// kernels against them, and exchanges deltas with its peers.
pub struct Worker {
    worker_id: WorkerId,
    config: Config,
    transport: Arc<Transport>,
    outbox: Arc<Outbox>,
    tables: Arc<TableRegistry>,
    kernels: Arc<KernelRegistry>,
    instances: tokio::sync::Mutex<HashMap<KernelKey, Box<dyn Kernel>>>,
    peers: Vec<PeerStub>,
    epoch: Arc<AtomicI64>,
    checkpoint_pending: AtomicBool,
    running: AtomicBool,
    kernel_queue: Mutex<VecDeque<RunKernel>>,
    kernel_done: Mutex<Vec<RunKernel>>,
    stats: Stats,
}

impl Worker {
    /// Build the worker for this process's rank, attach the routing context
    /// to every registered table, and announce ourselves to the master.
    pub fn new(
        config: Config,
        transport: Arc<Transport>,
        tables: Arc<TableRegistry>,
        kernels: Arc<KernelRegistry>,
    ) -> Result<Arc<Self>> {
        let worker_id = transport.rank() as WorkerId - 1;
        let outbox = Outbox::new(transport.clone(), config.network_timeout);
        let epoch = Arc::new(AtomicI64::new(0));

        tables.attach(TableRuntime {
            worker_id,
            outbox: outbox.clone(),
            epoch: epoch.clone(),
        });

        let peers = (0..transport.num_workers() as WorkerId)
            .map(|id| PeerStub {
                id,
                epoch: AtomicI64::new(0),
            })
            .collect();

        tracing::info!("Worker {} registering", worker_id);
        transport.send_msg(
            MASTER_RANK,
            MsgTag::RegisterWorker,
            &RegisterWorker {
                id: worker_id,
                slots: config.slots,
            },
        )?;

        Ok(Arc::new(Self {
            worker_id,
            config,
            transport,
            outbox,
            tables,
            kernels,
            instances: tokio::sync::Mutex::new(HashMap::new()),
            peers,
            epoch,
            checkpoint_pending: AtomicBool::new(false),
            running: AtomicBool::new(true),
            kernel_queue: Mutex::new(VecDeque::new()),
            kernel_done: Mutex::new(Vec::new()),
            stats: Stats::default(),
        }))
    }

    pub fn id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn epoch(&self) -> i64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run both loops until shutdown. The table loop services remote reads on
    /// its own task so a kernel blocked on a remote read cannot deadlock with
    /// a peer reading our shards.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!("Worker {} entering main loops", self.worker_id);

        let table_task = tokio::spawn(self.clone().table_loop());
        let kernel_result = self.clone().kernel_loop().await;
        self.running.store(false, Ordering::SeqCst);

        let table_result = table_task
            .await
            .map_err(|e| anyhow!("table loop panicked: {}", e))?;

        tracing::info!(
            "Worker {} exiting (puts_in={}, gets_in={}, bytes_in={})",
            self.worker_id,
            self.stats.puts_in.load(Ordering::Relaxed),
            self.stats.gets_in.load(Ordering::Relaxed),
            self.stats.bytes_in.load(Ordering::Relaxed),
        );
        kernel_result.and(table_result)
    }

    async fn table_loop(self: Arc<Self>) -> Result<()> {
        let result = self.table_loop_inner().await;
        if let Err(ref e) = result {
            tracing::error!("Worker {} table loop failed: {:#}", self.worker_id, e);
            self.running.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn table_loop_inner(&self) -> Result<()> {
        let mut deferred: VecDeque<(usize, GetRequest)> = VecDeque::new();
        let mut miss = 0u32;
        let mut last_stats = Instant::now();

        while self.is_running() {
            if last_stats.elapsed() > STATS_INTERVAL {
                tracing::info!(
                    "Worker {}: pending network {} bytes, rss {} MB",
                    self.worker_id,
                    self.pending_network_bytes(),
                    memory_rss_mb()
                );
                last_stats = Instant::now();
            }

            if self.handle_get_requests(&mut deferred)? {
                miss = 0;
                tokio::task::yield_now().await;
            } else {
                miss += 1;
                if miss > MISS_LIMIT {
                    tokio::time::sleep(self.config.sleep_time).await;
                    miss = 0;
                } else {
                    tokio::task::yield_now().await;
                }
            }
        }
        Ok(())
    }

    async fn kernel_loop(self: Arc<Self>) -> Result<()> {
        let result = self.kernel_loop_inner().await;
        if let Err(ref e) = result {
            tracing::error!("Worker {} kernel loop failed: {:#}", self.worker_id, e);
        }
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn kernel_loop_inner(&self) -> Result<()> {
        while self.is_running() {
            let next = self.kernel_queue.lock().unwrap().pop_front();
            let Some(request) = next else {
                self.handle_put_requests()?;
                self.check_master_updates()?;
                tokio::time::sleep(self.config.sleep_time).await;
                continue;
            };

            tracing::debug!(
                "Worker {} running {}::{} on table {} shard {}",
                self.worker_id,
                request.kernel,
                request.method,
                request.table,
                request.shard
            );
            // Apply whatever already landed so the kernel reads post-barrier
            // state.
            self.handle_put_requests()?;
            self.run_kernel(&request).await?;

            // Flush leftover table updates, then drain to quiescence before
            // reporting the kernel finished.
            for table in self.tables.all() {
                table.send_updates()?;
            }
            self.handle_put_requests()?;
            while self.pending_network_bytes() > 0 {
                self.handle_put_requests()?;
                tokio::time::sleep(self.config.sleep_time).await;
            }

            self.kernel_done.lock().unwrap().push(request);
        }
        Ok(())
    }

    async fn run_kernel(&self, request: &RunKernel) -> Result<()> {
        let table = self.tables.require(request.table)?;
        let shard = request.shard as ShardId;
        let owner = table.owner(shard);
        if owner != self.worker_id {
            return Err(FatalError::ShardNotOwned {
                table: request.table,
                shard: request.shard,
                worker: self.worker_id,
                owner,
            }
            .into());
        }

        let args = if request.args_json.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&request.args_json)?
        };
        let ctx = KernelContext::new(self.tables.clone(), request.table, shard, args);

        let key: KernelKey = (request.kernel.clone(), request.table, shard);
        let mut instances = self.instances.lock().await;
        if !instances.contains_key(&key) {
            let mut kernel = self
                .kernels
                .create(&request.kernel)
                .ok_or_else(|| FatalError::UnknownKernel(request.kernel.clone()))?;
            kernel.init(&ctx).await?;
            instances.insert(key.clone(), kernel);
        }

        if !self.config.kernel_delay.is_zero() {
            tokio::time::sleep(self.config.kernel_delay).await;
        }

        let kernel = instances.get_mut(&key).expect("instance just inserted");
        kernel.invoke(&request.method, &ctx).await
    }

    pub fn pending_network_bytes(&self) -> usize {
        self.outbox.pending_bytes()
    }

    fn network_idle(&self) -> bool {
        self.pending_network_bytes() == 0
    }

    /// Service every available PUT delta, routing epoch markers to the
    /// checkpoint machinery and logging late writes for recovery.
    fn handle_put_requests(&self) -> Result<()> {
        self.outbox.collect_pending();

        while let Some((_, delta)) = self
            .transport
            .try_read::<TableDelta>(None, MsgTag::PutRequest)?
        {
            if delta.is_marker() {
                self.update_epoch(delta.source, delta.marker)?;
                continue;
            }

            self.stats.puts_in.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_in
                .fetch_add(delta.pair_bytes() as u64, Ordering::Relaxed);

            let table = self.tables.require(delta.table)?;
            table.apply_updates(&delta)?;

            // Peers that have not reached our epoch yet are still sending
            // pre-cut writes; those must be replayable after recovery.
            if delta.epoch < self.epoch() {
                table.write_delta(&delta)?;
            }

            let shard = delta.shard as ShardId;
            if delta.done && table.tainted(shard) {
                tracing::debug!(
                    "Worker {} clearing taint on table {} shard {}",
                    self.worker_id,
                    delta.table,
                    delta.shard
                );
                table.clear_tainted(shard);
            }
        }
        Ok(())
    }

    /// Answer remote reads. Requests against tainted shards are deferred
    /// until the previous owner's final delta arrives; everything else is
    /// answered from local state, missing keys included.
    fn handle_get_requests(&self, deferred: &mut VecDeque<(usize, GetRequest)>) -> Result<bool> {
        let mut did_work = false;

        for _ in 0..deferred.len() {
            let (source, request) = deferred.pop_front().expect("deferred non-empty");
            if self.try_serve_get(source, request, deferred)? {
                did_work = true;
            }
        }

        while let Some((source, request)) = self
            .transport
            .try_read::<GetRequest>(None, MsgTag::GetRequest)?
        {
            if self.try_serve_get(source, request, deferred)? {
                did_work = true;
            }
        }

        Ok(did_work)
    }

    fn try_serve_get(
        &self,
        source: usize,
        request: GetRequest,
        deferred: &mut VecDeque<(usize, GetRequest)>,
    ) -> Result<bool> {
        let table = self.tables.require(request.table)?;
        if request.shard >= 0 && table.tainted(request.shard as ShardId) {
            deferred.push_back((source, request));
            return Ok(false);
        }

        self.stats.gets_in.fetch_add(1, Ordering::Relaxed);

        let mut response = TableDelta::new(self.worker_id, request.table, request.shard, self.epoch());
        response.done = true;
        if table.contains(&request.key)? {
            let value = table.get_local(&request.key)?.unwrap_or_default();
            response.pairs.push((request.key, value));
        } else {
            response.missing_key = true;
        }

        self.outbox
            .send_tracked_msg(source, MsgTag::GetResponse, &response)?;
        Ok(true)
    }

    /// Drain control traffic from the master: shutdown, checkpoint and
    /// restore commands, ownership updates, new kernel requests. Completion
    /// reports only leave once the network is idle, so a reported kernel is
    /// a quiescent kernel.
    fn check_master_updates(&self) -> Result<()> {
        if self
            .transport
            .try_recv(Some(MASTER_RANK), MsgTag::WorkerShutdown)
            .is_some()
        {
            tracing::info!("Worker {} shutting down", self.worker_id);
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        }

        while let Some((_, cmd)) = self
            .transport
            .try_read::<CheckpointCmd>(Some(MASTER_RANK), MsgTag::Checkpoint)?
        {
            self.checkpoint(cmd.epoch)?;
        }

        while let Some((_, cmd)) = self
            .transport
            .try_read::<RestoreCmd>(Some(MASTER_RANK), MsgTag::Restore)?
        {
            self.restore(cmd.epoch)?;
        }

        while let Some((_, assignment)) = self
            .transport
            .try_read::<ShardAssignment>(Some(MASTER_RANK), MsgTag::ShardAssignment)?
        {
            self.apply_assignments(assignment)?;
        }

        while let Some((_, request)) = self
            .transport
            .try_read::<RunKernel>(Some(MASTER_RANK), MsgTag::RunKernel)?
        {
            self.kernel_queue.lock().unwrap().push_back(request);
        }

        if self.network_idle() {
            let done: Vec<RunKernel> = self.kernel_done.lock().unwrap().drain(..).collect();
            for report in done {
                self.transport
                    .send_msg(MASTER_RANK, MsgTag::KernelDone, &report)?;
            }
        }
        Ok(())
    }

    /// Apply ownership updates. Shards gained from a live previous owner are
    /// tainted until that owner's flush lands; shards lost are flushed out to
    /// the new owner immediately.
    fn apply_assignments(&self, assignment: ShardAssignment) -> Result<()> {
        let mut flush: Vec<Arc<GlobalTable>> = Vec::new();

        for a in assignment.assignments {
            let table = self.tables.require(a.table)?;
            let shard = a.shard as ShardId;
            let old_owner = table.owner(shard);
            table.set_owner(shard, a.new_worker);

            if a.new_worker == self.worker_id && old_owner != self.worker_id {
                if old_owner != UNASSIGNED {
                    tracing::info!(
                        "Worker {} gained table {} shard {}, tainted until flush from {}",
                        self.worker_id,
                        a.table,
                        a.shard,
                        old_owner
                    );
                    table.set_tainted(shard);
                }
            } else if old_owner == self.worker_id && a.new_worker != self.worker_id {
                tracing::info!(
                    "Worker {} lost table {} shard {} to {}",
                    self.worker_id,
                    a.table,
                    a.shard,
                    a.new_worker
                );
                table.set_dirty(shard);
                if !flush.iter().any(|t| t.id() == table.id()) {
                    flush.push(table);
                }
            }
        }

        for table in flush {
            table.send_updates()?;
        }
        Ok(())
    }

    /// Record a peer's epoch marker; once every channel has reached our
    /// epoch, the cut is complete and the checkpoint can be finalized.
    fn update_epoch(&self, peer: WorkerId, marker: i64) -> Result<()> {
        tracing::info!(
            "Worker {} got epoch marker {} from peer {}",
            self.worker_id,
            marker,
            peer
        );

        if self.epoch() < marker {
            self.checkpoint(marker)?;
        }
        self.peers[peer as usize].epoch.store(marker, Ordering::SeqCst);

        let epoch = self.epoch();
        let all_current = self
            .peers
            .iter()
            .all(|stub| stub.epoch.load(Ordering::SeqCst) == epoch);

        if all_current && self.checkpoint_pending.swap(false, Ordering::SeqCst) {
            tracing::info!(
                "Worker {}: all channels at epoch {}, finalizing checkpoint",
                self.worker_id,
                epoch
            );
            for table in self.tables.all() {
                table.finish_checkpoint()?;
            }
            self.transport
                .send_msg(MASTER_RANK, MsgTag::CheckpointDone, &())?;
        }
        Ok(())
    }

    /// Enter a checkpoint epoch: snapshot owned shards, then mark the cut on
    /// every data channel (our own included).
    fn checkpoint(&self, epoch: i64) -> Result<()> {
        if self.epoch() >= epoch {
            tracing::info!(
                "Worker {} skipping checkpoint at epoch {} (already at {})",
                self.worker_id,
                epoch,
                self.epoch()
            );
            return Ok(());
        }

        tracing::info!("Worker {} checkpointing at epoch {}", self.worker_id, epoch);
        self.epoch.store(epoch, Ordering::SeqCst);
        self.checkpoint_pending.store(true, Ordering::SeqCst);

        for table in self.tables.all() {
            table.start_checkpoint(&self.config.checkpoint_dir, epoch)?;
        }

        let marker = bincode::serialize(&TableDelta::epoch_marker(self.worker_id, epoch))?;
        for stub in &self.peers {
            self.outbox
                .send_tracked(rank_of_worker(stub.id), MsgTag::PutRequest, marker.clone());
        }
        Ok(())
    }

    fn restore(&self, epoch: i64) -> Result<()> {
        tracing::info!("Worker {} restoring state from epoch {}", self.worker_id, epoch);
        self.epoch.store(epoch, Ordering::SeqCst);
        for stub in &self.peers {
            stub.epoch.store(epoch, Ordering::SeqCst);
        }

        for table in self.tables.all() {
            table.restore(&self.config.checkpoint_dir, epoch)?;
        }

        self.transport
            .send_msg(MASTER_RANK, MsgTag::RestoreDone, &())?;
        Ok(())
    }
}

fn memory_rss_mb() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_processes();
    sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| sys.process(pid).map(|p| p.memory() / (1024 * 1024)))
        .unwrap_or(0)
}
