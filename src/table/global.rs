use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{anyhow, Result};

use super::checkpoint::{self, DeltaLog};
use super::local::LocalTable;
use super::protocol::{GetRequest, TableDelta};
use super::types::{ShardId, TableDescriptor, TableId, WorkerId, UNASSIGNED};
use crate::error::FatalError;
use crate::transport::types::rank_of_worker;
use crate::transport::MsgTag;
use crate::worker::outbox::Outbox;

/// Routing context a worker attaches to its tables at startup: who we are,
/// where tracked sends go, and the worker's current checkpoint epoch.
/// Tables never hold a reference back to the worker itself.
#[derive(Clone)]
pub struct TableRuntime {
    pub worker_id: WorkerId,
    pub outbox: Arc<Outbox>,
    pub epoch: Arc<AtomicI64>,
}

struct ActiveCheckpoint {
    epoch: i64,
    log: DeltaLog,
}

/// A table's full shard vector on one process.
///
/// The partition at index `i` exists everywhere but is canonical only where
/// `owner(i)` matches the local worker; elsewhere it buffers writes destined
/// for the owner.
pub struct GlobalTable {
    descriptor: TableDescriptor,
    partitions: Vec<Arc<LocalTable>>,
    pending_writes: AtomicI64,
    runtime: OnceLock<TableRuntime>,
    active_checkpoint: Mutex<Option<ActiveCheckpoint>>,
}

impl GlobalTable {
    pub fn new(descriptor: TableDescriptor) -> Arc<Self> {
        let partitions = (0..descriptor.num_shards)
            .map(|_| Arc::new(LocalTable::new(descriptor.accumulator.clone())))
            .collect();
        Arc::new(Self {
            descriptor,
            partitions,
            pending_writes: AtomicI64::new(0),
            runtime: OnceLock::new(),
            active_checkpoint: Mutex::new(None),
        })
    }

    pub fn id(&self) -> TableId {
        self.descriptor.id
    }

    pub fn num_shards(&self) -> usize {
        self.descriptor.num_shards
    }

    pub fn attach(&self, runtime: TableRuntime) {
        let _ = self.runtime.set(runtime);
    }

    fn runtime(&self) -> Result<&TableRuntime> {
        self.runtime
            .get()
            .ok_or_else(|| anyhow!("table {} has no attached worker context", self.id()))
    }

    pub fn partition(&self, shard: ShardId) -> &Arc<LocalTable> {
        &self.partitions[shard]
    }

    pub fn shard_for_key(&self, key: &[u8]) -> Result<ShardId> {
        self.descriptor
            .sharder
            .shard(key, self.descriptor.num_shards)
    }

    pub fn owner(&self, shard: ShardId) -> WorkerId {
        self.partitions[shard].owner()
    }

    pub fn set_owner(&self, shard: ShardId, worker: WorkerId) {
        self.partitions[shard].set_owner(worker);
    }

    pub fn is_local_shard(&self, shard: ShardId) -> bool {
        match self.runtime.get() {
            Some(rt) => self.partitions[shard].owner() == rt.worker_id,
            None => false,
        }
    }

    pub fn tainted(&self, shard: ShardId) -> bool {
        self.partitions[shard].tainted()
    }

    pub fn set_tainted(&self, shard: ShardId) {
        self.partitions[shard].set_tainted(true);
    }

    pub fn clear_tainted(&self, shard: ShardId) {
        self.partitions[shard].set_tainted(false);
    }

    pub fn set_dirty(&self, shard: ShardId) {
        self.partitions[shard].set_dirty(true);
    }

    /// A shard needs flushing if its buffer holds data or was marked dirty.
    pub fn dirty(&self, shard: ShardId) -> bool {
        let partition = &self.partitions[shard];
        partition.dirty() || !partition.is_empty()
    }

    /// Route a write: apply locally on the owner, buffer otherwise.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let shard = self.shard_for_key(&key)?;
        let partition = &self.partitions[shard];
        partition.put(key, value)?;
        if self.is_local_shard(shard) {
            partition.set_dirty(true);
        } else {
            self.pending_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn get_local(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let shard = self.shard_for_key(key)?;
        Ok(self.partitions[shard].get(key))
    }

    /// Local-only membership check, used when serving remote reads.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        let shard = self.shard_for_key(key)?;
        Ok(self.partitions[shard].contains(key))
    }

    /// Read a key, transparently fetching from the owning worker when the
    /// shard is not local (or not yet canonical here).
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let shard = self.shard_for_key(key)?;
        if self.is_local_shard(shard) && !self.tainted(shard) {
            return Ok(self.partitions[shard].get(key));
        }

        let owner = self.owner(shard);
        if owner == UNASSIGNED {
            return Err(FatalError::UnassignedShard {
                table: self.id(),
                shard: shard as i32,
            }
            .into());
        }

        let rt = self.runtime()?;
        let request = GetRequest {
            table: self.id(),
            shard: shard as i32,
            key: key.to_vec(),
        };
        let peer = rank_of_worker(owner);
        rt.outbox
            .send_tracked(peer, MsgTag::GetRequest, bincode::serialize(&request)?);

        let (_, response): (usize, TableDelta) = rt
            .outbox
            .transport()
            .read(Some(peer), MsgTag::GetResponse)
            .await?;

        if response.missing_key {
            return Ok(None);
        }
        let (_, value) = response
            .pairs
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("empty read response for table {}", self.id()))?;
        Ok(Some(value))
    }

    /// Flush every dirty non-local shard to its owner as delta fragments and
    /// clear the buffers. The caller drains incoming traffic afterwards.
    pub fn send_updates(&self) -> Result<()> {
        let rt = self.runtime()?;
        let epoch = rt.epoch.load(Ordering::SeqCst);

        for shard in 0..self.num_shards() {
            if self.is_local_shard(shard) {
                continue;
            }
            let partition = &self.partitions[shard];
            if !partition.dirty() && partition.is_empty() {
                continue;
            }

            let owner = self.owner(shard);
            if owner == UNASSIGNED {
                tracing::warn!(
                    "Table {} shard {} dirty but unassigned, holding updates",
                    self.id(),
                    shard
                );
                continue;
            }

            let fragments =
                partition.serialize_fragments(rt.worker_id, self.id(), shard as i32, epoch);
            tracing::debug!(
                "Flushing table {} shard {} to worker {} ({} fragment(s))",
                self.id(),
                shard,
                owner,
                fragments.len()
            );
            for fragment in fragments {
                rt.outbox.send_tracked(
                    rank_of_worker(owner),
                    MsgTag::PutRequest,
                    bincode::serialize(&fragment)?,
                );
            }
            partition.clear();
            partition.set_dirty(false);
        }

        self.pending_writes.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Apply a delta that arrived from a peer. Receiving one for a shard we
    /// do not own means the cluster's ownership views have diverged.
    pub fn apply_updates(&self, delta: &TableDelta) -> Result<()> {
        let rt = self.runtime()?;
        let shard = delta.shard;
        if shard < 0 || shard as usize >= self.num_shards() {
            return Err(FatalError::RoutingViolation {
                table: self.id(),
                shard,
                worker: rt.worker_id,
                owner: UNASSIGNED,
            }
            .into());
        }
        let owner = self.owner(shard as ShardId);
        if owner != rt.worker_id {
            return Err(FatalError::RoutingViolation {
                table: self.id(),
                shard,
                worker: rt.worker_id,
                owner,
            }
            .into());
        }
        self.partitions[shard as ShardId].apply_updates(delta)
    }

    /// Bytes buffered for non-local shards; the backpressure signal.
    pub fn pending_write_bytes(&self) -> usize {
        (0..self.num_shards())
            .filter(|&shard| !self.is_local_shard(shard))
            .map(|shard| self.partitions[shard].approx_bytes())
            .sum()
    }

    /// Buffered write operations since the last flush.
    pub fn pending_write_ops(&self) -> i64 {
        self.pending_writes.load(Ordering::SeqCst)
    }

    /// Snapshot every owned shard to disk and open the epoch's delta log.
    pub fn start_checkpoint(&self, dir: &Path, epoch: i64) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        let owned: Vec<(ShardId, Vec<(Vec<u8>, Vec<u8>)>)> = (0..self.num_shards())
            .filter(|&shard| self.is_local_shard(shard))
            .map(|shard| (shard, self.partitions[shard].snapshot_pairs()))
            .collect();

        checkpoint::write_snapshot(
            &checkpoint::snapshot_path(dir, self.id(), epoch),
            self.id(),
            epoch,
            self.num_shards(),
            &owned,
        )?;

        let log = DeltaLog::open(checkpoint::delta_log_path(dir, self.id(), epoch))?;
        *self.active_checkpoint.lock().unwrap() = Some(ActiveCheckpoint { epoch, log });

        tracing::info!(
            "Table {} snapshot written for epoch {} ({} owned shard(s))",
            self.id(),
            epoch,
            owned.len()
        );
        Ok(())
    }

    /// Record a late delta (already applied) for replay on recovery.
    pub fn write_delta(&self, delta: &TableDelta) -> Result<()> {
        if let Some(active) = self.active_checkpoint.lock().unwrap().as_mut() {
            active.log.append(delta)?;
        }
        Ok(())
    }

    /// Close the epoch's delta log. No-op when no checkpoint is active.
    pub fn finish_checkpoint(&self) -> Result<()> {
        if let Some(active) = self.active_checkpoint.lock().unwrap().take() {
            let epoch = active.epoch;
            active.log.finish()?;
            tracing::info!("Table {} checkpoint finished for epoch {}", self.id(), epoch);
        }
        Ok(())
    }

    /// Load the epoch's snapshot, then replay its delta log.
    pub fn restore(&self, dir: &Path, epoch: i64) -> Result<()> {
        for (shard, pairs) in checkpoint::read_snapshot(&checkpoint::snapshot_path(
            dir,
            self.id(),
            epoch,
        ))? {
            let partition = &self.partitions[shard];
            partition.clear();
            for (key, value) in pairs {
                partition.insert_raw(key, value);
            }
            partition.set_dirty(false);
        }

        for delta in checkpoint::read_delta_log(&checkpoint::delta_log_path(
            dir,
            self.id(),
            epoch,
        ))? {
            let shard = delta.shard as ShardId;
            self.partitions[shard].apply_updates(&delta)?;
        }

        tracing::info!("Table {} restored from epoch {}", self.id(), epoch);
        Ok(())
    }
}
