use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;

use crate::config::{CheckpointType, Config};
use crate::table::types::{ShardId, TableId, WorkerId, UNASSIGNED};
use crate::table::TableRegistry;
use crate::transport::types::rank_of_worker;
use crate::transport::{MsgTag, Transport};

use super::protocol::{
    Assignment, CheckpointCmd, CheckpointMeta, RegisterWorker, RestoreCmd, RunKernel,
    ShardAssignment,
};
use super::types::{RunDescriptor, Task, TaskStatus, WorkerState};

/// The cluster controller at rank 0.
pub struct Master {
    config: Config,
    transport: Arc<Transport>,
    tables: Arc<TableRegistry>,
    workers: Vec<WorkerState>,
    checkpoint_epoch: i64,
    last_checkpoint: Instant,
}

impl Master {
    /// Collect registration from every worker, then assign and broadcast
    /// shard ownership for all registered tables.
    pub async fn new(
        config: Config,
        transport: Arc<Transport>,
        tables: Arc<TableRegistry>,
    ) -> Result<Self> {
        let mut workers = Vec::with_capacity(config.num_workers);
        for _ in 0..config.num_workers {
            let (_, registration): (usize, RegisterWorker) =
                transport.read(None, MsgTag::RegisterWorker).await?;
            tracing::info!(
                "Worker {} registered with {} slot(s)",
                registration.id,
                registration.slots
            );
            workers.push(WorkerState::new(registration.id, registration.slots));
        }
        workers.sort_by_key(|w| w.id);

        let mut master = Self {
            config,
            transport,
            tables,
            workers,
            checkpoint_epoch: 0,
            last_checkpoint: Instant::now(),
        };
        master.assign_tables()?;
        Ok(master)
    }

    /// Round-robin every shard of every table across the workers, then
    /// broadcast the full map.
    fn assign_tables(&mut self) -> Result<()> {
        let num_workers = self.workers.len();
        let mut assignments = Vec::new();

        for table in self.tables.all() {
            for shard in 0..table.num_shards() {
                let worker = self.workers[shard % num_workers].id;
                table.set_owner(shard, worker);
                self.workers[shard % num_workers]
                    .shards
                    .insert((table.id(), shard as i32));
                assignments.push(Assignment {
                    table: table.id(),
                    shard: shard as i32,
                    new_worker: worker,
                });
            }
        }

        tracing::info!(
            "Assigned {} shard(s) across {} worker(s)",
            assignments.len(),
            num_workers
        );
        self.transport
            .broadcast_msg(MsgTag::ShardAssignment, &ShardAssignment { assignments })?;
        Ok(())
    }

    /// Run the kernel on one (arbitrary) shard.
    pub async fn run_one(&mut self, descriptor: RunDescriptor) -> Result<()> {
        self.run_range(descriptor, vec![0]).await
    }

    /// Run the kernel on every shard of the descriptor's table.
    pub async fn run_all(&mut self, descriptor: RunDescriptor) -> Result<()> {
        let shards = (0..self.tables.require(descriptor.table)?.num_shards()).collect();
        self.run_range(descriptor, shards).await
    }

    /// Run the kernel on the given shard subset, blocking until done.
    pub async fn run_range(
        &mut self,
        descriptor: RunDescriptor,
        shards: Vec<ShardId>,
    ) -> Result<()> {
        self.maybe_interval_checkpoint().await?;
        self.dispatch_work(&descriptor, &shards).await
    }

    async fn dispatch_work(&mut self, descriptor: &RunDescriptor, shards: &[ShardId]) -> Result<()> {
        let mut tasks = Vec::with_capacity(shards.len());
        for &shard in shards {
            let worker = self.assign_worker(descriptor.table, shard)?;
            tasks.push(Task {
                table: descriptor.table,
                shard: shard as i32,
                worker,
                status: TaskStatus::Assigned,
            });
        }
        let mut stolen: HashSet<(TableId, i32)> = HashSet::new();

        tracing::info!(
            "Dispatching {}::{} over {} shard(s) of table {}",
            descriptor.kernel,
            descriptor.method,
            tasks.len(),
            descriptor.table
        );

        loop {
            self.dispatch_assigned(descriptor, &mut tasks)?;

            while let Some((_, done)) = self
                .transport
                .try_read::<RunKernel>(None, MsgTag::KernelDone)?
            {
                if let Some(task) = tasks.iter_mut().find(|t| {
                    t.status == TaskStatus::Working && t.table == done.table && t.shard == done.shard
                }) {
                    tracing::debug!("Task table {} shard {} finished", done.table, done.shard);
                    task.status = TaskStatus::Finished;
                }
            }

            if tasks.iter().all(|t| t.status == TaskStatus::Finished) {
                break;
            }

            let idle: Vec<WorkerId> = self
                .workers
                .iter()
                .map(|w| w.id)
                .filter(|&id| {
                    !tasks
                        .iter()
                        .any(|t| t.worker == id && t.status != TaskStatus::Finished)
                })
                .collect();
            for idle_worker in idle {
                if tasks.iter().any(|t| t.status == TaskStatus::Assigned) {
                    self.steal_work(&mut tasks, &mut stolen, idle_worker)?;
                }
            }

            tokio::time::sleep(self.config.sleep_time).await;
        }

        tracing::info!(
            "Run {}::{} complete on table {}",
            descriptor.kernel,
            descriptor.method,
            descriptor.table
        );
        Ok(())
    }

    /// Send queued tasks, keeping at most `slots` in flight per worker.
    /// Tasks above the limit stay `Assigned`, which is what keeps them
    /// eligible for stealing.
    fn dispatch_assigned(&self, descriptor: &RunDescriptor, tasks: &mut [Task]) -> Result<()> {
        for worker in &self.workers {
            let mut in_flight = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Working && t.worker == worker.id)
                .count();

            while in_flight < worker.slots {
                let Some(task) = tasks
                    .iter_mut()
                    .find(|t| t.status == TaskStatus::Assigned && t.worker == worker.id)
                else {
                    break;
                };

                self.transport.send_msg(
                    rank_of_worker(worker.id),
                    MsgTag::RunKernel,
                    &RunKernel {
                        kernel: descriptor.kernel.clone(),
                        method: descriptor.method.clone(),
                        table: task.table,
                        shard: task.shard,
                        args_json: descriptor.args_json(),
                    },
                )?;
                task.status = TaskStatus::Working;
                in_flight += 1;
            }
        }
        Ok(())
    }

    /// The worker a task runs on: the shard's current owner, or the least
    /// loaded worker when the shard is unassigned (the assignment is recorded
    /// and broadcast so later kernels stick to it).
    fn assign_worker(&mut self, table_id: TableId, shard: ShardId) -> Result<WorkerId> {
        let table = self.tables.require(table_id)?;
        let owner = table.owner(shard);
        if owner != UNASSIGNED {
            return Ok(owner);
        }

        let choice = self
            .workers
            .iter()
            .min_by_key(|w| w.shards.len())
            .map(|w| w.id)
            .expect("cluster has at least one worker");
        table.set_owner(shard, choice);
        if let Some(state) = self.workers.iter_mut().find(|w| w.id == choice) {
            state.shards.insert((table_id, shard as i32));
        }

        self.transport.broadcast_msg(
            MsgTag::ShardAssignment,
            &ShardAssignment {
                assignments: vec![Assignment {
                    table: table_id,
                    shard: shard as i32,
                    new_worker: choice,
                }],
            },
        )?;
        Ok(choice)
    }

    /// Move one unstarted task from the most loaded worker to `idle_worker`,
    /// transferring shard ownership with it. Running tasks are never moved,
    /// and a shard is stolen at most once per run.
    fn steal_work(
        &mut self,
        tasks: &mut [Task],
        stolen: &mut HashSet<(TableId, i32)>,
        idle_worker: WorkerId,
    ) -> Result<()> {
        let mut victim: Option<(WorkerId, usize)> = None;
        for worker in &self.workers {
            if worker.id == idle_worker {
                continue;
            }
            let unstarted = tasks
                .iter()
                .filter(|t| {
                    t.status == TaskStatus::Assigned
                        && t.worker == worker.id
                        && !stolen.contains(&(t.table, t.shard))
                })
                .count();
            if unstarted > 0 && victim.map_or(true, |(_, best)| unstarted > best) {
                victim = Some((worker.id, unstarted));
            }
        }
        let Some((victim_id, _)) = victim else {
            return Ok(());
        };

        let Some(task) = tasks
            .iter_mut()
            .filter(|t| {
                t.status == TaskStatus::Assigned
                    && t.worker == victim_id
                    && !stolen.contains(&(t.table, t.shard))
            })
            .max_by_key(|t| t.shard)
        else {
            return Ok(());
        };

        tracing::info!(
            "Stealing table {} shard {} from worker {} for idle worker {}",
            task.table,
            task.shard,
            victim_id,
            idle_worker
        );
        stolen.insert((task.table, task.shard));

        let table = self.tables.require(task.table)?;
        table.set_owner(task.shard as ShardId, idle_worker);
        for worker in &mut self.workers {
            if worker.id == victim_id {
                worker.shards.remove(&(task.table, task.shard));
            } else if worker.id == idle_worker {
                worker.shards.insert((task.table, task.shard));
            }
        }

        let assignment = ShardAssignment {
            assignments: vec![Assignment {
                table: task.table,
                shard: task.shard,
                new_worker: idle_worker,
            }],
        };
        self.transport.send_msg(
            rank_of_worker(victim_id),
            MsgTag::ShardAssignment,
            &assignment,
        )?;
        self.transport.send_msg(
            rank_of_worker(idle_worker),
            MsgTag::ShardAssignment,
            &assignment,
        )?;

        task.worker = idle_worker;
        Ok(())
    }

    async fn maybe_interval_checkpoint(&mut self) -> Result<()> {
        if self.config.checkpoint_type == CheckpointType::None {
            return Ok(());
        }
        let Some(interval) = self.config.checkpoint_interval else {
            return Ok(());
        };
        if self.last_checkpoint.elapsed() > interval {
            self.checkpoint().await?;
        }
        Ok(())
    }

    /// Distributed checkpoint: broadcast the next epoch, wait for every
    /// worker to finish its cut, then record the epoch as committed.
    pub async fn checkpoint(&mut self) -> Result<()> {
        self.checkpoint_epoch += 1;
        let epoch = self.checkpoint_epoch;
        tracing::info!("Starting checkpoint at epoch {}", epoch);

        self.transport
            .broadcast_msg(MsgTag::Checkpoint, &CheckpointCmd { epoch })?;
        for _ in 0..self.config.num_workers {
            let _: (usize, ()) = self.transport.read(None, MsgTag::CheckpointDone).await?;
        }

        std::fs::create_dir_all(&self.config.checkpoint_dir)?;
        let meta_path = self
            .config
            .checkpoint_dir
            .join(format!("epoch_{}.meta", epoch));
        std::fs::write(&meta_path, bincode::serialize(&CheckpointMeta { epoch })?)?;

        if self.config.checkpoint_type == CheckpointType::Rolling {
            self.prune_epochs_before(epoch)?;
        }

        self.last_checkpoint = Instant::now();
        tracing::info!("Checkpoint epoch {} committed", epoch);
        Ok(())
    }

    /// Restore the cluster from the newest committed epoch, if any.
    pub async fn restore(&mut self) -> Result<Option<i64>> {
        let Some(epoch) = latest_committed_epoch(&self.config.checkpoint_dir)? else {
            tracing::info!("No committed checkpoint found, nothing to restore");
            return Ok(None);
        };

        tracing::info!("Restoring cluster from epoch {}", epoch);
        self.transport
            .broadcast_msg(MsgTag::Restore, &RestoreCmd { epoch })?;
        for _ in 0..self.config.num_workers {
            let _: (usize, ()) = self.transport.read(None, MsgTag::RestoreDone).await?;
        }

        self.checkpoint_epoch = epoch;
        Ok(Some(epoch))
    }

    fn prune_epochs_before(&self, keep: i64) -> Result<()> {
        for entry in std::fs::read_dir(&self.config.checkpoint_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(epoch) = parse_epoch(name) {
                if epoch < keep {
                    tracing::debug!("Pruning {}", name);
                    std::fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }

    /// Stop every worker. In-flight sends are abandoned.
    pub fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down {} worker(s)", self.config.num_workers);
        self.transport.broadcast_msg(MsgTag::WorkerShutdown, &())
    }

    pub fn workers(&self) -> &[WorkerState] {
        &self.workers
    }

    pub fn checkpoint_epoch(&self) -> i64 {
        self.checkpoint_epoch
    }
}

fn latest_committed_epoch(dir: &Path) -> Result<Option<i64>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut latest = None;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(epoch) = name
            .strip_prefix("epoch_")
            .and_then(|rest| rest.strip_suffix(".meta"))
            .and_then(|e| e.parse::<i64>().ok())
        {
            latest = Some(latest.map_or(epoch, |best: i64| best.max(epoch)));
        }
    }
    Ok(latest)
}

/// Epoch of a checkpoint artifact: `checkpoint.table_<t>.epoch_<e>`,
/// `deltas.table_<t>.epoch_<e>` or `epoch_<e>.meta`.
fn parse_epoch(name: &str) -> Option<i64> {
    if let Some(epoch) = name
        .strip_prefix("epoch_")
        .and_then(|rest| rest.strip_suffix(".meta"))
    {
        return epoch.parse().ok();
    }
    name.rsplit(".epoch_").next().and_then(|suffix| {
        if suffix == name {
            None
        } else {
            suffix.parse().ok()
        }
    })
}
