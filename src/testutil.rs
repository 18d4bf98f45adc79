//! In-process cluster rigs shared by the module test suites. Every node gets
//! its own transport and table registry, exactly as separate processes would.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::kernel::KernelRegistry;
use crate::master::Master;
use crate::table::types::WorkerId;
use crate::table::TableRegistry;
use crate::transport::Transport;
use crate::worker::Worker;

pub(crate) const POLL: Duration = Duration::from_millis(1);

/// Bind `nodes` transports on ephemeral loopback ports, rank order.
pub(crate) async fn bind_transports(nodes: usize) -> Vec<Arc<Transport>> {
    let mut listeners = Vec::with_capacity(nodes);
    let mut endpoints = Vec::with_capacity(nodes);
    for _ in 0..nodes {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback listener");
        endpoints.push(listener.local_addr().expect("listener addr"));
        listeners.push(listener);
    }

    listeners
        .into_iter()
        .enumerate()
        .map(|(rank, listener)| Transport::with_listener(rank, endpoints.clone(), listener, POLL))
        .collect()
}

pub(crate) fn test_config(num_workers: usize, checkpoint_dir: &std::path::Path) -> Config {
    let mut config = Config::new(num_workers);
    config.checkpoint_dir = checkpoint_dir.to_path_buf();
    config.sleep_time = POLL;
    config
}

pub(crate) struct TestCluster {
    pub master: Master,
    pub master_tables: Arc<TableRegistry>,
    pub workers: Vec<Arc<Worker>>,
    pub worker_tables: Vec<Arc<TableRegistry>>,
    handles: Vec<JoinHandle<Result<()>>>,
}

/// Stand up a master plus `num_workers` workers, each node with its own
/// registries, and wait for registration plus the initial shard assignment.
pub(crate) async fn start_cluster(
    config: Config,
    register_tables: impl Fn(&TableRegistry),
    register_kernels: impl Fn(&KernelRegistry),
    worker_config: impl Fn(WorkerId, &mut Config),
) -> TestCluster {
    let num_workers = config.num_workers;
    let transports = bind_transports(num_workers + 1).await;

    let mut workers = Vec::with_capacity(num_workers);
    let mut worker_tables = Vec::with_capacity(num_workers);
    let mut handles = Vec::with_capacity(num_workers);

    for id in 0..num_workers {
        let tables = TableRegistry::new();
        register_tables(&tables);
        let kernels = KernelRegistry::new();
        register_kernels(&kernels);

        let mut node_config = config.clone();
        worker_config(id as WorkerId, &mut node_config);

        let worker = Worker::new(
            node_config,
            transports[id + 1].clone(),
            tables.clone(),
            kernels,
        )
        .expect("worker construction");
        workers.push(worker.clone());
        worker_tables.push(tables);
        handles.push(tokio::spawn(worker.run()));
    }

    let master_tables = TableRegistry::new();
    register_tables(&master_tables);
    let master = Master::new(config, transports[0].clone(), master_tables.clone())
        .await
        .expect("master construction");

    TestCluster {
        master,
        master_tables,
        workers,
        worker_tables,
        handles,
    }
}

impl TestCluster {
    /// Stop the workers and join them, surfacing any worker-side failure.
    pub(crate) async fn shutdown(self) {
        self.master.shutdown().expect("shutdown broadcast");
        for handle in self.handles {
            handle
                .await
                .expect("worker task join")
                .expect("worker exited cleanly");
        }
    }
}
