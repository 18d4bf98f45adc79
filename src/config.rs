//! Node configuration.
//!
//! Defaults cover a local cluster; every knob can be overridden through the
//! environment so the same binary serves test rigs and deployments.

use std::path::PathBuf;
use std::time::Duration;

/// What the master does with committed checkpoint epochs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointType {
    /// Checkpointing disabled.
    None,
    /// Keep only the newest committed epoch; older files are pruned.
    Rolling,
    /// Keep every committed epoch.
    Epoch,
}

impl CheckpointType {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(CheckpointType::None),
            "rolling" => Some(CheckpointType::Rolling),
            "epoch" => Some(CheckpointType::Epoch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Cluster size, excluding the master. Immutable after startup.
    pub num_workers: usize,
    /// Kernel invocations a worker accepts concurrently; undispatched tasks
    /// above this limit stay eligible for stealing.
    pub slots: usize,
    pub checkpoint_dir: PathBuf,
    /// Inter-poll sleep in the worker loops and the transport receive path.
    pub sleep_time: Duration,
    /// Interval checkpoint trigger; `None` disables interval checkpoints.
    pub checkpoint_interval: Option<Duration>,
    pub checkpoint_type: CheckpointType,
    /// Outgoing sends not completed within this window are cancelled and
    /// retransmitted.
    pub network_timeout: Duration,
    /// Artificial delay before each kernel invocation. Zero outside of
    /// scheduling tests.
    pub kernel_delay: Duration,
}

impl Config {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            slots: 1,
            checkpoint_dir: PathBuf::from("checkpoints"),
            sleep_time: Duration::from_millis(1),
            checkpoint_interval: None,
            checkpoint_type: CheckpointType::None,
            network_timeout: Duration::from_secs(60),
            kernel_delay: Duration::ZERO,
        }
    }

    /// Defaults overridden by environment variables.
    pub fn from_env(num_workers: usize) -> Self {
        let mut config = Self::new(num_workers);

        if let Some(dir) = std::env::var("CHECKPOINT_DIR").ok() {
            config.checkpoint_dir = PathBuf::from(dir);
        }
        if let Some(ms) = std::env::var("SLEEP_TIME_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
        {
            config.sleep_time = Duration::from_millis(ms);
        }
        if let Some(secs) = std::env::var("CHECKPOINT_INTERVAL_SECS")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
        {
            config.checkpoint_interval = if secs < 0 {
                None
            } else {
                Some(Duration::from_secs(secs as u64))
            };
        }
        if let Some(kind) = std::env::var("CHECKPOINT_TYPE")
            .ok()
            .and_then(|value| CheckpointType::parse(&value))
        {
            config.checkpoint_type = kind;
        }
        if let Some(secs) = std::env::var("NETWORK_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
        {
            config.network_timeout = Duration::from_secs(secs);
        }
        if let Some(slots) = std::env::var("WORKER_SLOTS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
        {
            config.slots = slots.max(1);
        }

        config
    }
}
