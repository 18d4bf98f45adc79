/// Rank of the master process.
pub const MASTER_RANK: usize = 0;

/// Workers are 0-based ids behind the master: worker w lives at rank w + 1.
pub fn rank_of_worker(worker: i32) -> usize {
    (worker + 1) as usize
}

/// Message tags carried on every frame. A (source, tag) pair identifies an
/// incoming queue; receivers pull by tag, optionally pinned to one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgTag {
    RegisterWorker = 1,
    ShardAssignment = 2,
    RunKernel = 3,
    KernelDone = 4,
    GetRequest = 5,
    GetResponse = 6,
    PutRequest = 7,
    Checkpoint = 8,
    CheckpointDone = 9,
    Restore = 10,
    RestoreDone = 11,
    WorkerShutdown = 12,
}

impl MsgTag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MsgTag::RegisterWorker),
            2 => Some(MsgTag::ShardAssignment),
            3 => Some(MsgTag::RunKernel),
            4 => Some(MsgTag::KernelDone),
            5 => Some(MsgTag::GetRequest),
            6 => Some(MsgTag::GetResponse),
            7 => Some(MsgTag::PutRequest),
            8 => Some(MsgTag::Checkpoint),
            9 => Some(MsgTag::CheckpointDone),
            10 => Some(MsgTag::Restore),
            11 => Some(MsgTag::RestoreDone),
            12 => Some(MsgTag::WorkerShutdown),
            _ => None,
        }
    }
}
