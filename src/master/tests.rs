use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::CheckpointType;
use crate::error::FatalError;
use crate::kernel::{Kernel, KernelContext};
use crate::table::types::{TableDescriptor, WorkerId};
use crate::table::{Accumulator, Sharder, TypedTable};
use crate::testutil::{start_cluster, test_config, TestCluster};

use super::RunDescriptor;

// ---------------------------------------------------------------
// Block matrix multiply
// ---------------------------------------------------------------

const TABLE_A: i32 = 0;
const TABLE_B: i32 = 1;
const TABLE_C: i32 = 2;
const BLOCK: usize = 2;
const BLOCKS_PER_EDGE: usize = 2;

type Block = Vec<f64>;

fn block_sum(a: Block, b: Block) -> Block {
    a.iter().zip(b.iter()).map(|(x, y)| x + y).collect()
}

struct MatMulKernel;

#[async_trait]
impl Kernel for MatMulKernel {
    async fn invoke(&mut self, method: &str, ctx: &KernelContext) -> Result<()> {
        let a: TypedTable<i64, Block> = ctx.table(TABLE_A)?;
        let b: TypedTable<i64, Block> = ctx.table(TABLE_B)?;
        let c: TypedTable<i64, Block> = ctx.table(TABLE_C)?;
        let shard = ctx.current_shard();
        let num_shards = a.num_shards();

        match method {
            "initialize" => {
                for by in 0..BLOCKS_PER_EDGE {
                    if by % num_shards != shard {
                        continue;
                    }
                    for bx in 0..BLOCKS_PER_EDGE {
                        let key = (by * BLOCKS_PER_EDGE + bx) as i64;
                        a.put(&key, &vec![1.0; BLOCK * BLOCK])?;
                        b.put(&key, &vec![2.0; BLOCK * BLOCK])?;
                        c.put(&key, &vec![0.0; BLOCK * BLOCK])?;
                    }
                }
                Ok(())
            }
            "multiply" => {
                for k in 0..BLOCKS_PER_EDGE {
                    for i in 0..BLOCKS_PER_EDGE {
                        if i % num_shards != shard {
                            continue;
                        }
                        for j in 0..BLOCKS_PER_EDGE {
                            let left = a
                                .get(&((i * BLOCKS_PER_EDGE + k) as i64))
                                .await?
                                .expect("A block initialized");
                            let right = b
                                .get(&((k * BLOCKS_PER_EDGE + j) as i64))
                                .await?
                                .expect("B block initialized");

                            let mut product = vec![0.0; BLOCK * BLOCK];
                            for row in 0..BLOCK {
                                for inner in 0..BLOCK {
                                    for col in 0..BLOCK {
                                        product[row * BLOCK + col] +=
                                            left[row * BLOCK + inner] * right[inner * BLOCK + col];
                                    }
                                }
                            }
                            c.put(&((i * BLOCKS_PER_EDGE + j) as i64), &product)?;
                        }
                    }
                }
                Ok(())
            }
            other => Err(FatalError::UnknownMethod {
                kernel: "matmul".to_string(),
                method: other.to_string(),
            }
            .into()),
        }
    }
}

fn matmul_tables(tables: &crate::table::TableRegistry) {
    for id in [TABLE_A, TABLE_B, TABLE_C] {
        tables.create(TableDescriptor::new(
            id,
            2,
            Sharder::Mod,
            Accumulator::custom::<Block, _>(block_sum),
        ));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn matrix_multiply_produces_row_column_products() {
    let dir = tempfile::tempdir().unwrap();
    let mut cluster = start_cluster(
        test_config(2, dir.path()),
        matmul_tables,
        |kernels| kernels.register("matmul", || Box::new(MatMulKernel)),
        |_, _| {},
    )
    .await;

    cluster
        .master
        .run_all(RunDescriptor::new("matmul", "initialize", TABLE_A))
        .await
        .unwrap();
    cluster
        .master
        .run_all(RunDescriptor::new("matmul", "multiply", TABLE_A))
        .await
        .unwrap();

    // Every element of C is the full inner product:
    // edge * (1.0 * 2.0) = 4 blocks-per-row * ... = 8.0 for a 4x4 matrix.
    let edge = BLOCK * BLOCKS_PER_EDGE;
    let expected = edge as f64 * 2.0;
    for key in 0..(BLOCKS_PER_EDGE * BLOCKS_PER_EDGE) as i64 {
        let owner = (key % 2) as usize;
        let c: TypedTable<i64, Block> = cluster.worker_tables[owner].typed(TABLE_C).unwrap();
        let block = c.get_local(&key).unwrap().expect("C block exists");
        assert!(
            block.iter().all(|&v| (v - expected).abs() < 1e-9),
            "block {} holds {:?}",
            key,
            block
        );
    }

    cluster.shutdown().await;
}

// ---------------------------------------------------------------
// Work stealing
// ---------------------------------------------------------------

const MARKS: i32 = 0;

struct MarkKernel;

#[async_trait]
impl Kernel for MarkKernel {
    async fn invoke(&mut self, method: &str, ctx: &KernelContext) -> Result<()> {
        match method {
            "mark" => {
                let marks: TypedTable<i64, i64> = ctx.table(MARKS)?;
                marks.put(&(ctx.current_shard() as i64), &1)?;
                Ok(())
            }
            other => Err(FatalError::UnknownMethod {
                kernel: "mark".to_string(),
                method: other.to_string(),
            }
            .into()),
        }
    }
}

async fn owners_agree(cluster: &TestCluster, table: i32, shard: usize) -> WorkerId {
    // Assignment messages to victim and thief race the test's assertions;
    // poll until every view agrees.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let master_owner = cluster.master_tables.require(table).unwrap().owner(shard);
        let agreed = cluster
            .worker_tables
            .iter()
            .all(|tables| tables.require(table).unwrap().owner(shard) == master_owner);
        if agreed && master_owner >= 0 {
            return master_owner;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "ownership views never converged for shard {}",
            shard
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_worker_steals_unstarted_task_and_ownership() {
    let dir = tempfile::tempdir().unwrap();
    let mut cluster = start_cluster(
        test_config(2, dir.path()),
        |tables| {
            tables.create(TableDescriptor::new(
                MARKS,
                4,
                Sharder::Mod,
                Accumulator::SumI64,
            ));
        },
        |kernels| kernels.register("mark", || Box::new(MarkKernel)),
        |id, config| {
            // Worker 1 is slow to start each kernel, leaving its second task
            // unstarted long enough to be stolen.
            if id == 1 {
                config.kernel_delay = Duration::from_millis(300);
            }
        },
    )
    .await;

    cluster
        .master
        .run_all(RunDescriptor::new("mark", "mark", MARKS))
        .await
        .unwrap();

    // Shard 3 started on worker 1 and must have moved to the idle worker 0.
    let thief = owners_agree(&cluster, MARKS, 3).await;
    assert_eq!(thief, 0);

    // The taint set on the stolen shard clears once the victim's flush lands.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while cluster.worker_tables[0].require(MARKS).unwrap().tainted(3) {
        assert!(
            std::time::Instant::now() < deadline,
            "taint on stolen shard never cleared"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Every task ran exactly once.
    for shard in 0..4usize {
        let owner = owners_agree(&cluster, MARKS, shard).await;
        let marks: TypedTable<i64, i64> = cluster.worker_tables[owner as usize]
            .typed(MARKS)
            .unwrap();
        assert_eq!(marks.get_local(&(shard as i64)).unwrap(), Some(1));
    }

    cluster.shutdown().await;
}

// ---------------------------------------------------------------
// Checkpoint / crash / restore
// ---------------------------------------------------------------

const SUMS: i32 = 0;
const SUM_KEYS: i64 = 4;

struct SumRoundKernel;

#[async_trait]
impl Kernel for SumRoundKernel {
    async fn invoke(&mut self, method: &str, ctx: &KernelContext) -> Result<()> {
        match method {
            "add" => {
                let sums: TypedTable<i64, i64> = ctx.table(SUMS)?;
                for key in 0..SUM_KEYS {
                    sums.put(&key, &1)?;
                }
                Ok(())
            }
            other => Err(FatalError::UnknownMethod {
                kernel: "sum_round".to_string(),
                method: other.to_string(),
            }
            .into()),
        }
    }
}

fn sum_tables(tables: &crate::table::TableRegistry) {
    tables.create(TableDescriptor::new(
        SUMS,
        2,
        Sharder::Mod,
        Accumulator::SumI64,
    ));
}

fn assert_sums(cluster: &TestCluster, expected: i64) {
    for key in 0..SUM_KEYS {
        let owner = (key % 2) as usize;
        let sums: TypedTable<i64, i64> = cluster.worker_tables[owner].typed(SUMS).unwrap();
        assert_eq!(
            sums.get_local(&key).unwrap(),
            Some(expected),
            "key {} after restore sequence",
            key
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checkpoint_then_restore_reproduces_the_uninterrupted_run() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().to_path_buf();

    let mut config = test_config(2, &base);
    config.checkpoint_type = CheckpointType::Epoch;
    // Every worker checkpoints into its own directory, as separate machines
    // would; the master's commit records live in the base directory.
    let per_worker = |id: WorkerId, config: &mut crate::config::Config| {
        config.checkpoint_dir = config.checkpoint_dir.join(format!("worker_{}", id));
    };

    // First life: 5 rounds, checkpoint, 3 more rounds that the crash loses.
    let mut cluster = start_cluster(
        config.clone(),
        sum_tables,
        |kernels| kernels.register("sum_round", || Box::new(SumRoundKernel)),
        per_worker,
    )
    .await;

    for _ in 0..5 {
        cluster
            .master
            .run_all(RunDescriptor::new("sum_round", "add", SUMS))
            .await
            .unwrap();
    }
    assert_sums(&cluster, 10);

    cluster.master.checkpoint().await.unwrap();
    assert_eq!(cluster.master.checkpoint_epoch(), 1);

    for _ in 0..3 {
        cluster
            .master
            .run_all(RunDescriptor::new("sum_round", "add", SUMS))
            .await
            .unwrap();
    }
    assert_sums(&cluster, 16);

    cluster.shutdown().await;

    // Second life: fresh in-memory state, restore the committed epoch, then
    // the remaining 5 rounds. The result matches a 10-round uninterrupted
    // run.
    let mut cluster = start_cluster(
        config,
        sum_tables,
        |kernels| kernels.register("sum_round", || Box::new(SumRoundKernel)),
        per_worker,
    )
    .await;

    let restored = cluster.master.restore().await.unwrap();
    assert_eq!(restored, Some(1));
    assert_sums(&cluster, 10);

    for _ in 0..5 {
        cluster
            .master
            .run_all(RunDescriptor::new("sum_round", "add", SUMS))
            .await
            .unwrap();
    }
    assert_sums(&cluster, 20);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restore_without_checkpoint_is_a_clean_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let mut cluster = start_cluster(
        test_config(2, dir.path()),
        sum_tables,
        |kernels| kernels.register("sum_round", || Box::new(SumRoundKernel)),
        |_, _| {},
    )
    .await;

    assert_eq!(cluster.master.restore().await.unwrap(), None);

    cluster.shutdown().await;
}
