use std::net::SocketAddr;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use distributed_tables::config::Config;
use distributed_tables::error::FatalError;
use distributed_tables::kernel::{Kernel, KernelContext, KernelRegistry};
use distributed_tables::master::{Master, RunDescriptor};
use distributed_tables::table::types::TableDescriptor;
use distributed_tables::table::{Accumulator, Sharder, TableRegistry, TypedTable};
use distributed_tables::transport::Transport;
use distributed_tables::worker::Worker;

const TABLE_A: i32 = 0;
const TABLE_B: i32 = 1;
const TABLE_C: i32 = 2;

type Block = Vec<f64>;

fn block_sum(a: Block, b: Block) -> Block {
    a.iter().zip(b.iter()).map(|(x, y)| x + y).collect()
}

/// Block matrix multiply over three distributed tables: C += A * B.
struct MatrixMultiplyKernel;

#[async_trait]
impl Kernel for MatrixMultiplyKernel {
    async fn invoke(&mut self, method: &str, ctx: &KernelContext) -> Result<()> {
        let args = ctx.args();
        let edge = args["edge_size"].as_u64().unwrap_or(400) as usize;
        let block = args["block_size"].as_u64().unwrap_or(100) as usize;
        let blocks_per_edge = edge / block;

        match method {
            "initialize" => initialize(ctx, blocks_per_edge, block).await,
            "multiply" => multiply(ctx, blocks_per_edge, block).await,
            other => Err(FatalError::UnknownMethod {
                kernel: "matmul".to_string(),
                method: other.to_string(),
            }
            .into()),
        }
    }
}

async fn initialize(ctx: &KernelContext, blocks_per_edge: usize, block: usize) -> Result<()> {
    let a: TypedTable<i64, Block> = ctx.table(TABLE_A)?;
    let b: TypedTable<i64, Block> = ctx.table(TABLE_B)?;
    let c: TypedTable<i64, Block> = ctx.table(TABLE_C)?;

    let shard = ctx.current_shard();
    let num_shards = a.num_shards();
    let ones = vec![1.0; block * block];
    let twos = vec![2.0; block * block];
    let zeros = vec![0.0; block * block];

    for by in 0..blocks_per_edge {
        if by % num_shards != shard {
            continue;
        }
        for bx in 0..blocks_per_edge {
            let key = (by * blocks_per_edge + bx) as i64;
            a.put(&key, &ones)?;
            b.put(&key, &twos)?;
            c.put(&key, &zeros)?;
        }
    }
    Ok(())
}

async fn multiply(ctx: &KernelContext, blocks_per_edge: usize, block: usize) -> Result<()> {
    let a: TypedTable<i64, Block> = ctx.table(TABLE_A)?;
    let b: TypedTable<i64, Block> = ctx.table(TABLE_B)?;
    let c: TypedTable<i64, Block> = ctx.table(TABLE_C)?;

    let shard = ctx.current_shard();
    let num_shards = a.num_shards();

    for k in 0..blocks_per_edge {
        for i in 0..blocks_per_edge {
            if i % num_shards != shard {
                continue;
            }
            for j in 0..blocks_per_edge {
                let left = a
                    .get(&((i * blocks_per_edge + k) as i64))
                    .await?
                    .ok_or_else(|| anyhow!("missing A block ({}, {})", i, k))?;
                let right = b
                    .get(&((k * blocks_per_edge + j) as i64))
                    .await?
                    .ok_or_else(|| anyhow!("missing B block ({}, {})", k, j))?;

                let mut product = vec![0.0; block * block];
                for row in 0..block {
                    for inner in 0..block {
                        let lhs = left[row * block + inner];
                        for col in 0..block {
                            product[row * block + col] += lhs * right[inner * block + col];
                        }
                    }
                }
                c.put(&((i * blocks_per_edge + j) as i64), &product)?;
            }
        }
    }
    Ok(())
}

fn register_tables(tables: &TableRegistry, num_shards: usize) {
    for id in [TABLE_A, TABLE_B, TABLE_C] {
        tables.create(TableDescriptor::new(
            id,
            num_shards,
            Sharder::Mod,
            Accumulator::custom::<Block, _>(block_sum),
        ));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --rank <n> --peer <addr:port> [--peer <addr:port> ...] [--edge-size <n>] [--block-size <n>]",
            args[0]
        );
        eprintln!("Peers are listed in rank order; rank 0 is the master.");
        std::process::exit(1);
    }

    let mut rank: Option<usize> = None;
    let mut peers: Vec<SocketAddr> = vec![];
    let mut edge_size = 400usize;
    let mut block_size = 100usize;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--rank" => {
                rank = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--peer" => {
                peers.push(args[i + 1].parse()?);
                i += 2;
            }
            "--edge-size" => {
                edge_size = args[i + 1].parse()?;
                i += 2;
            }
            "--block-size" => {
                block_size = args[i + 1].parse()?;
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let rank = rank.ok_or_else(|| anyhow!("--rank is required"))?;
    if peers.len() < 2 {
        return Err(anyhow!("need at least a master and one worker endpoint"));
    }
    if rank >= peers.len() {
        return Err(anyhow!("rank {} out of range for {} peers", rank, peers.len()));
    }

    let num_workers = peers.len() - 1;
    let config = Config::from_env(num_workers);

    tracing::info!(
        "Starting rank {} of {} ({} workers), matrix {}x{} in {}x{} blocks",
        rank,
        peers.len(),
        num_workers,
        edge_size,
        edge_size,
        block_size,
        block_size
    );

    let transport = Transport::bind(rank, peers, config.sleep_time).await?;
    let tables = TableRegistry::new();
    register_tables(&tables, num_workers);

    if rank == 0 {
        let run_args = serde_json::json!({
            "edge_size": edge_size,
            "block_size": block_size,
        });

        let mut master = Master::new(config, transport, tables).await?;
        master
            .run_all(RunDescriptor::new("matmul", "initialize", TABLE_A).with_args(run_args.clone()))
            .await?;
        master
            .run_all(RunDescriptor::new("matmul", "multiply", TABLE_A).with_args(run_args))
            .await?;
        master.shutdown()?;
        tracing::info!("Matrix multiply complete");
    } else {
        let kernels = KernelRegistry::new();
        kernels.register("matmul", || Box::new(MatrixMultiplyKernel));
        let worker = Worker::new(config, transport, tables, kernels)?;
        worker.run().await?;
    }

    Ok(())
}
