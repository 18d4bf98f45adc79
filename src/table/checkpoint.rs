//! On-disk checkpoint layout.
//!
//! Per (table, epoch) a snapshot file `checkpoint.table_<id>.epoch_<e>`
//! holds a header (table id, epoch, shard count, per-shard byte extents)
//! followed by each owned shard's pairs, and a sibling delta log
//! `deltas.table_<id>.epoch_<e>` accumulates late deltas in arrival order.
//! Recovery reads the snapshot and then replays the log.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::protocol::TableDelta;
use super::types::{ShardId, TableId};

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub table: TableId,
    pub epoch: i64,
    pub num_shards: u64,
    pub extents: Vec<ShardExtent>,
}

/// Location of one shard's pairs inside the snapshot body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ShardExtent {
    pub shard: u64,
    pub offset: u64,
    pub len: u64,
}

pub fn snapshot_path(dir: &Path, table: TableId, epoch: i64) -> PathBuf {
    dir.join(format!("checkpoint.table_{}.epoch_{}", table, epoch))
}

pub fn delta_log_path(dir: &Path, table: TableId, epoch: i64) -> PathBuf {
    dir.join(format!("deltas.table_{}.epoch_{}", table, epoch))
}

pub fn write_snapshot(
    path: &Path,
    table: TableId,
    epoch: i64,
    num_shards: usize,
    shards: &[(ShardId, Vec<(Vec<u8>, Vec<u8>)>)],
) -> Result<()> {
    let mut extents = Vec::with_capacity(shards.len());
    let mut body = Vec::new();
    for (shard, pairs) in shards {
        let encoded = bincode::serialize(pairs)?;
        extents.push(ShardExtent {
            shard: *shard as u64,
            offset: body.len() as u64,
            len: encoded.len() as u64,
        });
        body.extend_from_slice(&encoded);
    }

    let header = SnapshotHeader {
        table,
        epoch,
        num_shards: num_shards as u64,
        extents,
    };

    let file = File::create(path)
        .with_context(|| format!("creating snapshot {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, &header)?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

pub fn read_snapshot(path: &Path) -> Result<Vec<(ShardId, Vec<(Vec<u8>, Vec<u8>)>)>> {
    let file = File::open(path)
        .with_context(|| format!("opening snapshot {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let header: SnapshotHeader = bincode::deserialize_from(&mut reader)?;
    let body_start = reader.stream_position()?;

    let mut shards = Vec::with_capacity(header.extents.len());
    for extent in &header.extents {
        reader.seek(SeekFrom::Start(body_start + extent.offset))?;
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = bincode::deserialize_from(&mut reader)
            .with_context(|| {
                format!(
                    "reading shard {} of snapshot {}",
                    extent.shard,
                    path.display()
                )
            })?;

        let end = reader.stream_position()? - body_start;
        if end != extent.offset + extent.len {
            bail!(
                "snapshot {} corrupt: shard {} ends at body offset {}, header says {}",
                path.display(),
                extent.shard,
                end,
                extent.offset + extent.len
            );
        }
        shards.push((extent.shard as ShardId, pairs));
    }
    Ok(shards)
}

/// Append-only log of deltas that arrived after the local epoch cut.
pub struct DeltaLog {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl DeltaLog {
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening delta log {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn append(&mut self, delta: &TableDelta) -> Result<()> {
        bincode::serialize_into(&mut self.writer, delta)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        tracing::debug!("Closed delta log {}", self.path.display());
        Ok(())
    }
}

/// Read a delta log back in arrival order. A missing file is an empty log:
/// a worker that saw no late deltas never wrote one.
pub fn read_delta_log(path: &Path) -> Result<Vec<TableDelta>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("opening delta log {}", path.display())),
    };

    let mut reader = BufReader::new(file);
    let mut deltas = Vec::new();
    loop {
        match bincode::deserialize_from::<_, TableDelta>(&mut reader) {
            Ok(delta) => deltas.push(delta),
            Err(e) => {
                if let bincode::ErrorKind::Io(ref io) = *e {
                    if io.kind() == ErrorKind::UnexpectedEof {
                        break;
                    }
                }
                return Err(e.into());
            }
        }
    }
    Ok(deltas)
}
