use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use anyhow::Result;
use dashmap::DashMap;

use super::protocol::TableDelta;
use super::types::{Accumulator, TableId, WorkerId, UNASSIGNED};

/// Byte budget for one delta fragment; flushes larger than this stream as
/// several deltas with `done` set only on the last.
pub const FLUSH_FRAGMENT_BYTES: usize = 1024 * 1024;

/// One shard's storage.
///
/// On the owning worker this is the canonical copy; on every other worker the
/// same structure serves as the write buffer holding pending updates for the
/// owner. Either way, colliding writes are folded through the table's
/// accumulator.
pub struct LocalTable {
    data: DashMap<Vec<u8>, Vec<u8>>,
    accumulator: Accumulator,
    approx_bytes: AtomicUsize,
    dirty: AtomicBool,
    tainted: AtomicBool,
    owner: AtomicI32,
}

impl LocalTable {
    pub fn new(accumulator: Accumulator) -> Self {
        Self {
            data: DashMap::new(),
            accumulator,
            approx_bytes: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            tainted: AtomicBool::new(false),
            owner: AtomicI32::new(UNASSIGNED),
        }
    }

    pub fn owner(&self) -> WorkerId {
        self.owner.load(Ordering::SeqCst)
    }

    pub fn set_owner(&self, worker: WorkerId) {
        self.owner.store(worker, Ordering::SeqCst);
    }

    pub fn dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn set_dirty(&self, value: bool) {
        self.dirty.store(value, Ordering::SeqCst);
    }

    pub fn tainted(&self) -> bool {
        self.tainted.load(Ordering::SeqCst)
    }

    pub fn set_tainted(&self, value: bool) {
        self.tainted.store(value, Ordering::SeqCst);
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).map(|v| v.clone())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.data.contains_key(key)
    }

    /// Insert or fold through the accumulator on collision.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        let key_len = key.len();
        match self.data.entry(key) {
            Entry::Occupied(mut occupied) => {
                let merged = self.accumulator.combine(occupied.get(), &value)?;
                let old_len = occupied.get().len();
                self.adjust_bytes(merged.len() as isize - old_len as isize);
                occupied.insert(merged);
            }
            Entry::Vacant(vacant) => {
                self.adjust_bytes((key_len + value.len()) as isize);
                vacant.insert(value);
            }
        }
        Ok(())
    }

    /// Insert without accumulation. Snapshot restore and in-place kernel
    /// mutation go through here.
    pub fn insert_raw(&self, key: Vec<u8>, value: Vec<u8>) {
        match self.data.insert(key.clone(), value.clone()) {
            Some(old) => self.adjust_bytes(value.len() as isize - old.len() as isize),
            None => self.adjust_bytes((key.len() + value.len()) as isize),
        }
    }

    fn adjust_bytes(&self, delta: isize) {
        if delta >= 0 {
            self.approx_bytes.fetch_add(delta as usize, Ordering::SeqCst);
        } else {
            self.approx_bytes.fetch_sub((-delta) as usize, Ordering::SeqCst);
        }
    }

    pub fn clear(&self) {
        self.data.clear();
        self.approx_bytes.store(0, Ordering::SeqCst);
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes.load(Ordering::SeqCst)
    }

    /// Point-in-time copy of the shard's pairs.
    pub fn snapshot_pairs(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Serialize the shard into delta fragments of at most
    /// [`FLUSH_FRAGMENT_BYTES`] each. Always yields at least one fragment so
    /// an empty flush still carries the `done` flag to the receiver.
    pub fn serialize_fragments(
        &self,
        source: WorkerId,
        table: TableId,
        shard: i32,
        epoch: i64,
    ) -> Vec<TableDelta> {
        let mut fragments = Vec::new();
        let mut current = TableDelta::new(source, table, shard, epoch);
        let mut current_bytes = 0usize;

        for (key, value) in self.snapshot_pairs() {
            let pair_bytes = key.len() + value.len();
            if current_bytes > 0 && current_bytes + pair_bytes > FLUSH_FRAGMENT_BYTES {
                fragments.push(std::mem::replace(
                    &mut current,
                    TableDelta::new(source, table, shard, epoch),
                ));
                current_bytes = 0;
            }
            current.pairs.push((key, value));
            current_bytes += pair_bytes;
        }

        current.done = true;
        fragments.push(current);
        fragments
    }

    /// Fold a delta's pairs into the shard.
    pub fn apply_updates(&self, delta: &TableDelta) -> Result<()> {
        for (key, value) in &delta.pairs {
            self.put(key.clone(), value.clone())?;
        }
        Ok(())
    }
}
