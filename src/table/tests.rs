use super::checkpoint::{self, DeltaLog};
use super::local::{LocalTable, FLUSH_FRAGMENT_BYTES};
use super::protocol::TableDelta;
use super::types::{Accumulator, Sharder};

fn key(k: i64) -> Vec<u8> {
    bincode::serialize(&k).unwrap()
}

fn val(v: i64) -> Vec<u8> {
    bincode::serialize(&v).unwrap()
}

fn as_i64(bytes: &[u8]) -> i64 {
    bincode::deserialize(bytes).unwrap()
}

#[test]
fn sum_accumulator_folds_collisions() {
    let table = LocalTable::new(Accumulator::SumI64);
    table.put(key(1), val(10)).unwrap();
    table.put(key(1), val(32)).unwrap();
    assert_eq!(as_i64(&table.get(&key(1)).unwrap()), 42);
}

#[test]
fn replace_accumulator_keeps_last_write() {
    let table = LocalTable::new(Accumulator::Replace);
    table.put(key(1), val(10)).unwrap();
    table.put(key(1), val(99)).unwrap();
    assert_eq!(as_i64(&table.get(&key(1)).unwrap()), 99);
}

#[test]
fn min_max_accumulators() {
    let min = Accumulator::MinI64;
    assert_eq!(as_i64(&min.combine(&val(3), &val(8)).unwrap()), 3);
    let max = Accumulator::MaxF64;
    let combined = max
        .combine(
            &bincode::serialize(&1.5f64).unwrap(),
            &bincode::serialize(&2.5f64).unwrap(),
        )
        .unwrap();
    let out: f64 = bincode::deserialize(&combined).unwrap();
    assert_eq!(out, 2.5);
}

#[test]
fn custom_accumulator_wraps_typed_function() {
    let accum = Accumulator::custom::<Vec<f64>, _>(|a, b| {
        a.iter().zip(b.iter()).map(|(x, y)| x + y).collect()
    });
    let combined = accum
        .combine(
            &bincode::serialize(&vec![1.0, 2.0]).unwrap(),
            &bincode::serialize(&vec![10.0, 20.0]).unwrap(),
        )
        .unwrap();
    let out: Vec<f64> = bincode::deserialize(&combined).unwrap();
    assert_eq!(out, vec![11.0, 22.0]);
}

#[test]
fn accumulator_is_order_independent() {
    let writes = [5i64, -3, 12, 7];
    let forward = writes
        .iter()
        .fold(val(0), |acc, w| {
            Accumulator::SumI64.combine(&acc, &val(*w)).unwrap()
        });
    let reverse = writes
        .iter()
        .rev()
        .fold(val(0), |acc, w| {
            Accumulator::SumI64.combine(&acc, &val(*w)).unwrap()
        });
    assert_eq!(as_i64(&forward), as_i64(&reverse));
    assert_eq!(as_i64(&forward), 21);
}

#[test]
fn mod_sharding_routes_by_key_value() {
    let sharder = Sharder::Mod;
    assert_eq!(sharder.shard(&key(0), 4).unwrap(), 0);
    assert_eq!(sharder.shard(&key(5), 4).unwrap(), 1);
    assert_eq!(sharder.shard(&key(-1), 4).unwrap(), 3);
}

#[test]
fn hash_sharding_is_deterministic_and_in_range() {
    let sharder = Sharder::Hash;
    for k in 0..1000i64 {
        let first = sharder.shard(&key(k), 16).unwrap();
        let second = sharder.shard(&key(k), 16).unwrap();
        assert_eq!(first, second);
        assert!(first < 16);
    }
}

#[test]
fn local_table_tracks_size_and_bytes() {
    let table = LocalTable::new(Accumulator::Replace);
    assert!(table.is_empty());
    table.put(key(1), val(1)).unwrap();
    table.put(key(2), val(2)).unwrap();
    assert_eq!(table.len(), 2);
    assert!(table.approx_bytes() > 0);

    table.clear();
    assert!(table.is_empty());
    assert_eq!(table.approx_bytes(), 0);
}

#[test]
fn delta_serialization_roundtrip_preserves_pairs() {
    let table = LocalTable::new(Accumulator::SumI64);
    for k in 0..100 {
        table.put(key(k), val(k * 3)).unwrap();
    }

    let fragments = table.serialize_fragments(0, 0, 0, 0);
    let encoded: Vec<Vec<u8>> = fragments
        .iter()
        .map(|f| bincode::serialize(f).unwrap())
        .collect();

    let restored = LocalTable::new(Accumulator::SumI64);
    for bytes in &encoded {
        let delta: TableDelta = bincode::deserialize(bytes).unwrap();
        restored.apply_updates(&delta).unwrap();
    }

    assert_eq!(restored.len(), 100);
    for k in 0..100 {
        assert_eq!(as_i64(&restored.get(&key(k)).unwrap()), k * 3);
    }
}

#[test]
fn large_shard_streams_as_multiple_fragments() {
    let table = LocalTable::new(Accumulator::Replace);
    // ~3 MiB of values against a 1 MiB fragment budget.
    for k in 0..48 {
        table.put(key(k), vec![0u8; 64 * 1024]).unwrap();
    }

    let fragments = table.serialize_fragments(0, 0, 0, 0);
    assert!(fragments.len() > 1);
    for fragment in &fragments[..fragments.len() - 1] {
        assert!(!fragment.done);
        assert!(fragment.pair_bytes() <= FLUSH_FRAGMENT_BYTES);
    }
    assert!(fragments.last().unwrap().done);

    let total: usize = fragments.iter().map(|f| f.pairs.len()).sum();
    assert_eq!(total, 48);
}

#[test]
fn empty_flush_still_carries_done() {
    let table = LocalTable::new(Accumulator::Replace);
    let fragments = table.serialize_fragments(3, 1, 2, 0);
    assert_eq!(fragments.len(), 1);
    assert!(fragments[0].done);
    assert!(fragments[0].pairs.is_empty());
    assert_eq!(fragments[0].source, 3);
}

#[test]
fn replayed_delta_is_idempotent_only_under_replace() {
    let mut delta = TableDelta::new(0, 0, 0, 0);
    delta.pairs.push((key(1), val(5)));
    delta.done = true;

    let replace = LocalTable::new(Accumulator::Replace);
    replace.apply_updates(&delta).unwrap();
    replace.apply_updates(&delta).unwrap();
    assert_eq!(as_i64(&replace.get(&key(1)).unwrap()), 5);

    let sum = LocalTable::new(Accumulator::SumI64);
    sum.apply_updates(&delta).unwrap();
    sum.apply_updates(&delta).unwrap();
    // A sum accumulator doubles contributions on replay; accepted deltas
    // must therefore never be replayed outside recovery.
    assert_eq!(as_i64(&sum.get(&key(1)).unwrap()), 10);
}

#[test]
fn snapshot_roundtrip_restores_every_shard() {
    let dir = tempfile::tempdir().unwrap();
    let path = checkpoint::snapshot_path(dir.path(), 4, 2);

    let shards = vec![
        (0usize, vec![(key(0), val(1)), (key(2), val(3))]),
        (2usize, vec![(key(1), val(7))]),
    ];
    checkpoint::write_snapshot(&path, 4, 2, 4, &shards).unwrap();

    let restored = checkpoint::read_snapshot(&path).unwrap();
    assert_eq!(restored.len(), 2);
    assert_eq!(restored[0].0, 0);
    assert_eq!(restored[0].1.len(), 2);
    assert_eq!(restored[1].0, 2);
    assert_eq!(as_i64(&restored[1].1[0].1), 7);
}

#[test]
fn truncated_snapshot_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = checkpoint::snapshot_path(dir.path(), 1, 1);

    let shards = vec![(0usize, vec![(key(0), val(1)), (key(1), val(2))])];
    checkpoint::write_snapshot(&path, 1, 1, 2, &shards).unwrap();

    // Chop the tail off the body; the extents in the header no longer match
    // what can be read back.
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 4).unwrap();

    assert!(checkpoint::read_snapshot(&path).is_err());
}

#[test]
fn delta_log_replays_in_arrival_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = checkpoint::delta_log_path(dir.path(), 0, 1);

    let mut log = DeltaLog::open(path.clone()).unwrap();
    for k in 0..3 {
        let mut delta = TableDelta::new(1, 0, 0, 0);
        delta.pairs.push((key(k), val(k)));
        log.append(&delta).unwrap();
    }
    log.finish().unwrap();

    let replayed = checkpoint::read_delta_log(&path).unwrap();
    assert_eq!(replayed.len(), 3);
    for (i, delta) in replayed.iter().enumerate() {
        assert_eq!(as_i64(&delta.pairs[0].0), i as i64);
    }
}

#[test]
fn missing_delta_log_reads_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = checkpoint::delta_log_path(dir.path(), 9, 9);
    assert!(checkpoint::read_delta_log(&path).unwrap().is_empty());
}

#[test]
fn epoch_marker_has_no_data() {
    let marker = TableDelta::epoch_marker(2, 5);
    assert!(marker.is_marker());
    assert_eq!(marker.marker, 5);
    assert!(marker.done);
    assert!(marker.pairs.is_empty());

    let plain = TableDelta::new(0, 0, 0, 0);
    assert!(!plain.is_marker());
}
