#![allow(missing_docs)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cumulus::checkpoint::Checkpointer;
use cumulus::config::{CheckpointConfig, FileFormat};
use cumulus::decoder::LineProtocolDecoder;
use cumulus::util::unix_now;
use cumulus::{selector_from_path, AggregationStrategy, MemoryStore, MetricSpec};

fn catalog() -> HashMap<String, MetricSpec> {
    let mut m = HashMap::new();
    m.insert(
        "cpu_load".to_string(),
        MetricSpec {
            frequency: 10,
            aggregation: AggregationStrategy::None,
        },
    );
    m
}

fn wal_config(dir: &Path) -> CheckpointConfig {
    CheckpointConfig {
        file_format: FileFormat::Wal,
        interval: Duration::from_secs(3600),
        directory: dir.to_path_buf(),
        restore: Duration::from_secs(48 * 3600),
    }
}

#[test]
fn wal_replays_unsnapshotted_writes_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let now = unix_now();
    let base = now - 100;

    let store = Arc::new(MemoryStore::new(&catalog()).unwrap());
    let cp = Checkpointer::new(Arc::clone(&store), wal_config(dir.path()), 2).unwrap();

    // Ingest tees every accepted sample into the tail.
    let mut decoder = LineProtocolDecoder::new(Arc::clone(&store), None)
        .with_staging(cp.staging().expect("wal format stages"));
    let body = format!(
        "cpu_load,cluster=c,hostname=h value=1.5 {}\ncpu_load,cluster=c,hostname=h value=2.5 {}\n",
        base,
        base + 10
    );
    assert_eq!(decoder.decode(&body).accepted, 2);
    drop(decoder);

    // Simulate a crash before any snapshot: flush the tail, then drop
    // everything without checkpointing.
    cp.close_staging();
    drop(cp);
    drop(store);

    let fresh = Arc::new(MemoryStore::new(&catalog()).unwrap());
    let cp2 = Checkpointer::new(Arc::clone(&fresh), wal_config(dir.path()), 2).unwrap();
    assert_eq!(cp2.restore().unwrap(), 2);

    let res = fresh
        .read(&selector_from_path(["c", "h"]), "cpu_load", base, base + 20, 0)
        .unwrap();
    assert_eq!(res.data, vec![1.5, 2.5]);
}

#[test]
fn snapshot_rotation_empties_the_tail() {
    let dir = tempfile::tempdir().unwrap();
    let now = unix_now();
    let base = now - 100;

    let store = Arc::new(MemoryStore::new(&catalog()).unwrap());
    let cp = Checkpointer::new(Arc::clone(&store), wal_config(dir.path()), 2).unwrap();

    let mut decoder = LineProtocolDecoder::new(Arc::clone(&store), None)
        .with_staging(cp.staging().expect("wal format stages"));
    decoder.decode(&format!("cpu_load,cluster=c,hostname=h value=1 {base}\n"));
    drop(decoder);
    cp.close_staging();

    // The snapshot covers the tail's window, so the tail is rotated
    // down to a bare header and replays nothing.
    cp.checkpoint_range(base - 10, now).unwrap();
    drop(cp);

    let fresh = Arc::new(MemoryStore::new(&catalog()).unwrap());
    let cp2 = Checkpointer::new(Arc::clone(&fresh), wal_config(dir.path()), 2).unwrap();
    cp2.restore().unwrap();

    // Data comes back from the snapshot, not the tail.
    let res = fresh
        .read(&selector_from_path(["c", "h"]), "cpu_load", base, base + 10, 0)
        .unwrap();
    assert_eq!(res.data, vec![1.0]);
}
