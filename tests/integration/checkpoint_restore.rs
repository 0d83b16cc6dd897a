#![allow(missing_docs)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cumulus::checkpoint::{Checkpointer, StagedSample};
use cumulus::config::{CheckpointConfig, CleanupConfig, CleanupMode, FileFormat};
use cumulus::archive::Cleaner;
use cumulus::util::unix_now;
use cumulus::{selector_from_path, AggregationStrategy, MemoryStore, MetricSpec, Sample};

fn catalog() -> HashMap<String, MetricSpec> {
    let mut m = HashMap::new();
    m.insert(
        "cpu_load".to_string(),
        MetricSpec {
            frequency: 10,
            aggregation: AggregationStrategy::None,
        },
    );
    m.insert(
        "temp".to_string(),
        MetricSpec {
            frequency: 10,
            aggregation: AggregationStrategy::Avg,
        },
    );
    m
}

fn checkpoint_config(dir: &Path, format: FileFormat) -> CheckpointConfig {
    CheckpointConfig {
        file_format: format,
        interval: Duration::from_secs(3600),
        directory: dir.to_path_buf(),
        restore: Duration::from_secs(48 * 3600),
    }
}

/// Write, snapshot, clear memory, restore, read back.
#[test]
fn json_checkpoint_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let now = unix_now();
    let base = now - 200;

    let store = Arc::new(MemoryStore::new(&catalog()).unwrap());
    let node = ["alex".to_string(), "a0603".to_string()];
    let core = ["alex".to_string(), "a0603".to_string(), "core0".to_string()];
    for (i, v) in [1.0f32, 2.0, 3.0].iter().enumerate() {
        store
            .write(&node, &[Sample::new("cpu_load", *v, base + 10 * i as i64)])
            .unwrap();
        store
            .write(&core, &[Sample::new("temp", 50.0 + *v, base + 10 * i as i64)])
            .unwrap();
    }

    let cp = Checkpointer::new(
        Arc::clone(&store),
        checkpoint_config(dir.path(), FileFormat::Json),
        4,
    )
    .unwrap();
    assert_eq!(cp.checkpoint_range(base - 10, now).unwrap(), 1);

    // "Restart": a brand-new store restored from disk.
    let fresh = Arc::new(MemoryStore::new(&catalog()).unwrap());
    let cp2 = Checkpointer::new(
        Arc::clone(&fresh),
        checkpoint_config(dir.path(), FileFormat::Json),
        4,
    )
    .unwrap();
    assert!(cp2.restore().unwrap() > 0);

    let res = fresh
        .read(
            &selector_from_path(["alex", "a0603"]),
            "cpu_load",
            base,
            base + 30,
            0,
        )
        .unwrap();
    assert_eq!(res.data, vec![1.0, 2.0, 3.0]);

    let res = fresh
        .read(
            &selector_from_path(["alex", "a0603", "core0"]),
            "temp",
            base,
            base + 30,
            0,
        )
        .unwrap();
    assert_eq!(res.data, vec![51.0, 52.0, 53.0]);
}

/// Writes continue cleanly on top of restored snapshot buffers.
#[test]
fn writes_resume_after_restore() {
    let dir = tempfile::tempdir().unwrap();
    let now = unix_now();
    let base = now - 200;

    let store = Arc::new(MemoryStore::new(&catalog()).unwrap());
    let node = ["c".to_string(), "h".to_string()];
    for i in 0..3i64 {
        store
            .write(&node, &[Sample::new("cpu_load", i as f32, base + 10 * i)])
            .unwrap();
    }
    let cp = Checkpointer::new(
        Arc::clone(&store),
        checkpoint_config(dir.path(), FileFormat::Json),
        2,
    )
    .unwrap();
    cp.checkpoint_range(base - 10, now).unwrap();

    let fresh = Arc::new(MemoryStore::new(&catalog()).unwrap());
    let cp2 = Checkpointer::new(
        Arc::clone(&fresh),
        checkpoint_config(dir.path(), FileFormat::Json),
        2,
    )
    .unwrap();
    cp2.restore().unwrap();

    for i in 3..6i64 {
        fresh
            .write(&node, &[Sample::new("cpu_load", i as f32, base + 10 * i)])
            .unwrap();
    }

    let res = fresh
        .read(&selector_from_path(["c", "h"]), "cpu_load", base, base + 60, 0)
        .unwrap();
    assert_eq!(res.data, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
}

#[test]
fn compact_checkpoint_round_trips_through_staging() {
    let dir = tempfile::tempdir().unwrap();
    let now = unix_now();
    let base = now - 100;

    let store = Arc::new(MemoryStore::new(&catalog()).unwrap());
    let cp = Checkpointer::new(
        Arc::clone(&store),
        checkpoint_config(dir.path(), FileFormat::Binary),
        2,
    )
    .unwrap();

    let staging = cp.staging().expect("compact format stages");
    for (i, v) in [4.0f32, 5.0, 6.0].iter().enumerate() {
        staging
            .send(StagedSample {
                cluster: "c".into(),
                host: "h".into(),
                subpath: vec!["core0".into()],
                metric: "temp".into(),
                frequency: 10,
                timestamp: base + 10 * i as i64,
                value: *v,
            })
            .unwrap();
    }
    drop(staging);
    cp.shutdown();

    let fresh = Arc::new(MemoryStore::new(&catalog()).unwrap());
    let cp2 = Checkpointer::new(
        Arc::clone(&fresh),
        checkpoint_config(dir.path(), FileFormat::Binary),
        2,
    )
    .unwrap();
    assert_eq!(cp2.restore().unwrap(), 1);

    let res = fresh
        .read(
            &selector_from_path(["c", "h", "core0"]),
            "temp",
            base,
            base + 30,
            0,
        )
        .unwrap();
    assert_eq!(res.data, vec![4.0, 5.0, 6.0]);
}

/// Snapshotting one host blocks writers to that host only for the
/// duration of its walk; ingest into other hosts proceeds throughout.
#[test]
fn snapshots_run_concurrently_with_ingest() {
    let dir = tempfile::tempdir().unwrap();
    let now = unix_now();
    let base = now - 500;

    let store = Arc::new(MemoryStore::new(&catalog()).unwrap());
    for h in 0..4 {
        let path = ["c".to_string(), format!("h{h}")];
        store
            .write(&path, &[Sample::new("cpu_load", 0.0, base)])
            .unwrap();
    }
    let cp = Checkpointer::new(
        Arc::clone(&store),
        checkpoint_config(dir.path(), FileFormat::Json),
        4,
    )
    .unwrap();

    std::thread::scope(|scope| {
        for h in 0..4 {
            let store = Arc::clone(&store);
            scope.spawn(move || {
                let path = ["c".to_string(), format!("h{h}")];
                for i in 1..200i64 {
                    store
                        .write(&path, &[Sample::new("cpu_load", i as f32, base + 10 * i)])
                        .unwrap();
                }
            });
        }
        scope.spawn(|| {
            for _ in 0..5 {
                let _ = cp.checkpoint_range(base - 10, now);
            }
        });
    });

    assert!(dir.path().join("c").join("h0").exists());
    for h in 0..4 {
        let sel = vec![
            cumulus::SelectorElement::String("c".to_string()),
            cumulus::SelectorElement::String(format!("h{h}")),
        ];
        let res = store
            .read(&sel, "cpu_load", base, base + 10 * 200, 0)
            .unwrap();
        assert_eq!(res.data.len(), 200);
    }
}

#[test]
fn cleanup_archives_then_deletes_old_snapshots() {
    let checkpoint_dir = tempfile::tempdir().unwrap();
    let archive_dir = tempfile::tempdir().unwrap();
    let now = unix_now();
    let old = now - 8 * 3600;

    // An old snapshot on disk, as if written by a much earlier pass.
    let store = Arc::new(MemoryStore::new(&catalog()).unwrap());
    let node = ["c".to_string(), "h".to_string()];
    for i in 0..3i64 {
        store
            .write(&node, &[Sample::new("cpu_load", i as f32, old + 10 * i)])
            .unwrap();
    }
    let cp = Checkpointer::new(
        Arc::clone(&store),
        checkpoint_config(checkpoint_dir.path(), FileFormat::Json),
        2,
    )
    .unwrap();
    cp.checkpoint_range(old, old + 60).unwrap();

    let cleaner = Cleaner::new(
        &CleanupConfig {
            mode: CleanupMode::Archive,
            interval: Duration::from_secs(3600),
            directory: archive_dir.path().to_path_buf(),
            compress: false,
        },
        checkpoint_dir.path().to_path_buf(),
    );
    assert_eq!(cleaner.run_once().unwrap(), 1);

    assert!(!checkpoint_dir
        .path()
        .join("c/h")
        .join(format!("{old}.json"))
        .exists());
    let archived = archive_dir.path().join("c").join(format!("{old}.csv"));
    let content = std::fs::read_to_string(&archived).unwrap();
    assert!(content.lines().count() > 1);
    assert!(content.contains("cpu_load"));
}
