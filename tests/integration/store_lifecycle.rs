#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;

use cumulus::{
    selector_from_path, AggregationStrategy, MemoryStore, MetricSpec, Sample, StoreError,
    BUFFER_CAP,
};
use proptest::prelude::*;

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
    m.insert(
        "power".to_string(),
        MetricSpec {
            frequency: 10,
            aggregation: AggregationStrategy::Sum,
        },
    );
    m
}

fn path(segments: &[&str]) -> Vec<String> {
    segments.iter().map(|s| s.to_string()).collect()
}

#[test]
fn write_then_read_round_trip() {
    let store = MemoryStore::new(&catalog()).unwrap();
    store
        .write(&path(&["alex", "a0603"]), &[Sample::new("cpu_load", 0.5, 1000)])
        .unwrap();

    let res = store
        .read(&selector_from_path(["alex", "a0603"]), "cpu_load", 1000, 1010, 0)
        .unwrap();
    assert_eq!(res.data, vec![0.5]);
    assert_eq!((res.from, res.to), (1000, 1010));
}

#[test]
fn gaps_read_back_as_nan() {
    let store = MemoryStore::new(&catalog()).unwrap();
    let p = path(&["alex", "a0603"]);
    store.write(&p, &[Sample::new("cpu_load", 1.0, 1000)]).unwrap();
    store.write(&p, &[Sample::new("cpu_load", 4.0, 1030)]).unwrap();

    let res = store
        .read(&selector_from_path(["alex", "a0603"]), "cpu_load", 1000, 1040, 0)
        .unwrap();
    assert_eq!(res.data.len(), 4);
    assert_eq!(res.data[0], 1.0);
    assert!(res.data[1].is_nan());
    assert!(res.data[2].is_nan());
    assert_eq!(res.data[3], 4.0);
}

#[test]
fn reads_span_buffer_rollover() {
    let store = MemoryStore::new(&catalog()).unwrap();
    let p = path(&["c", "h"]);
    let n = BUFFER_CAP + 8;
    for i in 0..n {
        store
            .write(&p, &[Sample::new("cpu_load", i as f32, 1000 + 10 * i as i64)])
            .unwrap();
    }

    let res = store
        .read(
            &selector_from_path(["c", "h"]),
            "cpu_load",
            1000,
            1000 + 10 * n as i64,
            0,
        )
        .unwrap();
    assert_eq!(res.data.len(), n);
    for (i, v) in res.data.iter().enumerate() {
        assert_eq!(*v, i as f32, "sample {i} survived the rollover");
    }
}

#[test]
fn sibling_scopes_aggregate_at_the_parent() {
    let store = MemoryStore::new(&catalog()).unwrap();
    store
        .write(&path(&["c", "h", "core0"]), &[Sample::new("temp", 60.0, 100)])
        .unwrap();
    store
        .write(&path(&["c", "h", "core1"]), &[Sample::new("temp", 80.0, 100)])
        .unwrap();

    let res = store
        .read(&selector_from_path(["c", "h"]), "temp", 100, 110, 0)
        .unwrap();
    assert_eq!(res.data, vec![70.0]);
}

#[test]
fn free_respects_the_threshold() {
    let store = MemoryStore::new(&catalog()).unwrap();
    let p = path(&["c", "h"]);
    let n = BUFFER_CAP + 3;
    for i in 0..n {
        store
            .write(&p, &[Sample::new("cpu_load", i as f32, 1000 + 10 * i as i64)])
            .unwrap();
    }

    // The full first buffer ends before the threshold and goes; the
    // three-sample head buffer survives.
    let head_first = 1000 + 10 * BUFFER_CAP as i64;
    assert_eq!(store.free(&p, head_first).unwrap(), 1);

    let res = store
        .read(
            &selector_from_path(["c", "h"]),
            "cpu_load",
            1000,
            1000 + 10 * n as i64,
            0,
        )
        .unwrap();
    assert_eq!(res.from, head_first);
    assert_eq!(
        res.data,
        vec![BUFFER_CAP as f32, (BUFFER_CAP + 1) as f32, (BUFFER_CAP + 2) as f32]
    );
}

#[test]
fn force_free_evicts_the_oldest_buffer_of_every_chain() {
    let store = MemoryStore::new(&catalog()).unwrap();
    let p = path(&["c", "h"]);
    let n = BUFFER_CAP + 4;
    for i in 0..n {
        store
            .write(&p, &[Sample::new("cpu_load", 1.0, 1000 + 10 * i as i64)])
            .unwrap();
    }
    store
        .write(&path(&["c", "h2"]), &[Sample::new("cpu_load", 1.0, 1000)])
        .unwrap();

    // h's chain shrinks by one buffer, h2's single-buffer chain empties.
    assert_eq!(store.force_free(), 2);
    assert!(store
        .read(&selector_from_path(["c", "h2"]), "cpu_load", 1000, 1010, 0)
        .is_err());
    let res = store
        .read(
            &selector_from_path(["c", "h"]),
            "cpu_load",
            1000,
            1000 + 10 * n as i64,
            0,
        )
        .unwrap();
    assert_eq!(res.data.len(), 4);
}

#[test]
fn concurrent_writers_and_readers_do_not_interfere() {
    let store = Arc::new(MemoryStore::new(&catalog()).unwrap());
    let hosts = 8;
    let samples = 200;

    std::thread::scope(|scope| {
        for h in 0..hosts {
            let store = Arc::clone(&store);
            scope.spawn(move || {
                let p = vec!["c".to_string(), format!("h{h}")];
                for i in 0..samples {
                    store
                        .write(&p, &[Sample::new("cpu_load", i as f32, 1000 + 10 * i as i64)])
                        .unwrap();
                }
            });
        }
        for _ in 0..4 {
            let store = Arc::clone(&store);
            scope.spawn(move || {
                for _ in 0..50 {
                    // Readers race the writers; any data they see must
                    // be internally consistent.
                    let _ = store.read(
                        &selector_from_path(["c", "h0"]),
                        "cpu_load",
                        1000,
                        1000 + 10 * samples as i64,
                        0,
                    );
                }
            });
        }
    });

    for h in 0..hosts {
        let sel = vec![
            cumulus::SelectorElement::String("c".to_string()),
            cumulus::SelectorElement::String(format!("h{h}")),
        ];
        let res = store
            .read(&sel, "cpu_load", 1000, 1000 + 10 * samples as i64, 0)
            .unwrap();
        assert_eq!(res.data.len(), samples);
        assert!(res.data.iter().all(|v| !v.is_nan()));
    }
}

#[test]
fn sum_aggregation_and_strategy_errors() {
    let store = MemoryStore::new(&catalog()).unwrap();
    for (i, sock) in ["socket0", "socket1"].into_iter().enumerate() {
        store
            .write(
                &path(&["c", "h", sock]),
                &[Sample::new("power", 100.0 * (i + 1) as f32, 100)],
            )
            .unwrap();
        store
            .write(
                &path(&["c", "h", sock]),
                &[Sample::new("cpu_load", 1.0, 100)],
            )
            .unwrap();
    }

    let res = store
        .read(&selector_from_path(["c", "h"]), "power", 100, 110, 0)
        .unwrap();
    assert_eq!(res.data, vec![300.0]);

    assert!(matches!(
        store
            .read(&selector_from_path(["c", "h"]), "cpu_load", 100, 110, 0)
            .unwrap_err(),
        StoreError::InvalidAggregation
    ));
}

proptest! {
    /// Ascending writes always read back exactly, wherever buffer
    /// boundaries fall.
    #[test]
    fn ascending_writes_round_trip(count in 1usize..700, start in 0i64..1_000_000) {
        let store = MemoryStore::new(&catalog()).unwrap();
        let p = path(&["c", "h"]);
        for i in 0..count {
            store
                .write(&p, &[Sample::new("cpu_load", i as f32, start + 10 * i as i64)])
                .unwrap();
        }
        let res = store
            .read(
                &selector_from_path(["c", "h"]),
                "cpu_load",
                start,
                start + 10 * count as i64,
                0,
            )
            .unwrap();
        prop_assert_eq!(res.data.len(), count);
        for (i, v) in res.data.iter().enumerate() {
            prop_assert_eq!(*v, i as f32);
        }
    }
}
