//! The metric store facade: catalog, level tree and read/write routing.

mod buffer;
mod health;
mod level;
mod pool;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::model::{AggregationStrategy, MetricConfig, MetricSpec, Sample, Selector};
use crate::resample;

pub use buffer::{Buffer, BufferChain};
pub use health::{HealthCheck, HealthStatus};
pub use level::Level;

/// The in-memory store. Built once at startup and shared via `Arc`;
/// background workers and the HTTP layer all operate on the same value.
#[derive(Debug)]
pub struct MemoryStore {
    root: Arc<Level>,
    metrics: HashMap<String, MetricConfig>,
    metric_names: Vec<String>,
}

/// A completed range read, after aggregation and downsampling.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub data: Vec<f32>,
    pub from: i64,
    pub to: i64,
    pub resolution: i64,
}

impl MemoryStore {
    /// Builds the store from the metric catalog, assigning each metric a
    /// dense offset into the per-level slot arrays.
    pub fn new(catalog: &HashMap<String, MetricSpec>) -> Result<Self> {
        let mut names: Vec<String> = catalog.keys().cloned().collect();
        names.sort();

        let mut metrics = HashMap::with_capacity(names.len());
        for (offset, name) in names.iter().enumerate() {
            let spec = &catalog[name];
            if spec.frequency <= 0 {
                return Err(StoreError::Init(format!(
                    "metric {name:?} has invalid frequency {}",
                    spec.frequency
                )));
            }
            metrics.insert(
                name.clone(),
                MetricConfig {
                    frequency: spec.frequency,
                    aggregation: spec.aggregation,
                    offset,
                },
            );
        }

        Ok(Self {
            root: Arc::new(Level::new(names.len())),
            metrics,
            metric_names: names,
        })
    }

    pub fn metric_config(&self, name: &str) -> Option<&MetricConfig> {
        self.metrics.get(name)
    }

    /// Metric names ordered by offset.
    pub fn metric_names(&self) -> &[String] {
        &self.metric_names
    }

    pub(crate) fn root(&self) -> &Arc<Level> {
        &self.root
    }

    /// Resolves (creating as needed) the level for an exact path. Ingest
    /// decoders cache the returned handle across homogeneous batches.
    pub fn get_level_or_create(&self, path: &[String]) -> Arc<Level> {
        self.root.find_level_or_create(path, self.metric_names.len())
    }

    pub fn get_level(&self, path: &[String]) -> Option<Arc<Level>> {
        self.root.find_level(path)
    }

    /// Writes every sample into `level` under a single write lock.
    /// Samples for names missing from the catalog are dropped.
    pub fn write_to_level(&self, level: &Level, samples: &[Sample]) -> Result<()> {
        let mut inner = level.write_inner();
        for sample in samples {
            let Some(mc) = self.metrics.get(&sample.name) else {
                debug!(metric = %sample.name, "dropping sample for unknown metric");
                continue;
            };
            let chain = inner.metrics[mc.offset].get_or_insert_with(BufferChain::new);
            chain.write(sample.timestamp, sample.value, mc.frequency)?;
        }
        Ok(())
    }

    /// Resolves `subpath` below an already-resolved level (typically a
    /// decoder's cached host level) and writes there.
    pub fn write_to_level_at(
        &self,
        level: &Arc<Level>,
        subpath: &[String],
        samples: &[Sample],
    ) -> Result<()> {
        let target = level.find_level_or_create(subpath, self.metric_names.len());
        self.write_to_level(&target, samples)
    }

    pub fn write(&self, path: &[String], samples: &[Sample]) -> Result<()> {
        let level = self.get_level_or_create(path);
        self.write_to_level(&level, samples)
    }

    /// Range read with spatial aggregation and LTTB downsampling.
    ///
    /// Every chain the selector matches accumulates into one output
    /// array; mismatched windows are trimmed at the tail when possible
    /// and rejected otherwise.
    pub fn read(
        &self,
        selector: &Selector,
        metric: &str,
        from: i64,
        to: i64,
        resolution: i64,
    ) -> Result<ReadResult> {
        if from > to {
            return Err(StoreError::InvalidTimeRange { from, to });
        }
        let mc = self
            .metrics
            .get(metric)
            .ok_or_else(|| StoreError::UnknownMetric(metric.to_string()))?;

        let capacity = ((to - from) / mc.frequency + 1) as usize;
        let mut data = vec![0.0f32; capacity];
        let mut sources = 0usize;
        let mut actual_from = 0i64;
        let mut actual_to = 0i64;
        let mut len = 0usize;

        self.root.find_buffers(selector, mc.offset, &mut |chain| {
            let (clen, cfrom, cto) = chain.read(from, to, &mut data)?;
            if sources == 0 {
                actual_from = cfrom;
                actual_to = cto;
                len = clen;
            } else if cfrom != actual_from {
                return Err(StoreError::DataDoesNotAlign);
            } else if cto != actual_to {
                actual_to = actual_to.min(cto);
                len = len.min(clen);
            }
            sources += 1;
            Ok(())
        })?;

        if sources == 0 {
            return Err(StoreError::NoHostOrMetric);
        }

        match mc.aggregation {
            AggregationStrategy::Avg => {
                let factor = 1.0 / sources as f32;
                for v in data.iter_mut() {
                    *v *= factor;
                }
            }
            AggregationStrategy::Sum => {}
            AggregationStrategy::None => {
                if sources > 1 {
                    return Err(StoreError::InvalidAggregation);
                }
            }
        }

        data.truncate(len);
        let (data, resolution) =
            resample::largest_triangle_three_bucket(data, mc.frequency, resolution)?;
        Ok(ReadResult {
            data,
            from: actual_from,
            to: actual_to,
            resolution,
        })
    }

    /// Frees buffers ending before `threshold` below the selected level.
    pub fn free(&self, path: &[String], threshold: i64) -> Result<usize> {
        match self.root.find_level(path) {
            Some(level) => Ok(level.free(threshold)),
            None => Ok(0),
        }
    }

    /// Removes the oldest buffer from every chain in the tree; one pass
    /// of the memory-pressure path.
    pub fn force_free(&self) -> usize {
        self.root.force_free()
    }

    /// Releases every buffer and destroys all levels.
    pub fn free_all(&self) -> usize {
        let freed = self.root.free(i64::MAX);
        let mut inner = self.root.write_inner();
        inner.children.clear();
        freed
    }

    pub fn size_in_bytes(&self) -> usize {
        self.root.size_in_bytes()
    }

    pub fn list_children(&self, path: &[String]) -> Vec<String> {
        self.root
            .find_level(path)
            .map(|l| l.list_children())
            .unwrap_or_default()
    }

    pub fn collect_paths(&self, depth: usize) -> Vec<Vec<String>> {
        self.root.collect_paths(depth)
    }

    pub(crate) fn levels_at_depth(&self, depth: usize) -> Vec<(Vec<String>, Arc<Level>)> {
        self.root.levels_at_depth(depth)
    }

    /// Tree state below `path` as JSON, for the debug endpoint.
    pub fn debug_dump(&self, path: &[String]) -> serde_json::Value {
        match self.root.find_level(path) {
            Some(level) => self.dump_level(&level),
            None => serde_json::Value::Null,
        }
    }

    fn dump_level(&self, level: &Arc<Level>) -> serde_json::Value {
        let (metrics, children) = {
            let inner = level.read_inner();
            let mut metrics = serde_json::Map::new();
            for (offset, name) in self.metric_names.iter().enumerate() {
                if let Some(chain) = inner.metrics[offset].as_ref() {
                    if chain.is_empty() {
                        continue;
                    }
                    metrics.insert(
                        name.clone(),
                        serde_json::json!({
                            "buffers": chain.depth(),
                            "samples": chain.count(),
                            "from": chain.oldest().map(|b| b.first_write()),
                            "to": chain.head().map(|b| b.end()),
                        }),
                    );
                }
            }
            let children: Vec<(String, Arc<Level>)> = inner
                .children
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect();
            (metrics, children)
        };

        let mut child_map = serde_json::Map::new();
        for (name, child) in children {
            child_map.insert(name, self.dump_level(&child));
        }
        serde_json::json!({ "metrics": metrics, "children": child_map })
    }
}

static INSTANCE: OnceLock<Arc<MemoryStore>> = OnceLock::new();

/// Publishes the store for code that cannot thread the `Arc` through
/// (the HTTP layer). May be called exactly once per process.
pub fn init_global(store: Arc<MemoryStore>) -> Result<()> {
    INSTANCE
        .set(store)
        .map_err(|_| StoreError::Init("memory store initialized twice".into()))
}

pub fn global() -> Option<Arc<MemoryStore>> {
    INSTANCE.get().cloned()
}
