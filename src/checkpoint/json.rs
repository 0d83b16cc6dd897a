//! The self-describing per-level snapshot format.
//!
//! One `CheckpointFile` serializes a host subtree: metric arrays with
//! NaN gaps rendered as `null`, plus recursive children. It is the
//! canonical interchange unit between memory and disk.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;
use crate::store::{Buffer, BufferChain, Level, MemoryStore};

/// An f32 whose NaN bit pattern round-trips through JSON as `null`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GapValue(pub f32);

impl Serialize for GapValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.0.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_f32(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for GapValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let v = Option::<f32>::deserialize(deserializer)?;
        Ok(GapValue(v.unwrap_or(f32::NAN)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetrics {
    pub frequency: i64,
    /// Timestamp of `data[0]`.
    pub start: i64,
    pub data: Vec<GapValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub from: i64,
    pub to: i64,
    pub metrics: HashMap<String, CheckpointMetrics>,
    pub children: HashMap<String, CheckpointFile>,
}

impl CheckpointFile {
    /// Serializes a level subtree for `[from, to)`. Metrics whose every
    /// covering buffer is already on disk are skipped; a subtree with
    /// nothing to say yields `None`.
    ///
    /// The level's read lock is held for the whole walk, so one host's
    /// snapshot is internally consistent.
    pub fn from_level(
        store: &MemoryStore,
        level: &Arc<Level>,
        from: i64,
        to: i64,
    ) -> Result<Option<CheckpointFile>> {
        let inner = level.read_inner();

        let mut metrics = HashMap::new();
        for (offset, name) in store.metric_names().iter().enumerate() {
            let Some(chain) = inner.metrics[offset].as_ref() else {
                continue;
            };
            if chain.is_empty() {
                continue;
            }

            let mut all_archived = true;
            chain.iter_from_to(from, to, |b: &Buffer| {
                if !b.archived() {
                    all_archived = false;
                }
                Ok(())
            })?;
            if all_archived {
                continue;
            }

            let mc = store.metric_config(name).expect("catalog metric");
            let capacity = ((to - from) / mc.frequency + 1) as usize;
            let mut data = vec![0.0f32; capacity];
            let (len, cfrom, _cto) = chain.read(from, to, &mut data)?;
            if len == 0 {
                continue;
            }
            data.truncate(len);
            metrics.insert(
                name.clone(),
                CheckpointMetrics {
                    frequency: mc.frequency,
                    start: cfrom,
                    data: data.into_iter().map(GapValue).collect(),
                },
            );
        }

        let mut children = HashMap::new();
        for (name, child) in inner.children.iter() {
            if let Some(file) = CheckpointFile::from_level(store, child, from, to)? {
                children.insert(name.clone(), file);
            }
        }

        if metrics.is_empty() && children.is_empty() {
            return Ok(None);
        }
        Ok(Some(CheckpointFile {
            from,
            to,
            metrics,
            children,
        }))
    }

    /// Materializes this snapshot below `level`. Buffers keep their
    /// natural length and are marked as already persisted.
    pub fn restore_into(&self, store: &MemoryStore, level: &Arc<Level>) -> Result<usize> {
        let mut loaded = 0;
        {
            let mut inner = level.write_inner();
            for (name, cm) in &self.metrics {
                let Some(mc) = store.metric_config(name) else {
                    continue;
                };
                let data: Vec<f32> = cm.data.iter().map(|g| g.0).collect();
                if data.is_empty() {
                    continue;
                }
                let anchor = cm.start - cm.frequency / 2;
                let chain = inner.metrics[mc.offset].get_or_insert_with(BufferChain::new);
                chain.push_loaded(Buffer::from_snapshot(anchor, cm.frequency, data));
                loaded += 1;
            }
        }
        for (name, child_file) in &self.children {
            let segment = [name.clone()];
            let child = level.find_level_or_create(&segment, store.metric_names().len());
            loaded += child_file.restore_into(store, &child)?;
        }
        Ok(loaded)
    }
}
