//! Hierarchical level tree: cluster → host → subcomponents.
//!
//! Every level guards its per-metric chains and its children map behind
//! one read-write lock. Growth happens only on write paths, with a
//! double-checked upgrade so concurrent writers race safely. Locks are
//! never held across parent-child descent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Result;
use crate::model::SelectorElement;
use crate::store::buffer::BufferChain;

#[derive(Debug)]
pub struct Level {
    inner: RwLock<LevelInner>,
}

#[derive(Debug)]
pub(crate) struct LevelInner {
    /// Dense slots indexed by `MetricConfig::offset`; each holds the
    /// chain for one metric, if any was ever written here.
    pub(crate) metrics: Vec<Option<BufferChain>>,
    pub(crate) children: HashMap<String, Arc<Level>>,
}

impl Level {
    pub fn new(metric_count: usize) -> Self {
        let mut metrics = Vec::with_capacity(metric_count);
        metrics.resize_with(metric_count, || None);
        Self {
            inner: RwLock::new(LevelInner {
                metrics,
                children: HashMap::new(),
            }),
        }
    }

    pub(crate) fn read_inner(&self) -> RwLockReadGuard<'_, LevelInner> {
        self.inner.read()
    }

    pub(crate) fn write_inner(&self) -> RwLockWriteGuard<'_, LevelInner> {
        self.inner.write()
    }

    /// Descends `path` from this level, creating missing children. Each
    /// step takes the read lock first and only upgrades to the write
    /// lock on a miss, re-checking after the upgrade.
    pub fn find_level_or_create(self: &Arc<Self>, path: &[String], metric_count: usize) -> Arc<Level> {
        let Some(head) = path.first() else {
            return Arc::clone(self);
        };

        {
            let inner = self.inner.read();
            if let Some(child) = inner.children.get(head) {
                let child = Arc::clone(child);
                drop(inner);
                return child.find_level_or_create(&path[1..], metric_count);
            }
        }

        let child = {
            let mut inner = self.inner.write();
            match inner.children.get(head) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let created = Arc::new(Level::new(metric_count));
                    inner.children.insert(head.clone(), Arc::clone(&created));
                    created
                }
            }
        };
        child.find_level_or_create(&path[1..], metric_count)
    }

    /// Read-only descent; `None` when any segment is missing.
    pub fn find_level(self: &Arc<Self>, path: &[String]) -> Option<Arc<Level>> {
        let Some(head) = path.first() else {
            return Some(Arc::clone(self));
        };
        let child = {
            let inner = self.inner.read();
            Arc::clone(inner.children.get(head)?)
        };
        child.find_level(&path[1..])
    }

    /// Invokes `cb` on every chain at `offset` selected by the pattern.
    /// An exhausted pattern visits this level's own chain and then every
    /// descendant, so aggregation pulls values up from deeper scopes.
    pub fn find_buffers<F>(
        self: &Arc<Self>,
        selector: &[SelectorElement],
        offset: usize,
        cb: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&BufferChain) -> Result<()>,
    {
        match selector.first() {
            None => {
                let descend: Vec<Arc<Level>> = {
                    let inner = self.inner.read();
                    if let Some(chain) = inner.metrics[offset].as_ref() {
                        if !chain.is_empty() {
                            cb(chain)?;
                        }
                    }
                    inner.children.values().map(Arc::clone).collect()
                };
                for child in descend {
                    child.find_buffers(selector, offset, cb)?;
                }
                Ok(())
            }
            Some(element) => {
                let matched: Vec<Arc<Level>> = {
                    let inner = self.inner.read();
                    match element {
                        SelectorElement::String(name) => {
                            inner.children.get(name).map(Arc::clone).into_iter().collect()
                        }
                        SelectorElement::Group(names) => names
                            .iter()
                            .filter_map(|n| inner.children.get(n).map(Arc::clone))
                            .collect(),
                        SelectorElement::Any => inner.children.values().map(Arc::clone).collect(),
                    }
                };
                for child in matched {
                    child.find_buffers(&selector[1..], offset, cb)?;
                }
                Ok(())
            }
        }
    }

    /// Frees every buffer in the subtree whose window ends before
    /// `threshold`. Returns the number of buffers freed.
    pub fn free(self: &Arc<Self>, threshold: i64) -> usize {
        let mut freed = 0;
        let children: Vec<Arc<Level>> = {
            let mut inner = self.inner.write();
            for slot in inner.metrics.iter_mut() {
                if let Some(chain) = slot.as_mut() {
                    freed += chain.free(threshold);
                    if chain.is_empty() {
                        *slot = None;
                    }
                }
            }
            inner.children.values().map(Arc::clone).collect()
        };
        for child in children {
            freed += child.free(threshold);
        }
        freed
    }

    /// Removes the oldest buffer from every chain in the subtree.
    /// Returns the number of buffers evicted.
    pub fn force_free(self: &Arc<Self>) -> usize {
        let mut freed = 0;
        let children: Vec<Arc<Level>> = {
            let mut inner = self.inner.write();
            for slot in inner.metrics.iter_mut() {
                if let Some(chain) = slot.as_mut() {
                    if chain.force_free_oldest() {
                        freed += 1;
                    }
                    if chain.is_empty() {
                        *slot = None;
                    }
                }
            }
            inner.children.values().map(Arc::clone).collect()
        };
        for child in children {
            freed += child.force_free();
        }
        freed
    }

    /// Approximate subtree payload size: sample count times the sample
    /// width, ignoring container overhead.
    pub fn size_in_bytes(self: &Arc<Self>) -> usize {
        let mut size = 0;
        let children: Vec<Arc<Level>> = {
            let inner = self.inner.read();
            for chain in inner.metrics.iter().flatten() {
                size += chain.count() * std::mem::size_of::<f32>();
            }
            inner.children.values().map(Arc::clone).collect()
        };
        for child in children {
            size += child.size_in_bytes();
        }
        size
    }

    /// Newest sample timestamp anywhere in the subtree, if any.
    pub fn newest_sample(self: &Arc<Self>) -> Option<i64> {
        let mut newest = None;
        let children: Vec<Arc<Level>> = {
            let inner = self.inner.read();
            for chain in inner.metrics.iter().flatten() {
                if let Some(head) = chain.head() {
                    let end = head.end();
                    if newest.map_or(true, |n| end > n) {
                        newest = Some(end);
                    }
                }
            }
            inner.children.values().map(Arc::clone).collect()
        };
        for child in children {
            if let Some(end) = child.newest_sample() {
                if newest.map_or(true, |n| end > n) {
                    newest = Some(end);
                }
            }
        }
        newest
    }

    /// Direct child names, sorted for stable output.
    pub fn list_children(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner.children.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every selector path of exactly `depth` segments below this level.
    pub fn collect_paths(self: &Arc<Self>, depth: usize) -> Vec<Vec<String>> {
        self.levels_at_depth(depth)
            .into_iter()
            .map(|(path, _)| path)
            .collect()
    }

    /// `(path, level)` pairs at exactly `depth` segments below this
    /// level; the checkpoint fan-out takes these at depth two.
    pub fn levels_at_depth(self: &Arc<Self>, depth: usize) -> Vec<(Vec<String>, Arc<Level>)> {
        let mut out = Vec::new();
        self.collect_levels(depth, &mut Vec::new(), &mut out);
        out
    }

    fn collect_levels(
        self: &Arc<Self>,
        depth: usize,
        prefix: &mut Vec<String>,
        out: &mut Vec<(Vec<String>, Arc<Level>)>,
    ) {
        if depth == 0 {
            out.push((prefix.clone(), Arc::clone(self)));
            return;
        }
        let children: Vec<(String, Arc<Level>)> = {
            let inner = self.inner.read();
            inner
                .children
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect()
        };
        for (name, child) in children {
            prefix.push(name);
            child.collect_levels(depth - 1, prefix, out);
            prefix.pop();
        }
    }
}
