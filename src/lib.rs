//! # Cumulus - In-Memory Cluster Metric Store
//!
//! Cumulus is an in-memory, hierarchical time-series store for HPC
//! cluster monitoring. Compute nodes push line-protocol samples at a
//! high rate; queries read ranges back with spatial aggregation and
//! plot-friendly downsampling; periodic checkpoints bound the damage a
//! restart can do.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::collections::HashMap;
//! use cumulus::{selector_from_path, MemoryStore, MetricSpec, Sample};
//!
//! let mut catalog = HashMap::new();
//! catalog.insert("cpu_load".to_string(), MetricSpec { frequency: 10, aggregation: Default::default() });
//! let store = MemoryStore::new(&catalog)?;
//!
//! let path = ["alex".to_string(), "a0603".to_string()];
//! store.write(&path, &[Sample::new("cpu_load", 0.5, 1000)])?;
//!
//! let result = store.read(&selector_from_path(["alex", "a0603"]), "cpu_load", 1000, 1010, 0)?;
//! assert_eq!(result.data, vec![0.5]);
//! # Ok::<(), cumulus::StoreError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Level tree**: cluster → host → subcomponent hierarchy, one
//!   read-write lock per level, grown lazily by writes.
//! - **Buffer chains**: fixed-capacity time-aligned sample runs, linked
//!   chronologically, backed by a capped storage pool.
//! - **Ingest**: line-protocol decoding with cached level resolution,
//!   fed over HTTP or NATS.
//! - **Persistence**: periodic per-host snapshots (JSON or compact
//!   binary) with an optional append-only tail between them.
//! - **Lifecycle**: retention sweeps plus forced eviction under a
//!   configured memory cap.

pub mod archive;
pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod nats;
pub mod resample;
pub mod server;
pub mod store;
pub mod util;

// Re-export the main public API
pub use crate::config::{CleanupMode, Config, FileFormat};
pub use crate::error::{Result, StoreError};
pub use crate::model::{
    selector_from_path, AggregationStrategy, MetricConfig, MetricSpec, Sample, Selector,
    SelectorElement, BUFFER_CAP,
};
pub use crate::store::{HealthCheck, HealthStatus, MemoryStore, ReadResult};
