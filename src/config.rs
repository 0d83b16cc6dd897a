//! Runtime configuration, loaded from a JSON file at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::model::MetricSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// The metric catalog: every name the store accepts.
    pub metrics: HashMap<String, MetricSpec>,

    /// How long samples stay in memory before the retention worker
    /// releases them.
    #[serde(with = "duration_str", default = "default_retention")]
    pub retention_in_memory: Duration,

    /// Heap ceiling. Plain integers up to 1024 are gigabytes, larger
    /// values are bytes; zero disables the cap.
    #[serde(default)]
    pub memory_cap: u64,

    /// Checkpoint fan-out width; zero picks `min(cores/2 + 1, 10)`.
    #[serde(default)]
    pub num_workers: usize,

    pub checkpoints: CheckpointConfig,
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub nats_subscriptions: Vec<NatsSubscription>,

    /// HTTP listen address.
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CheckpointConfig {
    #[serde(default)]
    pub file_format: FileFormat,
    #[serde(with = "duration_str", default = "default_checkpoint_interval")]
    pub interval: Duration,
    pub directory: PathBuf,
    /// How far back to load snapshots on startup.
    #[serde(with = "duration_str", default = "default_retention")]
    pub restore: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// One self-describing JSON tree per (cluster, host) and interval.
    #[default]
    Json,
    /// Compact frequency-bucketed tables fed by the staging tree.
    Binary,
    /// Accepted alias for the compact form.
    Avro,
    /// JSON snapshots plus a per-host append-only tail.
    Wal,
}

impl FileFormat {
    /// The compact forms and the WAL tail both need per-write staging.
    pub fn needs_staging(self) -> bool {
        !matches!(self, FileFormat::Json)
    }

    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Json | FileFormat::Wal => "json",
            FileFormat::Binary | FileFormat::Avro => "bin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupMode {
    #[default]
    Delete,
    Archive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CleanupConfig {
    #[serde(default)]
    pub mode: CleanupMode,
    #[serde(with = "duration_str", default = "default_cleanup_interval")]
    pub interval: Duration,
    /// Archive destination; unused in delete mode.
    #[serde(default)]
    pub directory: PathBuf,
    /// Snappy-frame archived CSV files.
    #[serde(default)]
    pub compress: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NatsSubscription {
    pub subscribe_to: String,
    /// Cluster assumed for lines that carry no cluster tag.
    #[serde(default)]
    pub cluster_tag: Option<String>,
    #[serde(default = "default_nats_address")]
    pub address: String,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.metrics.is_empty() {
            return Err(StoreError::Config("no metrics configured".into()));
        }
        for (name, spec) in &self.metrics {
            if spec.frequency <= 0 {
                return Err(StoreError::Config(format!(
                    "metric {name:?} has invalid frequency {}",
                    spec.frequency
                )));
            }
        }
        if self.checkpoints.interval.is_zero() {
            return Err(StoreError::Config("checkpoints.interval must not be zero".into()));
        }
        if self.checkpoints.directory.as_os_str().is_empty() {
            return Err(StoreError::Config("checkpoints.directory is required".into()));
        }
        if self.cleanup.mode == CleanupMode::Archive && self.cleanup.directory.as_os_str().is_empty()
        {
            return Err(StoreError::Config(
                "cleanup.directory is required in archive mode".into(),
            ));
        }
        Ok(())
    }

    /// The configured cap in bytes; `None` when unlimited.
    pub fn memory_cap_bytes(&self) -> Option<u64> {
        match self.memory_cap {
            0 => None,
            gb if gb <= 1024 => Some(gb * 1024 * 1024 * 1024),
            bytes => Some(bytes),
        }
    }

    pub fn worker_count(&self) -> usize {
        worker_count(self.num_workers)
    }
}

/// `min(cores/2 + 1, 10)` when unset.
pub fn worker_count(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores / 2 + 1).min(10)
}

fn default_retention() -> Duration {
    Duration::from_secs(48 * 3600)
}

fn default_checkpoint_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(48 * 3600)
}

fn default_listen() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_nats_address() -> String {
    "nats://localhost:4222".to_string()
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
