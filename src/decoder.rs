//! Line-protocol ingest: tokenized records become level writes.
//!
//! The tokenizer itself is the `influxdb-line-protocol` crate; this
//! module maps each record onto the level tree with as little per-line
//! work as possible. One decoder instance cooperates with one
//! connection or message channel and caches the host level it resolved
//! last, invalidating only when the `(cluster, host)` tag pair changes.

use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use influxdb_line_protocol::{parse_lines, FieldValue, ParsedLine};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::checkpoint::StagedSample;
use crate::error::{Result, StoreError};
use crate::model::Sample;
use crate::store::{Level, MemoryStore};
use crate::util::unix_now;

/// Outcome of one batch: lines written versus lines skipped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecodeSummary {
    pub accepted: usize,
    pub dropped: usize,
}

pub struct LineProtocolDecoder {
    store: Arc<MemoryStore>,
    default_cluster: Option<String>,
    /// Copies of accepted samples for the compact/WAL snapshot path;
    /// absent when the JSON form is active.
    staging: Option<SyncSender<StagedSample>>,
    cached: Option<CachedLevel>,
}

struct CachedLevel {
    cluster: String,
    host: String,
    level: Arc<Level>,
}

impl LineProtocolDecoder {
    pub fn new(store: Arc<MemoryStore>, default_cluster: Option<String>) -> Self {
        Self {
            store,
            default_cluster,
            staging: None,
            cached: None,
        }
    }

    pub fn with_staging(mut self, staging: SyncSender<StagedSample>) -> Self {
        self.staging = Some(staging);
        self
    }

    /// Decodes a batch of line-protocol records. Errors on individual
    /// lines are logged and skipped; they never tear down the batch.
    pub fn decode(&mut self, body: &str) -> DecodeSummary {
        let mut summary = DecodeSummary::default();
        for parsed in parse_lines(body) {
            let line = match parsed {
                Ok(line) => line,
                Err(err) => {
                    warn!(%err, "skipping malformed line");
                    summary.dropped += 1;
                    continue;
                }
            };
            match self.decode_line(&line) {
                Ok(true) => summary.accepted += 1,
                Ok(false) => summary.dropped += 1,
                Err(err) => {
                    warn!(%err, measurement = line.series.measurement.as_str(), "skipping line");
                    summary.dropped += 1;
                }
            }
        }
        summary
    }

    /// Ok(false) means the line was silently dropped (unknown metric).
    fn decode_line(&mut self, line: &ParsedLine<'_>) -> Result<bool> {
        let metric = line.series.measurement.as_str();
        let Some(mc) = self.store.metric_config(metric) else {
            debug!(metric, "unknown metric");
            return Ok(false);
        };
        let frequency = mc.frequency;

        let mut cluster: Option<&str> = None;
        let mut host: Option<&str> = None;
        let mut type_buf = String::new();
        let mut subtype_buf = String::new();

        if let Some(tag_set) = &line.series.tag_set {
            for (key, value) in tag_set {
                match key.as_str() {
                    "cluster" => cluster = Some(value.as_str()),
                    "hostname" | "host" => host = Some(value.as_str()),
                    "type" => {
                        let v = value.as_str();
                        // type=node is the node scope itself.
                        if !v.is_empty() && v != "node" {
                            reorder_prefix(&mut type_buf, v);
                        }
                    }
                    "type-id" => type_buf.push_str(value.as_str()),
                    "subtype" | "stype" => {
                        let v = value.as_str();
                        if !v.is_empty() && v != "node" {
                            reorder_prefix(&mut subtype_buf, v);
                        }
                    }
                    "stype-id" => subtype_buf.push_str(value.as_str()),
                    // `unit` and anything else is ignored.
                    _ => {}
                }
            }
        }

        let cluster = match (cluster, self.default_cluster.as_deref()) {
            (Some(c), _) => c.to_string(),
            (None, Some(c)) => c.to_string(),
            (None, None) => return Err(StoreError::MissingTag("cluster")),
        };
        let Some(host) = host else {
            return Err(StoreError::MissingTag("hostname"));
        };

        let mut value: Option<f32> = None;
        for (key, field) in &line.field_set {
            if key.as_str() != "value" {
                return Err(StoreError::UnknownField(key.as_str().to_string()));
            }
            value = Some(match field {
                FieldValue::F64(v) => *v as f32,
                FieldValue::I64(v) => *v as f32,
                FieldValue::U64(v) => *v as f32,
                FieldValue::Boolean(_) => return Err(StoreError::UnsupportedKind("boolean")),
                FieldValue::String(_) => return Err(StoreError::UnsupportedKind("string")),
            });
        }
        let Some(value) = value else {
            return Err(StoreError::MissingField("value"));
        };

        let timestamp = timestamp_seconds(line.timestamp);

        let level = self.resolve_host_level(&cluster, host);
        let mut subpath: SmallVec<[String; 2]> = SmallVec::new();
        if !type_buf.is_empty() {
            subpath.push(type_buf);
        }
        if !subtype_buf.is_empty() {
            subpath.push(subtype_buf);
        }

        let sample = Sample::new(metric, value, timestamp);
        self.store
            .write_to_level_at(&level, &subpath, std::slice::from_ref(&sample))?;

        if let Some(staging) = &self.staging {
            let staged = StagedSample {
                cluster: cluster.to_string(),
                host: host.to_string(),
                subpath: subpath.to_vec(),
                metric: metric.to_string(),
                frequency,
                timestamp,
                value,
            };
            if staging.send(staged).is_err() {
                warn!("staging channel closed; sample not journaled");
            }
        }
        Ok(true)
    }

    fn resolve_host_level(&mut self, cluster: &str, host: &str) -> Arc<Level> {
        if let Some(cached) = &self.cached {
            if cached.cluster == cluster && cached.host == host {
                return Arc::clone(&cached.level);
            }
        }
        let path = [cluster.to_string(), host.to_string()];
        let level = self.store.get_level_or_create(&path);
        self.cached = Some(CachedLevel {
            cluster: cluster.to_string(),
            host: host.to_string(),
            level: Arc::clone(&level),
        });
        level
    }
}

/// `type` and `type-id` may arrive in either order; the scope name is
/// always the type followed by the id.
fn reorder_prefix(buf: &mut String, prefix: &str) {
    if buf.is_empty() {
        buf.push_str(prefix);
    } else {
        buf.insert_str(0, prefix);
    }
}

/// Line timestamps prefer seconds; coarser integers are recognized by
/// magnitude and reduced. A missing timestamp falls back to wall clock.
fn timestamp_seconds(raw: Option<i64>) -> i64 {
    match raw {
        None => unix_now(),
        Some(ts) => {
            let abs = ts.unsigned_abs();
            if abs >= 100_000_000_000_000_000 {
                ts / 1_000_000_000
            } else if abs >= 100_000_000_000_000 {
                ts / 1_000_000
            } else if abs >= 100_000_000_000 {
                ts / 1_000
            } else {
                ts
            }
        }
    }
}
