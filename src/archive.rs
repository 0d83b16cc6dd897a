//! Snapshot cleanup: delete old checkpoint files or flatten them into
//! long-format CSV archives.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::checkpoint::{read_compact_file, CheckpointFile};
use crate::config::{CleanupConfig, CleanupMode};
use crate::error::{Result, StoreError};
use crate::lifecycle::tick;
use crate::util::{timestamp_from_file_name, unix_now};

pub struct Cleaner {
    checkpoint_dir: PathBuf,
    archive_dir: PathBuf,
    mode: CleanupMode,
    interval: Duration,
    compress: bool,
}

impl Cleaner {
    pub fn new(config: &CleanupConfig, checkpoint_dir: PathBuf) -> Self {
        Self {
            checkpoint_dir,
            archive_dir: config.directory.clone(),
            mode: config.mode,
            interval: config.interval,
            compress: config.compress,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One pass: selects snapshot files older than the cleanup interval
    /// and deletes or archives them. Per-cluster failures are logged and
    /// counted without aborting the run.
    pub fn run_once(&self) -> Result<usize> {
        let cutoff = unix_now() - self.interval.as_secs() as i64;
        let mut processed = 0usize;
        let mut failed = 0usize;

        for cluster_dir in subdirs(&self.checkpoint_dir)? {
            let cluster = dir_name(&cluster_dir);
            let mut selected: Vec<(String, i64, PathBuf)> = Vec::new();
            for host_dir in subdirs(&cluster_dir)? {
                let host = dir_name(&host_dir);
                for entry in fs::read_dir(&host_dir)? {
                    let entry = entry?;
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    let Some(from) = timestamp_from_file_name(name) else {
                        continue;
                    };
                    if from < cutoff {
                        selected.push((host.clone(), from, entry.path()));
                    }
                }
            }
            if selected.is_empty() {
                continue;
            }

            if self.mode == CleanupMode::Archive {
                if let Err(err) = self.archive_cluster(&cluster, &selected) {
                    error!(%err, %cluster, "archiving failed; files kept");
                    failed += 1;
                    continue;
                }
            }
            for (_, _, path) in &selected {
                if let Err(err) = fs::remove_file(path) {
                    error!(%err, path = %path.display(), "cannot remove snapshot");
                    failed += 1;
                } else {
                    processed += 1;
                }
            }
        }

        if failed > 0 {
            info!(processed, failed, "cleanup pass finished with failures");
        }
        if processed == 0 {
            return Err(StoreError::NoNewArchiveData);
        }
        Ok(processed)
    }

    /// Flattens every selected snapshot of one cluster into a single
    /// long-format CSV (one row per sample).
    fn archive_cluster(&self, cluster: &str, selected: &[(String, i64, PathBuf)]) -> Result<()> {
        let from = selected.iter().map(|(_, ts, _)| *ts).min().unwrap_or(0);
        let out_dir = self.archive_dir.join(cluster);
        fs::create_dir_all(&out_dir)?;

        let out_path = if self.compress {
            out_dir.join(format!("{from}.csv.sz"))
        } else {
            out_dir.join(format!("{from}.csv"))
        };
        let sink: Box<dyn Write> = if self.compress {
            Box::new(snap::write::FrameEncoder::new(File::create(&out_path)?))
        } else {
            Box::new(File::create(&out_path)?)
        };

        let mut writer = csv::Writer::from_writer(sink);
        writer.write_record([
            "cluster",
            "host",
            "metric",
            "scope",
            "scope-id",
            "timestamp",
            "frequency",
            "value",
        ])?;

        for (host, _, path) in selected {
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") => {
                    let raw = fs::read(path)?;
                    let file: CheckpointFile = serde_json::from_slice(&raw)?;
                    let mut subpath = Vec::new();
                    write_tree_rows(&mut writer, cluster, host, &file, &mut subpath)?;
                }
                Some("bin") => {
                    let (start, frequency, table) = read_compact_file(path)?;
                    for (flat, run) in table {
                        let (subpath, metric) = split_flat(&flat);
                        let (scope, scope_id) = scope_of(&subpath);
                        for (i, v) in run.iter().enumerate() {
                            if v.0.is_nan() {
                                continue;
                            }
                            write_row(
                                &mut writer,
                                cluster,
                                host,
                                metric,
                                &scope,
                                &scope_id,
                                start + i as i64 * frequency,
                                frequency,
                                v.0,
                            )?;
                        }
                    }
                }
                _ => debug!(path = %path.display(), "not an archivable snapshot"),
            }
        }
        writer.flush()?;
        Ok(())
    }
}

fn write_tree_rows<W: Write>(
    writer: &mut csv::Writer<W>,
    cluster: &str,
    host: &str,
    file: &CheckpointFile,
    subpath: &mut Vec<String>,
) -> Result<()> {
    let (scope, scope_id) = scope_of(subpath);
    for (metric, cm) in &file.metrics {
        for (i, v) in cm.data.iter().enumerate() {
            if v.0.is_nan() {
                continue;
            }
            write_row(
                writer,
                cluster,
                host,
                metric,
                &scope,
                &scope_id,
                cm.start + i as i64 * cm.frequency,
                cm.frequency,
                v.0,
            )?;
        }
    }
    for (name, child) in &file.children {
        subpath.push(name.clone());
        write_tree_rows(writer, cluster, host, child, subpath)?;
        subpath.pop();
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_row<W: Write>(
    writer: &mut csv::Writer<W>,
    cluster: &str,
    host: &str,
    metric: &str,
    scope: &str,
    scope_id: &str,
    timestamp: i64,
    frequency: i64,
    value: f32,
) -> Result<()> {
    writer.write_record([
        cluster,
        host,
        metric,
        scope,
        scope_id,
        &timestamp.to_string(),
        &frequency.to_string(),
        &value.to_string(),
    ])?;
    Ok(())
}

/// `["core1", "memoryDomain0"]` → `("core1:memoryDomain", "0")`; an
/// empty subpath is the node scope.
fn scope_of(subpath: &[String]) -> (String, String) {
    let Some((last, prefix)) = subpath.split_last() else {
        return ("node".to_string(), String::new());
    };
    let digits = last.len() - last.chars().rev().take_while(|c| c.is_ascii_digit()).count();
    let (name, id) = last.split_at(digits);
    let scope = if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}:{}", prefix.join(":"), name)
    };
    (scope, id.to_string())
}

fn split_flat(flat: &str) -> (Vec<String>, &str) {
    match flat.rfind(':') {
        Some(i) => (
            flat[..i].split(':').map(str::to_string).collect(),
            &flat[i + 1..],
        ),
        None => (Vec::new(), flat),
    }
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.path());
        }
    }
    Ok(out)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Cleanup worker; ticks on its own interval.
pub async fn run_cleanup(cleaner: Arc<Cleaner>, mut shutdown: watch::Receiver<bool>) {
    let interval = cleaner.interval();
    while tick(interval, &mut shutdown).await {
        let c = Arc::clone(&cleaner);
        let result = tokio::task::spawn_blocking(move || c.run_once()).await;
        match result {
            Ok(Ok(processed)) => info!(processed, "cleanup pass complete"),
            Ok(Err(err)) if err.is_informational() => {}
            Ok(Err(err)) => error!(%err, "cleanup pass failed"),
            Err(err) => error!(%err, "cleanup task panicked"),
        }
    }
    debug!("cleanup worker stopped");
}
