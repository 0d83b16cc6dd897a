//! Periodic persistence: snapshots, the compact staging path and the
//! append-only tail.

mod compact;
mod json;
mod wal;

pub use compact::{read_compact_file, restore_compact_file, write_compact_file, ShadowTree};
pub use json::{CheckpointFile, CheckpointMetrics, GapValue};
pub use wal::{replay_file, WalWriter};

use std::fs;
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{CheckpointConfig, FileFormat};
use crate::error::{Result, StoreError};
use crate::store::{Level, MemoryStore};
use crate::util::{timestamp_from_file_name, unix_now};

/// Capacity of the staging channel; producers block (back-pressure)
/// once the drainer falls this far behind.
const STAGING_CAPACITY: usize = 8192;

/// A copy of one accepted sample, queued for the WAL or shadow tree.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedSample {
    pub cluster: String,
    pub host: String,
    pub subpath: Vec<String>,
    pub metric: String,
    pub frequency: i64,
    pub timestamp: i64,
    pub value: f32,
}

/// Drives everything under `checkpoints.directory`: startup restore,
/// the per-interval snapshot fan-out and the staging drainer.
pub struct Checkpointer {
    store: Arc<MemoryStore>,
    config: CheckpointConfig,
    workers: usize,
    last_checkpoint: AtomicI64,
    shadow: Option<Arc<ShadowTree>>,
    wal: Option<Arc<Mutex<WalWriter>>>,
    staging_tx: Mutex<Option<SyncSender<StagedSample>>>,
    drainer: Mutex<Option<JoinHandle<()>>>,
}

impl Checkpointer {
    pub fn new(store: Arc<MemoryStore>, config: CheckpointConfig, workers: usize) -> Result<Self> {
        fs::create_dir_all(&config.directory).map_err(|e| {
            StoreError::Init(format!(
                "cannot create checkpoint root {}: {e}",
                config.directory.display()
            ))
        })?;

        let mut shadow = None;
        let mut wal = None;
        let mut staging_tx = None;
        let mut drainer = None;

        if config.file_format.needs_staging() {
            let (tx, rx) = sync_channel::<StagedSample>(STAGING_CAPACITY);
            staging_tx = Some(tx);
            match config.file_format {
                FileFormat::Wal => {
                    let writer = Arc::new(Mutex::new(WalWriter::new(config.directory.clone())));
                    wal = Some(Arc::clone(&writer));
                    drainer = Some(std::thread::spawn(move || {
                        // Drains until every sender is gone, then exits.
                        for sample in rx {
                            if let Err(err) = writer.lock().append(&sample) {
                                warn!(%err, "WAL append failed");
                            }
                        }
                    }));
                }
                FileFormat::Binary | FileFormat::Avro => {
                    let window = (2 * config.interval.as_secs()).max(60) as i64;
                    let tree = Arc::new(ShadowTree::new(window));
                    shadow = Some(Arc::clone(&tree));
                    drainer = Some(std::thread::spawn(move || {
                        for sample in rx {
                            tree.stage(&sample);
                        }
                    }));
                }
                FileFormat::Json => unreachable!("json needs no staging"),
            }
        }

        Ok(Self {
            store,
            config,
            workers: workers.max(1),
            last_checkpoint: AtomicI64::new(unix_now()),
            shadow,
            wal,
            staging_tx: Mutex::new(staging_tx),
            drainer: Mutex::new(drainer),
        })
    }

    /// A sender for ingest decoders to tee accepted samples into; absent
    /// when the JSON form is active.
    pub fn staging(&self) -> Option<SyncSender<StagedSample>> {
        self.staging_tx.lock().clone()
    }

    pub fn last_checkpoint(&self) -> i64 {
        self.last_checkpoint.load(Ordering::Relaxed)
    }

    /// Loads every snapshot within the restore window, oldest first,
    /// then replays any append-only tails. Returns the number of runs
    /// materialized.
    pub fn restore(&self) -> Result<usize> {
        let cutoff = unix_now() - self.config.restore.as_secs() as i64;
        let mut loaded = 0usize;

        for cluster_entry in read_subdirs(&self.config.directory)? {
            let cluster = dir_name(&cluster_entry);
            for host_entry in read_subdirs(&cluster_entry)? {
                let host = dir_name(&host_entry);
                loaded += self.restore_host(&cluster, &host, &host_entry, cutoff)?;
            }
        }
        info!(loaded, "checkpoint restore complete");
        Ok(loaded)
    }

    fn restore_host(&self, cluster: &str, host: &str, dir: &Path, cutoff: i64) -> Result<usize> {
        let mut files: Vec<(i64, std::path::PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(from) = timestamp_from_file_name(name) else {
                continue;
            };
            if from >= cutoff {
                files.push((from, entry.path()));
            }
        }
        files.sort();

        let mut loaded = 0usize;
        for (_, path) in files {
            let result = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => self.restore_json(cluster, host, &path),
                Some("bin") => restore_compact_file(&self.store, cluster, host, &path),
                _ => Ok(0),
            };
            match result {
                Ok(n) => loaded += n,
                Err(err) => error!(%err, path = %path.display(), "skipping unreadable snapshot"),
            }
        }

        let tail = dir.join(wal::WAL_FILE_NAME);
        if tail.exists() {
            match replay_file(&self.store, &tail) {
                Ok(n) => {
                    debug!(n, cluster, host, "replayed append-only tail");
                    loaded += n;
                }
                Err(err) => error!(%err, path = %tail.display(), "skipping unreadable tail"),
            }
        }
        Ok(loaded)
    }

    fn restore_json(&self, cluster: &str, host: &str, path: &Path) -> Result<usize> {
        let raw = fs::read(path)?;
        let file: CheckpointFile = serde_json::from_slice(&raw)?;
        let host_path = [cluster.to_string(), host.to_string()];
        let level = self.store.get_level_or_create(&host_path);
        file.restore_into(&self.store, &level)
    }

    /// One snapshot pass over the window since the previous pass.
    pub fn checkpoint_all(&self) -> Result<usize> {
        let from = self.last_checkpoint();
        let to = unix_now();
        let written = self.checkpoint_range(from, to)?;
        self.last_checkpoint.store(to, Ordering::Relaxed);
        Ok(written)
    }

    /// Snapshot for an explicit `[from, to)` window.
    pub fn checkpoint_range(&self, from: i64, to: i64) -> Result<usize> {
        match self.config.file_format {
            FileFormat::Json => self.snapshot_tree(from, to),
            FileFormat::Wal => {
                let written = self.snapshot_tree(from, to)?;
                if let Some(wal) = &self.wal {
                    wal.lock().rotate(to)?;
                }
                Ok(written)
            }
            FileFormat::Binary | FileFormat::Avro => self.snapshot_compact(to),
        }
    }

    /// Fans (cluster, host) subtrees out across the worker pool. Each
    /// worker snapshots whole hosts; per-host failures are logged and
    /// counted without aborting the pass.
    fn snapshot_tree(&self, from: i64, to: i64) -> Result<usize> {
        let pairs = self.store.levels_at_depth(2);
        if pairs.is_empty() {
            return Err(StoreError::NoNewData);
        }

        let written = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let store = &self.store;
        let dir = &self.config.directory;

        std::thread::scope(|scope| {
            let chunk_size = pairs.len().div_ceil(self.workers);
            for chunk in pairs.chunks(chunk_size) {
                let written = &written;
                let failed = &failed;
                scope.spawn(move || {
                    for (path, level) in chunk {
                        match snapshot_host(store, dir, path, level, from, to) {
                            Ok(true) => {
                                written.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(false) => {}
                            Err(err) => {
                                error!(%err, host = %path.join("/"), "host snapshot failed");
                                failed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                });
            }
        });

        let written = written.into_inner();
        let failed = failed.into_inner();
        if failed > 0 {
            warn!(failed, written, "snapshot pass finished with failures");
        }
        if written == 0 {
            return Err(StoreError::NoNewData);
        }
        Ok(written)
    }

    fn snapshot_compact(&self, to: i64) -> Result<usize> {
        let Some(shadow) = &self.shadow else {
            return Err(StoreError::NoNewData);
        };
        let drained = shadow.drain(to);
        if drained.is_empty() {
            return Err(StoreError::NoNewData);
        }
        let mut written = 0usize;
        for (cluster, host, frequency, slice) in &drained {
            match write_compact_file(&self.config.directory, cluster, host, *frequency, slice) {
                Ok(_) => written += 1,
                Err(err) => error!(%err, %cluster, %host, "compact snapshot failed"),
            }
        }
        if written == 0 {
            return Err(StoreError::NoNewData);
        }
        Ok(written)
    }

    /// Stops accepting staged samples and waits for the drainer to
    /// flush what it already received.
    pub fn close_staging(&self) {
        *self.staging_tx.lock() = None;
        if let Some(handle) = self.drainer.lock().take() {
            if handle.join().is_err() {
                error!("staging drainer panicked");
            }
        }
    }

    /// Final synchronous pass: close staging, then snapshot once more.
    pub fn shutdown(&self) {
        self.close_staging();
        match self.checkpoint_all() {
            Ok(written) => info!(written, "final checkpoint written"),
            Err(err) if err.is_informational() => {}
            Err(err) => error!(%err, "final checkpoint failed"),
        }
    }
}

fn snapshot_host(
    store: &MemoryStore,
    dir: &Path,
    path: &[String],
    level: &Arc<Level>,
    from: i64,
    to: i64,
) -> Result<bool> {
    let Some(file) = CheckpointFile::from_level(store, level, from, to)? else {
        return Ok(false);
    };

    let host_dir = dir.join(&path[0]).join(&path[1]);
    fs::create_dir_all(&host_dir)?;
    let target = host_dir.join(format!("{from}.json"));
    let tmp = host_dir.join(format!("{from}.json.tmp"));
    {
        let writer = BufWriter::new(fs::File::create(&tmp)?);
        serde_json::to_writer(writer, &file)?;
    }
    fs::rename(&tmp, &target)?;
    Ok(true)
}

fn read_subdirs(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
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
