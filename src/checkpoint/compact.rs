//! The compact snapshot path: a shadow staging tree drained into
//! frequency-bucketed, snappy-framed tables.
//!
//! Ingest tees accepted samples into the shadow tree so the snapshot
//! worker can write the compact form incrementally without re-scanning
//! the main level tree. File layout:
//!
//! ```text
//! "CCMB" | version u32 | frequency i64 | from i64 | to i64
//!        | payloadLen u32 | snappy(json table) | crc32 u32
//! ```
//!
//! The table maps a flattened metric name (`subpath:…:metric`) to its
//! dense value run starting at `from`.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use parking_lot::Mutex;
use tracing::debug;

use crate::checkpoint::json::GapValue;
use crate::checkpoint::StagedSample;
use crate::error::{Result, StoreError};
use crate::store::{Buffer, BufferChain, MemoryStore};

const COMPACT_MAGIC: &[u8; 4] = b"CCMB";
const COMPACT_VERSION: u32 = 1;

type HostKey = (String, String);
type TimeSlice = BTreeMap<i64, HashMap<String, f32>>;

/// Parallel hierarchy keyed `(cluster, host, frequency)` holding a
/// bounded rolling window of pending rows.
pub struct ShadowTree {
    window: i64,
    inner: Mutex<HashMap<HostKey, HashMap<i64, TimeSlice>>>,
}

impl ShadowTree {
    /// `window` bounds how many seconds of staged rows are retained per
    /// frequency bucket.
    pub fn new(window: i64) -> Self {
        Self {
            window,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn stage(&self, sample: &StagedSample) {
        let flat = flatten_name(&sample.subpath, &sample.metric);
        let mut inner = self.inner.lock();
        let buckets = inner
            .entry((sample.cluster.clone(), sample.host.clone()))
            .or_default();
        let slice = buckets.entry(sample.frequency).or_default();
        slice
            .entry(sample.timestamp)
            .or_default()
            .insert(flat, sample.value);

        if let Some(&newest) = slice.keys().next_back() {
            let cutoff = newest - self.window;
            while let Some(&oldest) = slice.keys().next() {
                if oldest >= cutoff {
                    break;
                }
                slice.remove(&oldest);
            }
        }
    }

    /// Removes and returns every staged row older than `to`, grouped by
    /// `(cluster, host, frequency)`.
    pub fn drain(&self, to: i64) -> Vec<(String, String, i64, TimeSlice)> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        for ((cluster, host), buckets) in inner.iter_mut() {
            for (&frequency, slice) in buckets.iter_mut() {
                let keep = slice.split_off(&to);
                let drained = std::mem::replace(slice, keep);
                if !drained.is_empty() {
                    out.push((cluster.clone(), host.clone(), frequency, drained));
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .values()
            .all(|b| b.values().all(|s| s.is_empty()))
    }
}

pub(crate) fn flatten_name(subpath: &[String], metric: &str) -> String {
    if subpath.is_empty() {
        metric.to_string()
    } else {
        let mut flat = subpath.join(":");
        flat.push(':');
        flat.push_str(metric);
        flat
    }
}

fn unflatten_name(flat: &str) -> (Vec<String>, &str) {
    match flat.rfind(':') {
        Some(i) => (
            flat[..i].split(':').map(str::to_string).collect(),
            &flat[i + 1..],
        ),
        None => (Vec::new(), flat),
    }
}

/// Writes one drained `(cluster, host, frequency)` slice as a compact
/// file, merging with an existing file for the same window so fields
/// added between intervals survive a rewrite.
pub fn write_compact_file(
    dir: &Path,
    cluster: &str,
    host: &str,
    frequency: i64,
    slice: &TimeSlice,
) -> Result<PathBuf> {
    let Some((&first, _)) = slice.iter().next() else {
        return Err(StoreError::NoNewData);
    };
    let Some((&last, _)) = slice.iter().next_back() else {
        return Err(StoreError::NoNewData);
    };
    let from = first;
    let to = last + frequency;
    let len = ((to - from) / frequency) as usize;

    let mut table: BTreeMap<String, Vec<GapValue>> = BTreeMap::new();
    for (&ts, row) in slice {
        let idx = ((ts - from) / frequency) as usize;
        if idx >= len {
            continue;
        }
        for (name, &value) in row {
            let run = table
                .entry(name.clone())
                .or_insert_with(|| vec![GapValue(f32::NAN); len]);
            run[idx] = GapValue(value);
        }
    }

    let host_dir = dir.join(cluster).join(host);
    std::fs::create_dir_all(&host_dir)?;
    let path = host_dir.join(format!("{from}.{frequency}.bin"));

    // A rewrite for the same window unions the previous file's fields.
    if path.exists() {
        if let Ok((old_from, _, old_table)) = read_compact_file(&path) {
            if old_from == from {
                for (name, run) in old_table {
                    table.entry(name).or_insert(run);
                }
            }
        }
    }

    let mut payload = Vec::new();
    {
        let mut encoder = snap::write::FrameEncoder::new(&mut payload);
        serde_json::to_writer(&mut encoder, &table)?;
        encoder
            .flush()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
    }
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(COMPACT_MAGIC)?;
        file.write_all(&COMPACT_VERSION.to_le_bytes())?;
        file.write_all(&frequency.to_le_bytes())?;
        file.write_all(&from.to_le_bytes())?;
        file.write_all(&to.to_le_bytes())?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&crc.to_le_bytes())?;
    }
    std::fs::rename(&tmp, &path)?;
    Ok(path)
}

type CompactTable = BTreeMap<String, Vec<GapValue>>;

pub fn read_compact_file(path: &Path) -> Result<(i64, i64, CompactTable)> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 36];
    file.read_exact(&mut header)
        .map_err(|_| StoreError::Corrupted(format!("{}: short header", path.display())))?;
    if &header[0..4] != COMPACT_MAGIC {
        return Err(StoreError::Corrupted(format!(
            "{}: bad magic",
            path.display()
        )));
    }
    let version = u32::from_le_bytes(header[4..8].try_into().expect("sized slice"));
    if version != COMPACT_VERSION {
        return Err(StoreError::Corrupted(format!(
            "{}: unsupported version {version}",
            path.display()
        )));
    }
    let frequency = i64::from_le_bytes(header[8..16].try_into().expect("sized slice"));
    let from = i64::from_le_bytes(header[16..24].try_into().expect("sized slice"));
    let payload_len = u32::from_le_bytes(header[32..36].try_into().expect("sized slice")) as usize;

    let mut payload = vec![0u8; payload_len];
    file.read_exact(&mut payload)
        .map_err(|_| StoreError::Corrupted(format!("{}: short payload", path.display())))?;
    let mut crc_buf = [0u8; 4];
    file.read_exact(&mut crc_buf)
        .map_err(|_| StoreError::Corrupted(format!("{}: missing checksum", path.display())))?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    if hasher.finalize() != u32::from_le_bytes(crc_buf) {
        return Err(StoreError::Corrupted(format!(
            "{}: checksum mismatch",
            path.display()
        )));
    }

    let decoder = snap::read::FrameDecoder::new(&payload[..]);
    let table: CompactTable = serde_json::from_reader(decoder)?;
    Ok((from, frequency, table))
}

/// Loads one compact file into the store below `(cluster, host)`. Runs
/// come back as snapshot buffers: natural length, already persisted.
pub fn restore_compact_file(
    store: &MemoryStore,
    cluster: &str,
    host: &str,
    path: &Path,
) -> Result<usize> {
    let (from, frequency, table) = read_compact_file(path)?;
    let mut loaded = 0;
    for (flat, run) in table {
        let (subpath, metric) = unflatten_name(&flat);
        let Some(mc) = store.metric_config(metric) else {
            debug!(metric, "skipping restored run for unknown metric");
            continue;
        };
        let mut data: Vec<f32> = run.iter().map(|g| g.0).collect();
        while data.last().is_some_and(|v| v.is_nan()) {
            data.pop();
        }
        if data.is_empty() {
            continue;
        }

        let mut path_segments = vec![cluster.to_string(), host.to_string()];
        path_segments.extend(subpath);
        let level = store.get_level_or_create(&path_segments);
        let mut inner = level.write_inner();
        let chain = inner.metrics[mc.offset].get_or_insert_with(BufferChain::new);
        chain.push_loaded(Buffer::from_snapshot(from - frequency / 2, frequency, data));
        loaded += 1;
    }
    Ok(loaded)
}
