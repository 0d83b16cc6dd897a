//! Append-only per-host tails for crash recovery between snapshots.
//!
//! Layout of `current.wal`:
//!
//! ```text
//! header:  "CCMS" | version u32 | fromTs i64 | toTs i64
//! record:  magic(4) | payloadLen u32 | payload | crc32 u32
//! payload: ts i64 | nameLen u16 | name | selCount u8 | (selLen u8 | sel)* | valueBits u32
//! ```
//!
//! All integers are little-endian. A truncated or corrupted trailing
//! record ends replay silently; the valid prefix is kept.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use tracing::{debug, warn};

use crate::checkpoint::StagedSample;
use crate::error::{Result, StoreError};
use crate::model::Sample;
use crate::store::MemoryStore;

const WAL_MAGIC: &[u8; 4] = b"CCMS";
const RECORD_MAGIC: &[u8; 4] = b"CCWR";
const WAL_VERSION: u32 = 1;
const WAL_HEADER_SIZE: usize = 24;
pub(crate) const WAL_FILE_NAME: &str = "current.wal";

/// Owns one `current.wal` per (cluster, host), opened lazily.
pub struct WalWriter {
    root: PathBuf,
    files: HashMap<(String, String), File>,
}

impl WalWriter {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            files: HashMap::new(),
        }
    }

    pub fn append(&mut self, sample: &StagedSample) -> Result<()> {
        let key = (sample.cluster.clone(), sample.host.clone());
        if !self.files.contains_key(&key) {
            let dir = self.root.join(&sample.cluster).join(&sample.host);
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(WAL_FILE_NAME);
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            if file.metadata()?.len() < WAL_HEADER_SIZE as u64 {
                write_header(&mut file, sample.timestamp)?;
            } else {
                file.seek(SeekFrom::End(0))?;
            }
            self.files.insert(key.clone(), file);
        }

        let file = self.files.get_mut(&key).expect("file opened above");
        let payload = encode_payload(sample);
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        file.write_all(RECORD_MAGIC)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&crc.to_le_bytes())?;
        Ok(())
    }

    /// Truncates every open tail back to a fresh header once the data it
    /// covered has been snapshotted.
    pub fn rotate(&mut self, from: i64) -> Result<()> {
        for file in self.files.values_mut() {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            write_header(file, from)?;
        }
        Ok(())
    }
}

fn write_header(file: &mut File, from: i64) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(WAL_MAGIC)?;
    file.write_all(&WAL_VERSION.to_le_bytes())?;
    file.write_all(&from.to_le_bytes())?;
    file.write_all(&0i64.to_le_bytes())?;
    Ok(())
}

fn encode_payload(sample: &StagedSample) -> Vec<u8> {
    let mut selector: Vec<&str> = vec![&sample.cluster, &sample.host];
    selector.extend(sample.subpath.iter().map(|s| s.as_str()));

    let mut payload = Vec::with_capacity(32 + sample.metric.len());
    payload.extend_from_slice(&sample.timestamp.to_le_bytes());
    payload.extend_from_slice(&(sample.metric.len() as u16).to_le_bytes());
    payload.extend_from_slice(sample.metric.as_bytes());
    payload.push(selector.len() as u8);
    for segment in selector {
        payload.push(segment.len() as u8);
        payload.extend_from_slice(segment.as_bytes());
    }
    payload.extend_from_slice(&sample.value.to_bits().to_le_bytes());
    payload
}

/// Replays one tail into the store. Returns the number of samples
/// applied.
pub fn replay_file(store: &MemoryStore, path: &Path) -> Result<usize> {
    let mut file = File::open(path)?;
    let mut header = [0u8; WAL_HEADER_SIZE];
    if file.read_exact(&mut header).is_err() {
        debug!(path = %path.display(), "tail shorter than its header; nothing to replay");
        return Ok(0);
    }
    if &header[0..4] != WAL_MAGIC {
        return Err(StoreError::Corrupted(format!(
            "{}: bad WAL magic",
            path.display()
        )));
    }
    let version = u32::from_le_bytes(header[4..8].try_into().expect("sized slice"));
    if version != WAL_VERSION {
        return Err(StoreError::Corrupted(format!(
            "{}: unsupported WAL version {version}",
            path.display()
        )));
    }

    let mut applied = 0;
    loop {
        let mut frame = [0u8; 8];
        match file.read_exact(&mut frame) {
            Ok(()) => {}
            Err(_) => break,
        }
        if &frame[0..4] != RECORD_MAGIC {
            warn!(path = %path.display(), "truncating tail at bad record magic");
            break;
        }
        let len = u32::from_le_bytes(frame[4..8].try_into().expect("sized slice")) as usize;
        let mut payload = vec![0u8; len];
        if file.read_exact(&mut payload).is_err() {
            break;
        }
        let mut crc_buf = [0u8; 4];
        if file.read_exact(&mut crc_buf).is_err() {
            break;
        }
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != u32::from_le_bytes(crc_buf) {
            warn!(path = %path.display(), "truncating tail at CRC mismatch");
            break;
        }

        match decode_payload(&payload) {
            Some((selector, sample)) => {
                match store.write(&selector, std::slice::from_ref(&sample)) {
                    Ok(()) => applied += 1,
                    // Records older than the restored snapshots are fine
                    // to drop; everything else is a real failure.
                    Err(StoreError::FromPast { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
            None => {
                warn!(path = %path.display(), "truncating tail at malformed payload");
                break;
            }
        }
    }
    Ok(applied)
}

fn decode_payload(payload: &[u8]) -> Option<(Vec<String>, Sample)> {
    let mut at = 0usize;
    let take = |at: &mut usize, n: usize| -> Option<&[u8]> {
        let slice = payload.get(*at..*at + n)?;
        *at += n;
        Some(slice)
    };

    let ts = i64::from_le_bytes(take(&mut at, 8)?.try_into().ok()?);
    let name_len = u16::from_le_bytes(take(&mut at, 2)?.try_into().ok()?) as usize;
    let name = std::str::from_utf8(take(&mut at, name_len)?).ok()?.to_string();
    let sel_count = take(&mut at, 1)?[0] as usize;
    let mut selector = Vec::with_capacity(sel_count);
    for _ in 0..sel_count {
        let len = take(&mut at, 1)?[0] as usize;
        let segment = std::str::from_utf8(take(&mut at, len)?).ok()?;
        selector.push(segment.to_string());
    }
    let bits = u32::from_le_bytes(take(&mut at, 4)?.try_into().ok()?);
    if at != payload.len() {
        return None;
    }
    Some((selector, Sample::new(name, f32::from_bits(bits), ts)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{selector_from_path, AggregationStrategy, MetricSpec};
    use std::collections::HashMap as StdHashMap;

    fn store() -> MemoryStore {
        let mut catalog = StdHashMap::new();
        catalog.insert(
            "cpu_load".to_string(),
            MetricSpec {
                frequency: 10,
                aggregation: AggregationStrategy::None,
            },
        );
        MemoryStore::new(&catalog).unwrap()
    }

    fn staged(ts: i64, value: f32) -> StagedSample {
        StagedSample {
            cluster: "c".into(),
            host: "h".into(),
            subpath: vec![],
            metric: "cpu_load".into(),
            frequency: 10,
            timestamp: ts,
            value,
        }
    }

    #[test]
    fn tail_replays_into_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = WalWriter::new(dir.path().to_path_buf());
        for (ts, v) in [(1000, 1.0), (1010, 2.0), (1020, 3.0)] {
            wal.append(&staged(ts, v)).unwrap();
        }
        drop(wal);

        let s = store();
        let path = dir.path().join("c").join("h").join(WAL_FILE_NAME);
        assert_eq!(replay_file(&s, &path).unwrap(), 3);
        let res = s
            .read(&selector_from_path(["c", "h"]), "cpu_load", 1000, 1030, 0)
            .unwrap();
        assert_eq!(res.data, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn truncated_trailing_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = WalWriter::new(dir.path().to_path_buf());
        wal.append(&staged(1000, 1.0)).unwrap();
        wal.append(&staged(1010, 2.0)).unwrap();
        drop(wal);

        let path = dir.path().join("c").join("h").join(WAL_FILE_NAME);
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let s = store();
        assert_eq!(replay_file(&s, &path).unwrap(), 1);
    }

    #[test]
    fn corrupted_magic_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(WAL_FILE_NAME);
        std::fs::write(&path, b"NOPE00000000000000000000").unwrap();
        let s = store();
        assert!(matches!(
            replay_file(&s, &path).unwrap_err(),
            StoreError::Corrupted(_)
        ));
    }

    #[test]
    fn rotate_resets_to_a_bare_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = WalWriter::new(dir.path().to_path_buf());
        wal.append(&staged(1000, 1.0)).unwrap();
        wal.rotate(1010).unwrap();

        let path = dir.path().join("c").join("h").join(WAL_FILE_NAME);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            WAL_HEADER_SIZE as u64
        );
        let s = store();
        assert_eq!(replay_file(&s, &path).unwrap(), 0);
    }
}
