use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock as unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parses the `<from>` part of a snapshot file name such as `1690000000.json`.
pub(crate) fn timestamp_from_file_name(name: &str) -> Option<i64> {
    name.split('.').next()?.parse().ok()
}
