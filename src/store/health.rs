//! Per-node monitoring state derived from sample recency.

use serde::{Deserialize, Serialize};

use crate::store::MemoryStore;
use crate::util::unix_now;

/// A node is healthy while samples keep arriving; it degrades once the
/// newest sample is older than this many seconds.
const STALE_AFTER: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    /// Unix timestamp of the newest sample seen for this node, if any.
    pub last_sample: Option<i64>,
}

impl MemoryStore {
    /// Monitoring state for one `(cluster, node)` pair.
    pub fn health_check(&self, cluster: &str, node: &str) -> HealthCheck {
        let path = [cluster.to_string(), node.to_string()];
        let newest = self
            .get_level(&path)
            .and_then(|level| level.newest_sample());
        let status = match newest {
            None => HealthStatus::Unhealthy,
            Some(ts) if unix_now() - ts > STALE_AFTER => HealthStatus::Degraded,
            Some(_) => HealthStatus::Healthy,
        };
        HealthCheck {
            status,
            last_sample: newest,
        }
    }
}
