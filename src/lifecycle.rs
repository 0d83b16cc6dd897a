//! Background lifecycle: retention sweeps, the memory cap and the
//! worker loops that drive them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::checkpoint::Checkpointer;
use crate::store::MemoryStore;
use crate::util::unix_now;

/// Supplies `(cluster, host)` pairs whose jobs started before a given
/// timestamp; those nodes are spared by the retention sweep so running
/// jobs keep their history. The store works fine without a provider.
pub trait NodeProvider: Send + Sync {
    fn nodes_with_jobs_before(&self, threshold: i64) -> Vec<(String, String)>;
}

/// Time-based freeing of buffers older than the retention window.
pub struct Retention {
    store: Arc<MemoryStore>,
    retention: Duration,
    provider: Option<Arc<dyn NodeProvider>>,
    recently_excluded: Mutex<Vec<(String, String)>>,
}

impl Retention {
    pub fn new(
        store: Arc<MemoryStore>,
        retention: Duration,
        provider: Option<Arc<dyn NodeProvider>>,
    ) -> Self {
        Self {
            store,
            retention,
            provider,
            recently_excluded: Mutex::new(Vec::new()),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// One sweep: frees expired buffers on every host not excluded by
    /// the provider. Returns the number of buffers freed.
    pub fn sweep(&self) -> usize {
        let threshold = unix_now() - self.retention.as_secs() as i64;
        let excluded: HashSet<(String, String)> = self
            .provider
            .as_ref()
            .map(|p| p.nodes_with_jobs_before(threshold).into_iter().collect())
            .unwrap_or_default();

        let mut freed = 0;
        for (path, level) in self.store.levels_at_depth(2) {
            let key = (path[0].clone(), path[1].clone());
            if excluded.contains(&key) {
                continue;
            }
            freed += level.free(threshold);
        }

        *self.recently_excluded.lock() = excluded.into_iter().collect();
        if freed > 0 {
            debug!(freed, threshold, "retention sweep");
        }
        freed
    }

    /// Frees the hosts the last sweep spared, ignoring the exclusion
    /// list this once. Used by the memory-pressure path.
    fn free_excluded(&self) -> usize {
        let excluded = std::mem::take(&mut *self.recently_excluded.lock());
        let threshold = unix_now() - self.retention.as_secs() as i64;
        let mut freed = 0;
        for (cluster, host) in excluded {
            let path = [cluster, host];
            freed += self.store.free(&path, threshold).unwrap_or(0);
        }
        freed
    }
}

/// Maximum forced eviction passes per tracker tick.
const FORCE_FREE_PASSES: usize = 100;

/// Compares process RSS against the configured cap and sheds the
/// oldest buffers when over it.
pub struct MemoryTracker {
    store: Arc<MemoryStore>,
    retention: Arc<Retention>,
    cap: u64,
    system: Mutex<System>,
}

impl MemoryTracker {
    pub fn new(store: Arc<MemoryStore>, retention: Arc<Retention>, cap: u64) -> Self {
        Self {
            store,
            retention,
            cap,
            system: Mutex::new(System::new()),
        }
    }

    fn rss(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.memory())
    }

    /// One tick. Returns the number of buffers evicted.
    pub fn check(&self) -> usize {
        let Some(used) = self.rss() else {
            warn!("cannot determine process memory usage");
            return 0;
        };
        if used <= self.cap {
            return 0;
        }
        warn!(used, cap = self.cap, "memory cap exceeded");

        let mut evicted = self.retention.free_excluded();
        for _ in 0..FORCE_FREE_PASSES {
            if self.rss().is_some_and(|u| u <= self.cap) {
                break;
            }
            let freed = self.store.root().force_free();
            if freed == 0 {
                break;
            }
            evicted += freed;
        }
        info!(evicted, "forced eviction finished");
        evicted
    }
}

/// Sleeps until the next tick or shutdown; false means shut down.
pub(crate) async fn tick(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        _ = shutdown.changed() => false,
    }
}

/// Retention worker; ticks at half the retention window.
pub async fn run_retention(retention: Arc<Retention>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs((retention.retention().as_secs() / 2).max(1));
    while tick(interval, &mut shutdown).await {
        retention.sweep();
    }
    debug!("retention worker stopped");
}

const MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run_memory_tracker(tracker: Arc<MemoryTracker>, mut shutdown: watch::Receiver<bool>) {
    while tick(MEMORY_CHECK_INTERVAL, &mut shutdown).await {
        tracker.check();
    }
    debug!("memory tracker stopped");
}

/// Checkpoint worker; failures retry at the next tick.
pub async fn run_checkpointer(
    checkpointer: Arc<Checkpointer>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    while tick(interval, &mut shutdown).await {
        let cp = Arc::clone(&checkpointer);
        let result = tokio::task::spawn_blocking(move || cp.checkpoint_all()).await;
        match result {
            Ok(Ok(written)) => info!(written, "checkpoint pass complete"),
            Ok(Err(err)) if err.is_informational() => {}
            Ok(Err(err)) => error!(%err, "checkpoint pass failed"),
            Err(err) => error!(%err, "checkpoint task panicked"),
        }
    }
    debug!("checkpoint worker stopped");
}
