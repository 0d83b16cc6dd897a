//! Process-wide free-list for canonical-capacity buffer storage.
//!
//! Only arrays of exactly [`BUFFER_CAP`](crate::model::BUFFER_CAP) slots are
//! pooled; buffers restored from snapshots carry their natural length and
//! bypass the pool entirely.

use parking_lot::Mutex;

use crate::model::BUFFER_CAP;
use crate::util::unix_now;

/// Upper bound on cached storages; overflow is simply dropped.
const POOL_MAX: usize = 4096;

/// The pool is discarded wholesale when nothing has been released for
/// this long (seconds).
const POOL_STALE_AFTER: i64 = 600;

static POOL: Mutex<Pool> = Mutex::new(Pool {
    storages: Vec::new(),
    last_release: 0,
});

struct Pool {
    storages: Vec<Vec<f32>>,
    last_release: i64,
}

/// Takes a zero-length storage with `BUFFER_CAP` capacity, reusing a
/// released one when available.
pub(crate) fn get() -> Vec<f32> {
    let mut pool = POOL.lock();
    if pool.last_release != 0 && unix_now() - pool.last_release > POOL_STALE_AFTER {
        pool.storages.clear();
    }
    pool.storages
        .pop()
        .unwrap_or_else(|| Vec::with_capacity(BUFFER_CAP))
}

/// Returns a storage to the pool. Storages whose capacity is not the
/// canonical constant are dropped to keep the slab size homogeneous.
pub(crate) fn put(mut storage: Vec<f32>) {
    if storage.capacity() < BUFFER_CAP {
        return;
    }
    storage.clear();
    let mut pool = POOL.lock();
    pool.last_release = unix_now();
    if pool.storages.len() < POOL_MAX {
        pool.storages.push(storage);
    }
}

#[cfg(test)]
pub(crate) fn len() -> usize {
    POOL.lock().storages.len()
}
