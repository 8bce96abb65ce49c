use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Rough per-pool footprint used for the memory estimate in stats.
pub const ESTIMATED_BYTES_PER_POOL: u64 = 64 * 1024;

#[derive(Debug, Default)]
pub(crate) struct PoolManagerStats {
    pub total_requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub pools_created: AtomicU64,
    pub pools_closed: AtomicU64,
    pub max_users_reached: AtomicU64,
    pub creation_failures: AtomicU64,
}

impl PoolManagerStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time statistics for the pool manager.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatsSnapshot {
    pub active_pools: usize,
    pub draining_pools: usize,
    pub max_concurrent_users: usize,
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub pools_created: u64,
    pub pools_closed: u64,
    pub max_users_reached: u64,
    pub creation_failures: u64,
    /// Active pools as a percentage of `max_concurrent_users`.
    pub utilization_percent: f64,
    pub hit_rate: f64,
    pub estimated_memory_bytes: u64,
}

impl PoolStatsSnapshot {
    pub(crate) fn collect(
        counters: &PoolManagerStats,
        active_pools: usize,
        draining_pools: usize,
        max_concurrent_users: usize,
    ) -> Self {
        let cache_hits = counters.cache_hits.load(Ordering::Relaxed);
        let cache_misses = counters.cache_misses.load(Ordering::Relaxed);
        let lookups = cache_hits + cache_misses;

        let utilization_percent = if max_concurrent_users == 0 {
            0.0
        } else {
            active_pools as f64 / max_concurrent_users as f64 * 100.0
        };
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            cache_hits as f64 / lookups as f64
        };

        Self {
            active_pools,
            draining_pools,
            max_concurrent_users,
            total_requests: counters.total_requests.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            pools_created: counters.pools_created.load(Ordering::Relaxed),
            pools_closed: counters.pools_closed.load(Ordering::Relaxed),
            max_users_reached: counters.max_users_reached.load(Ordering::Relaxed),
            creation_failures: counters.creation_failures.load(Ordering::Relaxed),
            utilization_percent,
            hit_rate,
            estimated_memory_bytes: (active_pools + draining_pools) as u64
                * ESTIMATED_BYTES_PER_POOL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_derived_fields() {
        let counters = PoolManagerStats::default();
        PoolManagerStats::incr(&counters.cache_hits);
        PoolManagerStats::incr(&counters.cache_hits);
        PoolManagerStats::incr(&counters.cache_hits);
        PoolManagerStats::incr(&counters.cache_misses);

        let snapshot = PoolStatsSnapshot::collect(&counters, 25, 1, 100);
        assert_eq!(snapshot.utilization_percent, 25.0);
        assert_eq!(snapshot.hit_rate, 0.75);
        assert_eq!(snapshot.estimated_memory_bytes, 26 * ESTIMATED_BYTES_PER_POOL);
    }

    #[test]
    fn test_snapshot_with_no_traffic() {
        let snapshot = PoolStatsSnapshot::collect(&PoolManagerStats::default(), 0, 0, 0);
        assert_eq!(snapshot.utilization_percent, 0.0);
        assert_eq!(snapshot.hit_rate, 0.0);
    }
}
