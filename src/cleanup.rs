//! Background sweep task.
//!
//! Periodically evicts idle or token-expired pools and stale exchanged tokens.

use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info};

use crate::db::PoolManager;
use crate::exchange::TokenExchangeService;

/// Spawn a background task that sweeps the pool manager and the exchange
/// cache every `every`.
///
/// Returns a `JoinHandle` that can be used to abort the task.
pub fn spawn_cleanup_task(
    pools: PoolManager,
    exchange: TokenExchangeService,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let report = pools.sweep().await;
            let tokens = exchange.sweep().await;

            if report.closed() > 0 || tokens > 0 {
                info!(
                    pools_closed = report.closed(),
                    pools_retired = report.retired,
                    tokens_evicted = tokens,
                    "Cleanup sweep completed"
                );
            }

            let stats = pools.stats().await;
            debug!(
                active_pools = stats.active_pools,
                draining_pools = stats.draining_pools,
                utilization = stats.utilization_percent,
                "Pool manager status"
            );
        }
    })
}
