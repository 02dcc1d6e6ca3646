//! Database pool metrics sampling.
//!
//! Provides a background task that periodically samples the state of both pools and records
//! metrics for observability.

use std::sync::Arc;

use metrics::gauge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Router;
use crate::backend::{Backend, PoolStats};
use crate::config::PoolMetricsConfig;
use crate::errors::Target;

/// Start the pool metrics sampler background task.
///
/// This task periodically samples the pool state and records:
/// - `replica_router_pool_connections_total` - Total connections in the pool
/// - `replica_router_pool_connections_idle` - Idle connections available
/// - `replica_router_pool_connections_in_use` - Connections currently in use
/// - `replica_router_pool_connections_max` - Configured connection limit (0 = unlimited)
///
/// All metrics are labeled with `pool` (`primary` or `replica`).
pub async fn run_pool_metrics_sampler<B: Backend>(
    router: Arc<Router<B>>,
    config: PoolMetricsConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("Starting pool metrics sampler with {:?} interval", config.sample_interval);

    let mut interval = tokio::time::interval(config.sample_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Pool metrics sampler shutting down");
                break;
            }
            _ = interval.tick() => {
                let stats = router.stats();
                record(Target::Primary, &stats.primary);
                record(Target::Replica, &stats.replica);
            }
        }
    }

    Ok(())
}

fn record(target: Target, stats: &PoolStats) {
    let pool = target.as_str();
    let in_use = stats.in_use();

    gauge!("replica_router_pool_connections_total", "pool" => pool).set(stats.size as f64);
    gauge!("replica_router_pool_connections_idle", "pool" => pool).set(stats.idle as f64);
    gauge!("replica_router_pool_connections_in_use", "pool" => pool).set(in_use as f64);
    // Limits can change at runtime through the setters
    gauge!("replica_router_pool_connections_max", "pool" => pool).set(stats.max_open_connections as f64);

    debug!(pool, size = stats.size, idle = stats.idle, in_use, "Sampled pool metrics");
}
