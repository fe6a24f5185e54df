use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::Instant;
use tracing::warn;

use super::{ping_with_timeout, PoolFactory, PoolManager};
use crate::error::Result;
use crate::models::health::{HealthReport, HealthStatus, PoolHealth};

#[derive(Debug, Clone)]
pub struct HealthCheckOptions {
    pub ping: bool,
    pub ping_timeout: Duration,
    pub include_shared: bool,
    /// Restrict the check to these tenants' cached pools.
    pub tenant_ids: Option<Vec<String>>,
}

impl Default for HealthCheckOptions {
    fn default() -> Self {
        Self {
            ping: true,
            ping_timeout: Duration::from_secs(5),
            include_shared: true,
            tenant_ids: None,
        }
    }
}

/// `unhealthy` on ping failure or timeout; `degraded` when requests are
/// waiting on the pool or the ping took more than half the timeout.
pub fn classify(ping_ok: bool, waiting: u32, latency: Option<Duration>, timeout: Duration) -> HealthStatus {
    if !ping_ok {
        HealthStatus::Unhealthy
    } else if waiting > 0 || latency.is_some_and(|l| l > timeout / 2) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

impl<F: PoolFactory> PoolManager<F> {
    /// Probes cached pools (and the shared pool) fully in parallel. Does not
    /// touch LRU order or create pools.
    pub async fn check_health(&self, options: HealthCheckOptions) -> Result<HealthReport> {
        let started = Instant::now();
        let pools = self.live_pools(options.tenant_ids.as_deref())?;
        let shared = if options.include_shared {
            self.shared_if_created()?
        } else {
            None
        };

        let factory = self.factory();
        let probes = pools.iter().map(|(tenant_id, schema, pool)| {
            probe(factory, pool, Some(tenant_id.clone()), schema.clone(), &options)
        });
        let shared_probe = async {
            match &shared {
                Some(pool) => Some(probe(factory, pool, None, "public".to_string(), &options).await),
                None => None,
            }
        };
        let (pools, shared_db) = tokio::join!(join_all(probes), shared_probe);

        let degraded_pools = pools
            .iter()
            .filter(|p| p.status == HealthStatus::Degraded)
            .count();
        let unhealthy_pools = pools
            .iter()
            .filter(|p| p.status == HealthStatus::Unhealthy)
            .count();
        let shared_unhealthy = shared_db
            .as_ref()
            .is_some_and(|s| s.status == HealthStatus::Unhealthy);

        let report = HealthReport {
            healthy: unhealthy_pools == 0 && !shared_unhealthy,
            total_pools: pools.len(),
            degraded_pools,
            unhealthy_pools,
            pools,
            shared_db,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if !report.healthy {
            warn!(
                "Health check: {} unhealthy pool(s), shared unhealthy: {shared_unhealthy}",
                report.unhealthy_pools
            );
        }
        Ok(report)
    }
}

async fn probe<F: PoolFactory>(
    factory: &F,
    pool: &F::Pool,
    tenant_id: Option<String>,
    schema_name: String,
    options: &HealthCheckOptions,
) -> PoolHealth {
    let stats = factory.stats(pool);

    let (ping_ok, latency, error) = if options.ping {
        let started = Instant::now();
        match ping_with_timeout(factory, pool, options.ping_timeout).await {
            Ok(()) => (true, Some(started.elapsed()), None),
            Err(e) => (false, None, Some(e.to_string())),
        }
    } else {
        (true, None, None)
    };

    PoolHealth {
        tenant_id,
        schema_name,
        status: classify(ping_ok, stats.waiting, latency, options.ping_timeout),
        total_connections: stats.total,
        idle_connections: stats.idle,
        waiting_requests: stats.waiting,
        response_time_ms: latency.map(|l| l.as_millis() as u64),
        error,
    }
}
