use chrono::Utc;
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tracing::debug;

use super::{PoolFactory, PoolManager, PoolStats};
use crate::error::{Error, Result};
use crate::models::metrics::{ConnectionCounts, PoolMetrics, SchemaPoolMetrics};

impl From<PoolStats> for ConnectionCounts {
    fn from(stats: PoolStats) -> Self {
        Self {
            total: stats.total,
            idle: stats.idle,
            waiting: stats.waiting,
        }
    }
}

impl<F: PoolFactory> PoolManager<F> {
    /// Connection counts for every cached pool and the shared pool.
    pub fn metrics(&self) -> Result<PoolMetrics> {
        let factory = self.factory();
        let pools: Vec<SchemaPoolMetrics> = self
            .live_pools(None)?
            .into_iter()
            .map(|(tenant_id, schema_name, pool)| SchemaPoolMetrics {
                tenant_id,
                schema_name,
                connections: factory.stats(&pool).into(),
            })
            .collect();
        let shared = self
            .shared_if_created()?
            .map(|pool| factory.stats(&pool).into());

        Ok(PoolMetrics {
            pool_count: pools.len(),
            max_pools: self.config().max_pools,
            pools,
            shared,
            collected_at: Utc::now(),
        })
    }
}

/// Prometheus gauges fed from [`PoolMetrics`] snapshots. Each exporter owns
/// its registry, so several managers can export side by side.
pub struct PoolMetricsExporter {
    registry: Registry,
    connections: GaugeVec,
    pool_count: Gauge,
    max_pools: Gauge,
}

impl PoolMetricsExporter {
    pub fn new(namespace: &str) -> Result<Self> {
        let registry = Registry::new();

        let connections = GaugeVec::new(
            Opts::new("pool_connections", "Connections per tenant pool by state").namespace(namespace),
            &["schema", "state"],
        )
        .map_err(metrics_error)?;
        let pool_count = Gauge::with_opts(
            Opts::new("pools_active", "Tenant pools currently cached").namespace(namespace),
        )
        .map_err(metrics_error)?;
        let max_pools = Gauge::with_opts(
            Opts::new("pools_max", "Configured tenant pool capacity").namespace(namespace),
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(connections.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(pool_count.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(max_pools.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            connections,
            pool_count,
            max_pools,
        })
    }

    /// Replaces the gauge values with the snapshot; evicted schemas vanish.
    pub fn record(&self, metrics: &PoolMetrics) {
        self.connections.reset();
        for pool in &metrics.pools {
            self.set_counts(&pool.schema_name, &pool.connections);
        }
        if let Some(shared) = &metrics.shared {
            self.set_counts("__shared", shared);
        }
        self.pool_count.set(metrics.pool_count as f64);
        self.max_pools.set(metrics.max_pools as f64);
        debug!("Metrics: recorded {} pool(s)", metrics.pool_count);
    }

    fn set_counts(&self, schema: &str, counts: &ConnectionCounts) {
        for (state, value) in [
            ("total", counts.total),
            ("idle", counts.idle),
            ("waiting", counts.waiting),
        ] {
            self.connections
                .with_label_values(&[schema, state])
                .set(f64::from(value));
        }
    }

    /// Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Config(format!("metrics encoding: {e}")))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Config(format!("metrics: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tenant::SchemaNamer;
    use crate::pool::testing::{test_config, FakeFactory};

    #[tokio::test]
    async fn test_metrics_snapshot_and_export() {
        let manager = PoolManager::new(FakeFactory::default(), SchemaNamer::default(), test_config(8));
        manager.acquire("acme").unwrap();
        manager.acquire("globex").unwrap();
        manager.shared().unwrap();

        let metrics = manager.metrics().unwrap();
        assert_eq!(metrics.pool_count, 2);
        assert_eq!(metrics.max_pools, 8);
        assert!(metrics.shared.is_some());
        assert!(metrics.pools.iter().any(|p| p.schema_name == "tenant_acme"));

        let exporter = PoolMetricsExporter::new("tenancy").unwrap();
        exporter.record(&metrics);
        let text = exporter.encode().unwrap();
        assert!(text.contains("tenancy_pools_active 2"));
        assert!(text.contains("schema=\"tenant_globex\""));
        assert!(text.contains("schema=\"__shared\""));

        manager.dispose().await;
        assert!(manager.metrics().is_err());
    }

    #[test]
    fn test_independent_exporters() {
        assert!(PoolMetricsExporter::new("a").is_ok());
        assert!(PoolMetricsExporter::new("a").is_ok());
    }
}
