use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::db::tenant::SchemaNamer;
use crate::migrate::{MigratorConfig, TrackingPreset};
use crate::pool::retry::RetryConfig;
use crate::pool::PoolConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub schema_name_template: String,
    pub pool: PoolConfig,
    /// Connections per tenant pool.
    pub max_connections: u32,
    pub idle_timeout: Duration,
    pub migrator: MigratorConfig,
    pub migration_concurrency: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let or = |key: &str, default: &str| {
            var(key)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| default.into())
        };

        let tracking_format = match or("MIGRATIONS_TABLE_FORMAT", "auto").as_str() {
            "auto" => None,
            other => Some(TrackingPreset::from_str(other)?),
        };

        Ok(Self {
            database_url: var("DATABASE_URL")
                .ok_or_else(|| anyhow::anyhow!("Missing required env var: DATABASE_URL"))?,
            schema_name_template: or("SCHEMA_NAME_TEMPLATE", "tenant_{tenant}"),
            pool: PoolConfig {
                max_pools: or("POOL_MAX_POOLS", "50").parse()?,
                pool_ttl: Duration::from_secs(or("POOL_TTL_SECS", "3600").parse()?),
                cleanup_interval: Duration::from_secs(or("POOL_CLEANUP_INTERVAL_SECS", "60").parse()?),
                ping_timeout: Duration::from_millis(or("POOL_PING_TIMEOUT_MS", "5000").parse()?),
                retry: RetryConfig {
                    max_attempts: or("RETRY_MAX_ATTEMPTS", "3").parse()?,
                    initial_delay: Duration::from_millis(or("RETRY_INITIAL_DELAY_MS", "100").parse()?),
                    max_delay: Duration::from_millis(or("RETRY_MAX_DELAY_MS", "5000").parse()?),
                    ..RetryConfig::default()
                },
            },
            max_connections: or("POOL_MAX_CONNECTIONS", "10").parse()?,
            idle_timeout: Duration::from_secs(or("POOL_IDLE_TIMEOUT_SECS", "30").parse()?),
            migrator: MigratorConfig {
                migrations_dir: PathBuf::from(or("MIGRATIONS_DIR", "./migrations")),
                tracking_table: or("MIGRATIONS_TABLE", "__tenant_migrations"),
                tracking_format,
                ..MigratorConfig::default()
            },
            migration_concurrency: or("MIGRATION_CONCURRENCY", "10").parse()?,
        })
    }

    pub fn namer(&self) -> SchemaNamer {
        SchemaNamer::template(&self.schema_name_template)
    }
}
