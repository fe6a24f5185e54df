//! Operator CLI: migrate, inspect, clone and health-check tenant schemas.
//!
//! Usage: tenancy <migrate|status|clone|health> [options]
//! Results are printed to stdout as JSON; logs go through `RUST_LOG`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tenancy::clone::{AnonymizationRules, CloneOptions, SchemaCloner};
use tenancy::config::Config;
use tenancy::db;
use tenancy::db::tenant;
use tenancy::migrate::{BatchOptions, BatchProgress, ErrorAction, Migrator, TenantSource};
use tenancy::models::clone::{ClonePhase, CloneProgress};
use tenancy::pool::health::HealthCheckOptions;
use tenancy::pool::metrics::PoolMetricsExporter;
use tenancy::pool::{PgPoolFactory, PoolManager};

#[derive(Parser)]
#[command(name = "tenancy", about = "Manage schema-per-tenant PostgreSQL databases")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending migrations
    Migrate {
        /// Tenant to migrate (repeatable; every tenant schema if omitted)
        #[arg(long = "tenant")]
        tenants: Vec<String>,
        #[arg(long)]
        dry_run: bool,
        /// Tenants migrated at once (defaults to MIGRATION_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Stop scheduling new tenants after the first failure
        #[arg(long)]
        abort_on_error: bool,
    },
    /// Show applied and pending migrations
    Status {
        #[arg(long = "tenant")]
        tenants: Vec<String>,
    },
    /// Clone one tenant's schema into a new tenant
    Clone {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        /// Copy rows as well as structure
        #[arg(long)]
        data: bool,
        /// JSON file of `{"table": {"column": value}}` replacements
        #[arg(long)]
        anonymize: Option<PathBuf>,
        /// Table to leave out (repeatable)
        #[arg(long = "exclude")]
        exclude_tables: Vec<String>,
    },
    /// Ping tenant pools and report their health
    Health {
        #[arg(long = "tenant")]
        tenants: Vec<String>,
        /// Also print Prometheus metrics
        #[arg(long)]
        metrics: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    match args.command {
        Command::Migrate {
            tenants,
            dry_run,
            concurrency,
            abort_on_error,
        } => {
            let migrator = migrator(&config)?;
            let source = tenant_source(&config, tenants).await?;
            let options = BatchOptions {
                concurrency: concurrency.unwrap_or(config.migration_concurrency),
                dry_run,
                on_progress: Some(Arc::new(|tenant: &str, event: BatchProgress<'_>| {
                    if let BatchProgress::Migrating(name) = event {
                        info!("[{tenant}] applying {name}");
                    }
                })),
                on_error: if abort_on_error {
                    Some(Arc::new(|_: &str, _: &str| ErrorAction::Abort))
                } else {
                    None
                },
            };

            let result = migrator.migrate_all(source, options).await?;
            print_json(&result)?;
            if result.failed > 0 {
                anyhow::bail!("{} tenant(s) failed to migrate", result.failed);
            }
        }
        Command::Status { tenants } => {
            let migrator = migrator(&config)?;
            let source = tenant_source(&config, tenants).await?;
            let statuses = migrator
                .status_all(source, config.migration_concurrency)
                .await?;
            print_json(&statuses)?;
        }
        Command::Clone {
            from,
            to,
            data,
            anonymize,
            exclude_tables,
        } => {
            let anonymize: AnonymizationRules = match anonymize {
                Some(path) => {
                    let raw = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str(&raw)
                        .with_context(|| format!("parsing {}", path.display()))?
                }
                None => AnonymizationRules::default(),
            };
            let options = CloneOptions {
                include_data: data,
                anonymize,
                exclude_tables,
                on_progress: Some(Arc::new(|phase: ClonePhase, detail: Option<&CloneProgress>| match detail {
                    Some(d) => info!("clone {phase}: {} ({}/{})", d.table, d.progress, d.total),
                    None => info!("clone {phase}"),
                })),
            };

            let cloner = SchemaCloner::new(&config.database_url, &config.migrator.tracking_table)?;
            let result = cloner
                .clone_tenant(&config.namer(), &from, &to, &options)
                .await?;
            print_json(&result)?;
            if !result.success {
                anyhow::bail!("clone failed during {}", result.phase);
            }
        }
        Command::Health { tenants, metrics } => {
            let factory = PgPoolFactory::new(
                &config.database_url,
                config.max_connections,
                config.idle_timeout,
            )?;
            let manager = PoolManager::new(factory, config.namer(), config.pool.clone());
            manager.shared()?;

            for tenant in &tenants {
                if let Err(e) = manager.acquire_validated(tenant).await {
                    warn!("Tenant {tenant} unreachable: {e}");
                }
            }
            let report = manager
                .check_health(HealthCheckOptions {
                    ping_timeout: config.pool.ping_timeout,
                    ..Default::default()
                })
                .await?;
            print_json(&report)?;

            if metrics {
                let exporter = PoolMetricsExporter::new("tenancy")?;
                exporter.record(&manager.metrics()?);
                println!("{}", exporter.encode()?);
            }
            manager.dispose().await;

            if !report.healthy {
                anyhow::bail!("{} unhealthy pool(s)", report.unhealthy_pools);
            }
        }
    }

    Ok(())
}

fn migrator(config: &Config) -> anyhow::Result<Migrator> {
    Ok(Migrator::new(
        &config.database_url,
        config.namer(),
        config.migrator.clone(),
    )?)
}

/// Explicit tenants, or every schema matching the name template.
async fn tenant_source(config: &Config, tenants: Vec<String>) -> anyhow::Result<TenantSource> {
    if !tenants.is_empty() {
        return Ok(TenantSource::Ids(tenants));
    }
    let options = db::connect_options(&config.database_url)?;
    let tenants = tenant::discover_tenants_once(&options, &config.schema_name_template).await?;
    Ok(TenantSource::Ids(tenants))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
