pub mod batch;
pub mod files;
pub mod tracking;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, Executor, PgConnection};
use tracing::{debug, error, info, warn};

pub use batch::{BatchOptions, BatchProgress, ErrorAction, TenantSource};
pub use files::MigrationFile;
pub use tracking::{TrackingFormat, TrackingPreset};

use crate::db;
use crate::db::tenant::{quote_ident, schema_exists, validate_ident, SchemaNamer};
use crate::error::{Error, Result};
use crate::hooks::{self, MigrationHooks, NoopHooks};
use crate::models::migration::{
    BatchResult, SchemaState, TenantMigrationResult, TenantMigrationStatus,
};

#[derive(Debug, Clone)]
pub struct MigratorConfig {
    pub migrations_dir: PathBuf,
    pub tracking_table: String,
    /// Forces a format. `None` detects it from each schema's existing table
    /// and falls back to `default_format` when there is none.
    pub tracking_format: Option<TrackingPreset>,
    pub default_format: TrackingPreset,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("./migrations"),
            tracking_table: "__tenant_migrations".to_string(),
            tracking_format: None,
            default_format: TrackingPreset::NameBased,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MigrateOptions {
    /// Report pending migrations without touching the schema.
    pub dry_run: bool,
}

/// Applies SQL migration files to tenant schemas. Each tenant run uses its
/// own dedicated connection and each migration its own transaction.
#[derive(Clone)]
pub struct Migrator {
    options: PgConnectOptions,
    namer: SchemaNamer,
    config: Arc<MigratorConfig>,
    hooks: Arc<dyn MigrationHooks>,
}

struct TenantRun<'a> {
    tenant_id: &'a str,
    schema: &'a str,
    files: &'a [MigrationFile],
    options: MigrateOptions,
    on_migration: &'a (dyn Fn(&str) + Send + Sync),
}

impl Migrator {
    pub fn new(database_url: &str, namer: SchemaNamer, config: MigratorConfig) -> Result<Self> {
        validate_ident(&config.tracking_table)?;
        Ok(Self {
            options: db::connect_options(database_url)?,
            namer,
            config: Arc::new(config),
            hooks: Arc::new(NoopHooks),
        })
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn MigrationHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    pub fn namer(&self) -> &SchemaNamer {
        &self.namer
    }

    pub async fn load_migrations(&self) -> Result<Vec<MigrationFile>> {
        files::load_migrations(&self.config.migrations_dir).await
    }

    async fn connect(&self) -> Result<PgConnection> {
        db::connect_dedicated(&self.options).await
    }

    /// Format for `schema` plus whether its tracking table already exists.
    async fn resolve_format(
        &self,
        conn: &mut PgConnection,
        schema: &str,
    ) -> Result<(TrackingFormat, bool)> {
        let table = &self.config.tracking_table;
        let columns = tracking::probe_columns(conn, schema, table).await?;
        let exists = !columns.is_empty();

        if let Some(preset) = self.config.tracking_format {
            return Ok((preset.format(table), exists));
        }
        match tracking::infer_format(table, &columns)? {
            Some(format) => {
                debug!("Detected tracking format {format} in {schema}");
                Ok((format, true))
            }
            None => {
                let format = self.config.default_format.format(table);
                info!("No tracking table in {schema}; using default format {format}");
                Ok((format, false))
            }
        }
    }

    /// Migrates one tenant. `Err` only when the migration files cannot be
    /// loaded; database failures land in the returned result.
    pub async fn migrate_tenant(
        &self,
        tenant_id: &str,
        options: MigrateOptions,
    ) -> Result<TenantMigrationResult> {
        let files = self.load_migrations().await?;
        Ok(self
            .migrate_tenant_with(tenant_id, &files, options, &|_: &str| {})
            .await)
    }

    /// Like [`Migrator::migrate_tenant`] with preloaded files. `on_migration`
    /// is called with each migration name before it runs.
    pub async fn migrate_tenant_with(
        &self,
        tenant_id: &str,
        files: &[MigrationFile],
        options: MigrateOptions,
        on_migration: &(dyn Fn(&str) + Send + Sync),
    ) -> TenantMigrationResult {
        let schema = self.namer.schema_name(tenant_id);
        let started = Instant::now();
        hooks::invoke("before_tenant", || self.hooks.before_tenant(tenant_id));

        let run = TenantRun {
            tenant_id,
            schema: &schema,
            files,
            options,
            on_migration,
        };
        let mut applied = Vec::new();
        let outcome = self.run_tenant(&run, &mut applied).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(()) => {
                if options.dry_run {
                    info!("Dry run for {schema}: {} pending migration(s)", applied.len());
                } else {
                    info!("Migrated {schema}: {} migration(s) in {duration_ms}ms", applied.len());
                }
                TenantMigrationResult {
                    tenant_id: tenant_id.to_string(),
                    schema_name: schema.clone(),
                    success: true,
                    applied_migrations: applied,
                    error: None,
                    duration_ms,
                    skipped: false,
                }
            }
            Err(e) => {
                error!("Migrating {schema} failed after {} migration(s): {e}", applied.len());
                TenantMigrationResult {
                    tenant_id: tenant_id.to_string(),
                    schema_name: schema.clone(),
                    success: false,
                    applied_migrations: applied,
                    error: Some(e.to_string()),
                    duration_ms,
                    skipped: false,
                }
            }
        };

        hooks::invoke("after_tenant", || self.hooks.after_tenant(tenant_id, &result));
        result
    }

    async fn run_tenant(&self, run: &TenantRun<'_>, applied: &mut Vec<String>) -> Result<()> {
        let mut conn = self.connect().await?;
        let outcome = self.apply_pending(&mut conn, run, applied).await;
        db::close_quietly(conn).await;
        outcome
    }

    async fn apply_pending(
        &self,
        conn: &mut PgConnection,
        run: &TenantRun<'_>,
        applied: &mut Vec<String>,
    ) -> Result<()> {
        let schema = run.schema;
        let (format, exists) = self.resolve_format(conn, schema).await?;

        if run.options.dry_run {
            let recorded = if exists {
                format.read_applied(conn, schema).await?
            } else {
                Vec::new()
            };
            applied.extend(
                tracking::compute_pending(run.files, &recorded, &format)
                    .into_iter()
                    .map(|f| f.name.clone()),
            );
            return Ok(());
        }

        ensure_tracking(conn, schema, &format).await?;
        let recorded = format.read_applied(conn, schema).await?;
        let pending = tracking::compute_pending(run.files, &recorded, &format);
        if pending.is_empty() {
            debug!("{schema} is up to date ({} applied)", recorded.len());
            return Ok(());
        }

        db::set_search_path(conn, schema).await?;
        for file in pending {
            (run.on_migration)(file.name.as_str());
            hooks::invoke("before_migration", || {
                self.hooks.before_migration(run.tenant_id, &file.name)
            });

            let started = Instant::now();
            apply_one(conn, schema, &format, file).await?;
            let elapsed = started.elapsed();

            hooks::invoke("after_migration", || {
                self.hooks.after_migration(run.tenant_id, &file.name, elapsed)
            });
            debug!("Applied {} to {schema} in {elapsed:?}", file.name);
            applied.push(file.name.clone());
        }
        Ok(())
    }

    /// Migrates every tenant from `source`. `Err` only when tenants cannot be
    /// listed or files cannot be loaded.
    pub async fn migrate_all(
        &self,
        source: TenantSource,
        options: BatchOptions,
    ) -> Result<BatchResult> {
        let tenant_ids = source.resolve().await?;
        let files = Arc::new(self.load_migrations().await?);
        info!(
            "Migrating {} tenant(s) with {} migration file(s), concurrency {}",
            tenant_ids.len(),
            files.len(),
            options.concurrency
        );

        let migrator = self.clone();
        let progress = options.on_progress.clone();
        let migrate = MigrateOptions {
            dry_run: options.dry_run,
        };
        let results = batch::run_batch(&tenant_ids, &options, &self.namer, move |tenant_id| {
            let migrator = migrator.clone();
            let files = Arc::clone(&files);
            let progress = progress.clone();
            async move {
                let report = |name: &str| {
                    batch::report(progress.as_ref(), &tenant_id, BatchProgress::Migrating(name))
                };
                migrator
                    .migrate_tenant_with(&tenant_id, &files, migrate, &report)
                    .await
            }
        })
        .await;

        let result = BatchResult::from_results(results);
        info!(
            "Batch finished: {} succeeded, {} failed, {} skipped",
            result.succeeded, result.failed, result.skipped
        );
        Ok(result)
    }

    pub async fn tenant_status(&self, tenant_id: &str) -> Result<TenantMigrationStatus> {
        let files = self.load_migrations().await?;
        self.status_with(tenant_id, &files).await
    }

    async fn status_with(
        &self,
        tenant_id: &str,
        files: &[MigrationFile],
    ) -> Result<TenantMigrationStatus> {
        let schema = self.namer.schema_name(tenant_id);
        let mut conn = self.connect().await?;
        let outcome = self.read_status(&mut conn, tenant_id, &schema, files).await;
        db::close_quietly(conn).await;
        outcome
    }

    async fn read_status(
        &self,
        conn: &mut PgConnection,
        tenant_id: &str,
        schema: &str,
        files: &[MigrationFile],
    ) -> Result<TenantMigrationStatus> {
        if !schema_exists(&mut *conn, schema).await? {
            return Err(Error::SchemaNotFound(schema.to_string()));
        }
        let (format, exists) = self.resolve_format(conn, schema).await?;
        let recorded = if exists {
            format.read_applied(conn, schema).await?
        } else {
            Vec::new()
        };
        let pending: Vec<String> = tracking::compute_pending(files, &recorded, &format)
            .into_iter()
            .map(|f| f.name.clone())
            .collect();

        Ok(TenantMigrationStatus {
            tenant_id: tenant_id.to_string(),
            schema_name: schema.to_string(),
            applied_count: recorded.len(),
            pending_count: pending.len(),
            state: if pending.is_empty() {
                SchemaState::Ok
            } else {
                SchemaState::Behind
            },
            pending_migrations: pending,
            format: exists.then(|| format.to_string()),
            error: None,
        })
    }

    /// Status of every tenant from `source`. A tenant whose status cannot be
    /// read is reported with [`SchemaState::Error`].
    pub async fn status_all(
        &self,
        source: TenantSource,
        concurrency: usize,
    ) -> Result<Vec<TenantMigrationStatus>> {
        let tenant_ids = source.resolve().await?;
        let files = Arc::new(self.load_migrations().await?);
        let options = BatchOptions {
            concurrency,
            ..Default::default()
        };

        let migrator = self.clone();
        let statuses = batch::run_batch(&tenant_ids, &options, &self.namer, move |tenant_id| {
            let migrator = migrator.clone();
            let files = Arc::clone(&files);
            async move {
                match migrator.status_with(&tenant_id, &files).await {
                    Ok(status) => status,
                    Err(e) => {
                        let schema = migrator.namer.schema_name(&tenant_id);
                        warn!("Could not read migration status of {schema}: {e}");
                        TenantMigrationStatus::errored(&tenant_id, &schema, e.to_string())
                    }
                }
            }
        })
        .await;
        Ok(statuses)
    }

    /// Records every pending migration as applied without running it. Used
    /// to baseline schemas that were created outside the migrator.
    pub async fn mark_applied(&self, tenant_id: &str) -> Result<Vec<String>> {
        let files = self.load_migrations().await?;
        let schema = self.namer.schema_name(tenant_id);
        let mut conn = self.connect().await?;
        let outcome = self.mark_pending(&mut conn, &schema, &files).await;
        db::close_quietly(conn).await;

        let marked = outcome?;
        info!("Marked {} migration(s) as applied in {schema}", marked.len());
        Ok(marked)
    }

    async fn mark_pending(
        &self,
        conn: &mut PgConnection,
        schema: &str,
        files: &[MigrationFile],
    ) -> Result<Vec<String>> {
        let (format, _) = self.resolve_format(conn, schema).await?;
        ensure_tracking(conn, schema, &format).await?;
        let recorded = format.read_applied(conn, schema).await?;
        let pending = tracking::compute_pending(files, &recorded, &format);

        let mut tx = conn.begin().await?;
        for file in &pending {
            format.record(&mut tx, schema, file).await?;
        }
        tx.commit().await?;
        Ok(pending.into_iter().map(|f| f.name.clone()).collect())
    }

    /// Creates the tenant's schema, optionally migrating it right away.
    /// Fails with [`Error::SchemaExists`] if it is already there.
    pub async fn create_tenant(
        &self,
        tenant_id: &str,
        migrate: bool,
    ) -> Result<Option<TenantMigrationResult>> {
        let schema = self.namer.schema_name(tenant_id);
        let mut conn = self.connect().await?;
        let outcome = create_schema(&mut conn, &schema).await;
        db::close_quietly(conn).await;
        outcome?;
        info!("Created schema {schema} for tenant {tenant_id}");

        if migrate {
            Ok(Some(self.migrate_tenant(tenant_id, MigrateOptions::default()).await?))
        } else {
            Ok(None)
        }
    }

    /// Drops the tenant's schema and everything in it. Missing schemas are
    /// not an error.
    pub async fn drop_tenant(&self, tenant_id: &str) -> Result<()> {
        let schema = self.namer.schema_name(tenant_id);
        let sql = format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(&schema)?);
        let mut conn = self.connect().await?;
        let outcome = sqlx::raw_sql(&sql).execute(&mut conn).await;
        db::close_quietly(conn).await;
        outcome?;
        warn!("Dropped schema {schema} for tenant {tenant_id}");
        Ok(())
    }

    pub async fn tenant_exists(&self, tenant_id: &str) -> Result<bool> {
        let schema = self.namer.schema_name(tenant_id);
        let mut conn = self.connect().await?;
        let outcome = schema_exists(&mut conn, &schema).await;
        db::close_quietly(conn).await;
        outcome
    }
}

async fn create_schema(conn: &mut PgConnection, schema: &str) -> Result<()> {
    if schema_exists(&mut *conn, schema).await? {
        return Err(Error::SchemaExists(schema.to_string()));
    }
    sqlx::raw_sql(&format!("CREATE SCHEMA {}", quote_ident(schema)?))
        .execute(conn)
        .await?;
    Ok(())
}

async fn ensure_tracking(
    conn: &mut PgConnection,
    schema: &str,
    format: &TrackingFormat,
) -> Result<()> {
    (&mut *conn)
        .execute(sqlx::raw_sql(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)?)))
        .await?;
    (&mut *conn)
        .execute(sqlx::raw_sql(&format.create_table_sql(schema)?))
        .await?;
    Ok(())
}

/// Runs one migration and its tracking insert in a single transaction.
async fn apply_one(
    conn: &mut PgConnection,
    schema: &str,
    format: &TrackingFormat,
    file: &MigrationFile,
) -> Result<()> {
    let mut tx = conn.begin().await?;

    if let Err(source) = (&mut *tx).execute(sqlx::raw_sql(&file.sql)).await {
        if let Err(e) = tx.rollback().await {
            warn!("Rollback of {} in {schema} failed: {e}", file.name);
        }
        return Err(Error::Migration {
            name: file.name.clone(),
            source,
        });
    }
    if let Err(e) = format.record(&mut tx, schema, file).await {
        if let Err(rollback) = tx.rollback().await {
            warn!("Rollback of {} in {schema} failed: {rollback}", file.name);
        }
        return Err(e);
    }

    tx.commit().await?;
    Ok(())
}
