//! Copies one schema's structure, and optionally its rows, into a new schema.
//!
//! Phases run in this order: introspect, create the schema and its enum
//! types, tables, non-FK constraints, indexes, data, then foreign keys.
//! A foreign key that cannot be created is reported as a warning.

pub mod copy;
pub mod ddl;
pub mod introspect;
pub mod topo;

use std::sync::Arc;
use std::time::Instant;

use sqlx::postgres::PgConnectOptions;
use sqlx::PgConnection;
use tracing::{debug, error, info, warn};

pub use copy::{AnonValue, AnonymizationRules};
pub use ddl::TableCloneInfo;

use crate::db;
use crate::db::tenant::{quote_ident, schema_exists, validate_ident, SchemaNamer};
use crate::error::{Error, Result};
use crate::hooks;
use crate::models::clone::{ClonePhase, CloneProgress, CloneResult, TableCopyResult};

pub type CloneProgressFn = Arc<dyn Fn(ClonePhase, Option<&CloneProgress>) + Send + Sync>;

#[derive(Clone, Default)]
pub struct CloneOptions {
    pub include_data: bool,
    pub anonymize: AnonymizationRules,
    /// Source tables to leave out. The migration tracking table is always
    /// left out.
    pub exclude_tables: Vec<String>,
    pub on_progress: Option<CloneProgressFn>,
}

#[derive(Clone)]
pub struct SchemaCloner {
    options: PgConnectOptions,
    tracking_table: String,
}

#[derive(Default)]
struct CloneState {
    phase: Option<ClonePhase>,
    tables: Vec<String>,
    copied: Vec<TableCopyResult>,
    warnings: Vec<String>,
}

impl CloneState {
    fn enter(&mut self, progress: Option<&CloneProgressFn>, phase: ClonePhase) {
        debug!("Clone: entering {phase}");
        self.phase = Some(phase);
        emit(progress, phase, None);
    }

    fn phase(&self) -> ClonePhase {
        self.phase.unwrap_or(ClonePhase::Starting)
    }
}

fn emit(progress: Option<&CloneProgressFn>, phase: ClonePhase, detail: Option<&CloneProgress>) {
    if let Some(progress) = progress {
        hooks::invoke("on_clone_progress", || progress(phase, detail));
    }
}

async fn execute(conn: &mut PgConnection, sql: &str) -> Result<()> {
    debug!("Clone: {sql}");
    sqlx::raw_sql(sql).execute(conn).await?;
    Ok(())
}

async fn prepare_session(conn: &mut PgConnection, source: &str, target: &str) -> Result<()> {
    db::pin_catalog_search_path(conn).await?;
    if !schema_exists(&mut *conn, source).await? {
        return Err(Error::SchemaNotFound(source.to_string()));
    }
    if schema_exists(&mut *conn, target).await? {
        return Err(Error::SchemaExists(target.to_string()));
    }
    Ok(())
}

impl SchemaCloner {
    pub fn new(database_url: &str, tracking_table: &str) -> Result<Self> {
        Ok(Self {
            options: db::connect_options(database_url)?,
            tracking_table: tracking_table.to_string(),
        })
    }

    /// Clones the schema of `source_tenant` into a new schema for
    /// `target_tenant`.
    pub async fn clone_tenant(
        &self,
        namer: &SchemaNamer,
        source_tenant: &str,
        target_tenant: &str,
        options: &CloneOptions,
    ) -> Result<CloneResult> {
        self.clone_schema(
            &namer.schema_name(source_tenant),
            &namer.schema_name(target_tenant),
            options,
        )
        .await
    }

    /// `Err` for invalid names, connection failures and unmet preconditions
    /// (missing source, existing target). Failures after that come back as
    /// `Ok` with `success == false` and whatever was completed.
    pub async fn clone_schema(
        &self,
        source: &str,
        target: &str,
        options: &CloneOptions,
    ) -> Result<CloneResult> {
        validate_ident(source)?;
        validate_ident(target)?;
        let started = Instant::now();
        let progress = options.on_progress.as_ref();
        emit(progress, ClonePhase::Starting, None);

        let mut conn = db::connect_dedicated(&self.options).await?;
        if let Err(e) = prepare_session(&mut conn, source, target).await {
            db::close_quietly(conn).await;
            return Err(e);
        }

        info!("Cloning schema {source} into {target} (data: {})", options.include_data);
        let mut state = CloneState::default();
        let outcome = self.run(&mut conn, source, target, options, &mut state).await;
        db::close_quietly(conn).await;

        let error = match outcome {
            Ok(()) => {
                state.enter(progress, ClonePhase::Completed);
                None
            }
            Err(e) => {
                error!("Clone of {source} into {target} failed during {}: {e}", state.phase());
                emit(progress, ClonePhase::Failed, None);
                Some(e.to_string())
            }
        };

        let rows_copied = state.copied.iter().map(|t| t.rows).sum();
        let result = CloneResult {
            source_schema: source.to_string(),
            target_schema: target.to_string(),
            success: error.is_none(),
            error,
            phase: state.phase(),
            tables: state.tables,
            copied: state.copied,
            rows_copied,
            warnings: state.warnings,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if result.success {
            info!(
                "Cloned {source} into {target}: {} table(s), {} row(s), {} warning(s) in {}ms",
                result.tables.len(),
                result.rows_copied,
                result.warnings.len(),
                result.duration_ms
            );
        }
        Ok(result)
    }

    async fn run(
        &self,
        conn: &mut PgConnection,
        source: &str,
        target: &str,
        options: &CloneOptions,
        state: &mut CloneState,
    ) -> Result<()> {
        let progress = options.on_progress.as_ref();

        state.enter(progress, ClonePhase::Introspecting);
        let mut exclude = options.exclude_tables.clone();
        exclude.push(self.tracking_table.clone());
        let snapshot = introspect::introspect_schema(conn, source, &exclude).await?;
        let plans = snapshot
            .tables
            .iter()
            .map(|table| ddl::plan_table(table, source, target))
            .collect::<Result<Vec<_>>>()?;

        state.enter(progress, ClonePhase::CreatingSchema);
        execute(conn, &format!("CREATE SCHEMA {}", quote_ident(target)?)).await?;
        for def in &snapshot.enums {
            execute(conn, &ddl::enum_sql(def, target)?).await?;
        }

        state.enter(progress, ClonePhase::CreatingTables);
        for (i, plan) in plans.iter().enumerate() {
            let detail = CloneProgress {
                table: plan.name.clone(),
                progress: i + 1,
                total: plans.len(),
            };
            emit(progress, ClonePhase::CreatingTables, Some(&detail));
            execute(conn, &plan.create_ddl).await?;
            state.tables.push(plan.name.clone());
        }

        state.enter(progress, ClonePhase::CreatingConstraints);
        for sql in plans.iter().flat_map(|p| &p.constraint_ddls) {
            execute(conn, sql).await?;
        }

        state.enter(progress, ClonePhase::CreatingIndexes);
        for sql in plans.iter().flat_map(|p| &p.index_ddls) {
            execute(conn, sql).await?;
        }

        if options.include_data {
            state.enter(progress, ClonePhase::CopyingData);
            let on_table =
                |detail: &CloneProgress| emit(progress, ClonePhase::CopyingData, Some(detail));
            copy::copy_data(
                conn,
                source,
                target,
                &plans,
                &options.anonymize,
                &on_table,
                &mut state.copied,
                &mut state.warnings,
            )
            .await?;
        }

        state.enter(progress, ClonePhase::CreatingForeignKeys);
        for plan in &plans {
            for sql in &plan.foreign_key_ddls {
                if let Err(e) = execute(conn, sql).await {
                    let message = format!("foreign key on {target}.{} not created: {e}", plan.name);
                    warn!("Clone: {message}");
                    state.warnings.push(message);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_state_reports_phases() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress: CloneProgressFn = Arc::new(move |phase: ClonePhase, detail: Option<&CloneProgress>| {
            sink.lock()
                .unwrap()
                .push((phase, detail.map(|d| d.table.clone())));
        });

        let mut state = CloneState::default();
        assert_eq!(state.phase(), ClonePhase::Starting);
        state.enter(Some(&progress), ClonePhase::Introspecting);
        emit(
            Some(&progress),
            ClonePhase::CreatingTables,
            Some(&CloneProgress {
                table: "users".to_string(),
                progress: 1,
                total: 2,
            }),
        );

        assert_eq!(state.phase(), ClonePhase::Introspecting);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (ClonePhase::Introspecting, None),
                (ClonePhase::CreatingTables, Some("users".to_string())),
            ]
        );
    }

    #[test]
    fn test_panicking_progress_is_contained() {
        let progress: CloneProgressFn = Arc::new(|_: ClonePhase, _: Option<&CloneProgress>| panic!("progress sink failed"));
        let mut state = CloneState::default();
        state.enter(Some(&progress), ClonePhase::CopyingData);
        assert_eq!(state.phase(), ClonePhase::CopyingData);
    }

    #[tokio::test]
    async fn test_invalid_names_fail_before_connecting() {
        let cloner = SchemaCloner::new("postgres://localhost/app", "__tenant_migrations").unwrap();
        let result = cloner.clone_schema("tenant_a", "", &CloneOptions::default()).await;
        assert!(matches!(result, Err(Error::InvalidIdentifier { .. })));
    }
}
