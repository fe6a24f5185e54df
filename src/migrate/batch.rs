//! Runs a per-tenant operation over many tenants in windows of bounded size.
//! Every tenant in a window starts together and the next window starts only
//! once the whole window has settled. An `Abort` from the error callback
//! lets the current window finish and marks every later tenant as skipped.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::db::tenant::{self, SchemaNamer};
use crate::error::Result;
use crate::hooks;
use crate::models::migration::{SchemaState, TenantMigrationResult, TenantMigrationStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Continue,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchProgress<'a> {
    Starting,
    /// A migration of this name is about to run.
    Migrating(&'a str),
    Completed,
    Failed,
}

pub type ProgressFn = Arc<dyn Fn(&str, BatchProgress<'_>) + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(&str, &str) -> ErrorAction + Send + Sync>;
pub type DiscoverFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<String>>> + Send + Sync>;

#[derive(Clone)]
pub struct BatchOptions {
    pub concurrency: usize,
    pub dry_run: bool,
    pub on_progress: Option<ProgressFn>,
    /// Consulted after every failed tenant. Without it the batch continues.
    pub on_error: Option<ErrorFn>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            dry_run: false,
            on_progress: None,
            on_error: None,
        }
    }
}

/// Where a batch gets its tenant ids.
#[derive(Clone)]
pub enum TenantSource {
    Ids(Vec<String>),
    Discover(DiscoverFn),
}

impl TenantSource {
    /// Discovers tenants from existing schemas matching `template`.
    pub fn schemas(pool: PgPool, template: &str) -> Self {
        let template = template.to_string();
        TenantSource::Discover(Arc::new(move || {
            let pool = pool.clone();
            let template = template.clone();
            async move { tenant::discover_tenants(&pool, &template).await }.boxed()
        }))
    }

    pub async fn resolve(self) -> Result<Vec<String>> {
        match self {
            TenantSource::Ids(ids) => Ok(ids),
            TenantSource::Discover(discover) => discover().await,
        }
    }
}

impl From<Vec<String>> for TenantSource {
    fn from(ids: Vec<String>) -> Self {
        TenantSource::Ids(ids)
    }
}

/// Per-tenant result type a batch can collect.
pub trait TenantOutcome: Send + 'static {
    /// Error message if the tenant failed.
    fn failure(&self) -> Option<&str>;

    fn not_started(tenant_id: &str, schema_name: &str) -> Self;

    fn crashed(tenant_id: &str, schema_name: &str, error: String) -> Self;
}

impl TenantOutcome for TenantMigrationResult {
    fn failure(&self) -> Option<&str> {
        if self.success || self.skipped {
            None
        } else {
            Some(self.error.as_deref().unwrap_or("unknown error"))
        }
    }

    fn not_started(tenant_id: &str, schema_name: &str) -> Self {
        TenantMigrationResult::skipped(tenant_id, schema_name)
    }

    fn crashed(tenant_id: &str, schema_name: &str, error: String) -> Self {
        TenantMigrationResult::failed(tenant_id, schema_name, error, 0)
    }
}

impl TenantOutcome for TenantMigrationStatus {
    fn failure(&self) -> Option<&str> {
        match self.state {
            SchemaState::Error => Some(self.error.as_deref().unwrap_or("unknown error")),
            SchemaState::Ok | SchemaState::Behind => None,
        }
    }

    fn not_started(tenant_id: &str, schema_name: &str) -> Self {
        TenantMigrationStatus::errored(tenant_id, schema_name, "skipped: batch aborted".into())
    }

    fn crashed(tenant_id: &str, schema_name: &str, error: String) -> Self {
        TenantMigrationStatus::errored(tenant_id, schema_name, error)
    }
}

pub(crate) fn report(progress: Option<&ProgressFn>, tenant_id: &str, event: BatchProgress<'_>) {
    if let Some(progress) = progress {
        hooks::invoke("on_progress", || progress(tenant_id, event));
    }
}

/// Runs `op` for every tenant and returns one outcome per tenant, in input
/// order. A panicking task becomes a failed outcome for its tenant.
pub async fn run_batch<T, Op, Fut>(
    tenant_ids: &[String],
    options: &BatchOptions,
    namer: &SchemaNamer,
    op: Op,
) -> Vec<T>
where
    T: TenantOutcome,
    Op: Fn(String) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    let concurrency = options.concurrency.max(1);
    let progress = options.on_progress.as_ref();
    let mut results = Vec::with_capacity(tenant_ids.len());
    let mut aborted = false;

    for (index, window) in tenant_ids.chunks(concurrency).enumerate() {
        if aborted {
            results.extend(
                window
                    .iter()
                    .map(|id| T::not_started(id, &namer.schema_name(id))),
            );
            continue;
        }
        debug!("Batch window {} ({} tenant(s))", index + 1, window.len());

        let handles: Vec<_> = window
            .iter()
            .map(|id| {
                report(progress, id, BatchProgress::Starting);
                (id, tokio::spawn(op(id.clone())))
            })
            .collect();

        for (id, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => T::crashed(id, &namer.schema_name(id), format!("tenant task failed: {e}")),
            };

            match outcome.failure() {
                None => report(progress, id, BatchProgress::Completed),
                Some(message) => {
                    report(progress, id, BatchProgress::Failed);
                    let action = options
                        .on_error
                        .as_ref()
                        .and_then(|on_error| hooks::invoke("on_error", || on_error(id.as_str(), message)))
                        .unwrap_or(ErrorAction::Continue);
                    if action == ErrorAction::Abort && !aborted {
                        warn!("Batch aborted after failure of tenant {id}");
                        aborted = true;
                    }
                }
            }
            results.push(outcome);
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::migration::BatchResult;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn ids(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("t{i}")).collect()
    }

    fn ok(tenant_id: &str) -> TenantMigrationResult {
        TenantMigrationResult {
            tenant_id: tenant_id.to_string(),
            schema_name: format!("tenant_{tenant_id}"),
            success: true,
            applied_migrations: vec!["0001_init".to_string()],
            error: None,
            duration_ms: 1,
            skipped: false,
        }
    }

    /// Fails `t3`, succeeds everything else after a short sleep.
    fn flaky_op(calls: Arc<AtomicUsize>) -> impl Fn(String) -> BoxFuture<'static, TenantMigrationResult> {
        move |tenant_id| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                if tenant_id == "t3" {
                    TenantMigrationResult::failed(&tenant_id, "tenant_t3", "boom".into(), 10)
                } else {
                    ok(&tenant_id)
                }
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_on_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&errors);
        let options = BatchOptions {
            concurrency: 2,
            on_error: Some(Arc::new(move |tenant: &str, message: &str| {
                seen.lock().unwrap().push(format!("{tenant}: {message}"));
                ErrorAction::Continue
            })),
            ..Default::default()
        };

        let results = run_batch(&ids(5), &options, &SchemaNamer::default(), flaky_op(calls.clone())).await;
        let batch = BatchResult::from_results(results);

        assert_eq!((batch.total, batch.succeeded, batch.failed, batch.skipped), (5, 4, 1, 0));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(*errors.lock().unwrap(), vec!["t3: boom".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_finishes_window_and_skips_rest() {
        let calls = Arc::new(AtomicUsize::new(0));
        let options = BatchOptions {
            concurrency: 2,
            on_error: Some(Arc::new(|_: &str, _: &str| ErrorAction::Abort)),
            ..Default::default()
        };

        let results = run_batch(&ids(5), &options, &SchemaNamer::default(), flaky_op(calls.clone())).await;

        let tenants: Vec<&str> = results.iter().map(|r| r.tenant_id.as_str()).collect();
        assert_eq!(tenants, vec!["t1", "t2", "t3", "t4", "t5"]);
        // t4 shares t3's window so it still runs
        assert!(results[3].success);
        assert!(results[4].skipped);
        assert_eq!(results[4].schema_name, "tenant_t5");
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let batch = BatchResult::from_results(results);
        assert_eq!((batch.succeeded, batch.failed, batch.skipped), (3, 1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_windows_never_overlap() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let options = BatchOptions {
            concurrency: 2,
            ..Default::default()
        };

        let op = {
            let events = Arc::clone(&events);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            move |tenant_id: String| {
                let events = Arc::clone(&events);
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    events.lock().unwrap().push(format!("start:{tenant_id}"));
                    // Uneven durations inside a window
                    let millis = if tenant_id == "t1" { 50 } else { 5 };
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    events.lock().unwrap().push(format!("end:{tenant_id}"));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    ok(&tenant_id)
                }
            }
        };

        let results = run_batch(&ids(4), &options, &SchemaNamer::default(), op).await;
        assert_eq!(results.len(), 4);
        assert_eq!(peak.load(Ordering::SeqCst), 2);

        let events = events.lock().unwrap();
        let at = |e: &str| events.iter().position(|x| x == e).unwrap();
        assert!(at("start:t3") > at("end:t1"));
        assert!(at("start:t3") > at("end:t2"));
        assert!(at("start:t4") > at("end:t1"));
    }

    #[tokio::test]
    async fn test_panicking_task_becomes_failure() {
        let op = |tenant_id: String| async move {
            if tenant_id == "t2" {
                panic!("tenant task exploded");
            }
            ok(&tenant_id)
        };

        let results: Vec<TenantMigrationResult> =
            run_batch(&ids(3), &BatchOptions::default(), &SchemaNamer::default(), op).await;

        assert!(results[0].success);
        assert!(!results[1].success);
        assert!(!results[1].skipped);
        assert!(results[1].error.as_deref().unwrap().contains("tenant task failed"));
        assert!(results[2].success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let options = BatchOptions {
            concurrency: 5,
            on_progress: Some(Arc::new(move |tenant: &str, event: BatchProgress<'_>| {
                sink.lock().unwrap().push(format!("{tenant}:{event:?}"));
            })),
            ..Default::default()
        };

        run_batch(
            &ids(3),
            &options,
            &SchemaNamer::default(),
            flaky_op(Arc::new(AtomicUsize::new(0))),
        )
        .await;

        let events = events.lock().unwrap();
        assert!(events.contains(&"t1:Starting".to_string()));
        assert!(events.contains(&"t1:Completed".to_string()));
        assert!(events.contains(&"t3:Failed".to_string()));
        assert!(!events.contains(&"t3:Completed".to_string()));
    }

    #[tokio::test]
    async fn test_status_outcomes() {
        let op = |tenant_id: String| async move {
            TenantMigrationStatus::errored(&tenant_id, "tenant_x", "schema missing".into())
        };
        let results: Vec<TenantMigrationStatus> =
            run_batch(&ids(2), &BatchOptions::default(), &SchemaNamer::default(), op).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].failure(), Some("schema missing"));
    }

    #[tokio::test]
    async fn test_source_resolution() {
        let ids = TenantSource::from(vec!["a".to_string()]).resolve().await.unwrap();
        assert_eq!(ids, vec!["a"]);

        let discover = TenantSource::Discover(Arc::new(|| {
            async { Ok::<_, crate::error::Error>(vec!["x".to_string(), "y".to_string()]) }.boxed()
        }));
        assert_eq!(discover.resolve().await.unwrap(), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_schema_source_checks_template() {
        let pool = PgPool::connect_lazy("postgres://localhost:1/none").unwrap();
        let source = TenantSource::schemas(pool, "no_placeholder");
        assert!(matches!(source.resolve().await, Err(crate::error::Error::Config(_))));
    }
}
