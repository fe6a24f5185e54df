//! Per-schema connection pool cache.
//!
//! One pool per live schema, bounded by `max_pools` (least-recently-accessed
//! entry evicted on overflow) and by `pool_ttl` (idle entries removed by a
//! periodic sweep). A separately held shared pool on the default search path
//! is never subject to either limit.

pub mod health;
pub mod metrics;
pub mod retry;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use lru::LruCache;
use serde::Serialize;
use sqlx::postgres::PgConnectOptions;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::db;
use crate::db::tenant::SchemaNamer;
use crate::error::{Error, Result};
use crate::hooks::{self, NoopHooks, PoolHooks};
use retry::{with_retry, RetryConfig};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_pools: usize,
    pub pool_ttl: Duration,
    pub cleanup_interval: Duration,
    /// Bound on each validation ping during `acquire_validated`.
    pub ping_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pools: 50,
            pool_ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictReason {
    Lru,
    Ttl,
    Manual,
    Disposed,
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvictReason::Lru => "lru",
            EvictReason::Ttl => "ttl",
            EvictReason::Manual => "manual",
            EvictReason::Disposed => "disposed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: u32,
    pub idle: u32,
    pub waiting: u32,
}

/// Creates, probes and closes the pools held by [`PoolManager`].
pub trait PoolFactory: Send + Sync + 'static {
    type Pool: Clone + Send + Sync + 'static;

    /// Builds a pool without connecting. `None` means the shared pool.
    fn create(&self, schema: Option<&str>) -> Result<Self::Pool>;

    fn ping(&self, pool: &Self::Pool) -> impl Future<Output = Result<()>> + Send;

    fn close(&self, pool: Self::Pool) -> impl Future<Output = ()> + Send;

    fn stats(&self, pool: &Self::Pool) -> PoolStats;
}

/// sqlx-backed factory: lazy pools with `search_path` pinned per schema.
#[derive(Debug, Clone)]
pub struct PgPoolFactory {
    options: PgConnectOptions,
    max_connections: u32,
    idle_timeout: Duration,
}

impl PgPoolFactory {
    pub fn new(database_url: &str, max_connections: u32, idle_timeout: Duration) -> Result<Self> {
        Ok(Self {
            options: db::connect_options(database_url)?,
            max_connections,
            idle_timeout,
        })
    }
}

impl PoolFactory for PgPoolFactory {
    type Pool = PgPool;

    fn create(&self, schema: Option<&str>) -> Result<PgPool> {
        db::lazy_schema_pool(
            self.options.clone(),
            schema,
            self.max_connections,
            self.idle_timeout,
        )
    }

    async fn ping(&self, pool: &PgPool) -> Result<()> {
        sqlx::query("SELECT 1").execute(pool).await?;
        Ok(())
    }

    async fn close(&self, pool: PgPool) {
        pool.close().await;
    }

    fn stats(&self, pool: &PgPool) -> PoolStats {
        let total = pool.size();
        let idle = pool.num_idle() as u32;
        // sqlx does not expose its waiter queue; a pool with every connection
        // checked out is reported as having one waiting request.
        let saturated = total >= pool.options().get_max_connections() && idle == 0;
        PoolStats {
            total,
            idle,
            waiting: u32::from(saturated),
        }
    }
}

struct PoolEntry<P> {
    tenant_id: String,
    pool: P,
    last_access: Instant,
}

struct State<P> {
    entries: LruCache<String, PoolEntry<P>>,
    shared: Option<P>,
    disposed: bool,
}

type PendingPool<P> = Shared<BoxFuture<'static, std::result::Result<P, Arc<Error>>>>;

struct Inner<F: PoolFactory> {
    factory: F,
    config: PoolConfig,
    namer: SchemaNamer,
    hooks: Arc<dyn PoolHooks>,
    // Lock order: state, then pending.
    state: Mutex<State<F::Pool>>,
    pending: Mutex<HashMap<String, PendingPool<F::Pool>>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

/// Owned cache of per-schema pools. Cloning yields another handle to the
/// same cache; independent managers share nothing.
pub struct PoolManager<F: PoolFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: PoolFactory> Clone for PoolManager<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<F: PoolFactory> PoolManager<F> {
    pub fn new(factory: F, namer: SchemaNamer, config: PoolConfig) -> Self {
        Self::with_hooks(factory, namer, config, Arc::new(NoopHooks))
    }

    /// Builds the manager and, when called inside a tokio runtime, starts
    /// the TTL sweep.
    pub fn with_hooks(
        factory: F,
        namer: SchemaNamer,
        config: PoolConfig,
        hooks: Arc<dyn PoolHooks>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.max_pools).unwrap_or(NonZeroUsize::MIN);
        let manager = Self {
            inner: Arc::new(Inner {
                factory,
                config,
                namer,
                hooks,
                state: Mutex::new(State {
                    entries: LruCache::new(capacity),
                    shared: None,
                    disposed: false,
                }),
                pending: Mutex::new(HashMap::new()),
                cleanup: Mutex::new(None),
            }),
        };

        if tokio::runtime::Handle::try_current().is_ok() {
            manager.start_cleanup();
        } else {
            debug!("No tokio runtime; pool TTL sweep not started");
        }
        manager
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn schema_for(&self, tenant_id: &str) -> String {
        self.inner.namer.schema_name(tenant_id)
    }

    /// Returns the tenant's pool, creating it without validation if absent.
    pub fn acquire(&self, tenant_id: &str) -> Result<F::Pool> {
        let schema = self.schema_for(tenant_id);

        let (pool, evicted) = {
            let mut state = lock(&self.inner.state);
            if state.disposed {
                return Err(Error::Disposed);
            }
            if let Some(entry) = state.entries.get_mut(&schema) {
                entry.last_access = Instant::now();
                return Ok(entry.pool.clone());
            }

            let pool = self.inner.factory.create(Some(&schema))?;
            let evicted = insert_entry(&mut state.entries, &schema, tenant_id, pool.clone());
            (pool, evicted)
        };

        debug!("Created pool for schema {schema}");
        self.inner.notify_created(tenant_id);
        if let Some(entry) = evicted {
            self.inner.retire(entry, EvictReason::Lru);
        }
        Ok(pool)
    }

    /// Returns the tenant's pool, creating it and pinging it with retry if
    /// absent. Concurrent calls for the same uncached schema share one
    /// creation attempt.
    pub async fn acquire_validated(&self, tenant_id: &str) -> Result<F::Pool> {
        let schema = self.schema_for(tenant_id);

        let pending = {
            let mut state = lock(&self.inner.state);
            if state.disposed {
                return Err(Error::Disposed);
            }
            if let Some(entry) = state.entries.get_mut(&schema) {
                entry.last_access = Instant::now();
                return Ok(entry.pool.clone());
            }

            let mut pending = lock(&self.inner.pending);
            pending
                .entry(schema.clone())
                .or_insert_with(|| {
                    Inner::create_validated(
                        self.inner.clone(),
                        tenant_id.to_string(),
                        schema.clone(),
                    )
                    .boxed()
                    .shared()
                })
                .clone()
        };

        pending.await.map_err(Error::Shared)
    }

    /// The pool on the default search path. Created lazily, closed only on
    /// dispose.
    pub fn shared(&self) -> Result<F::Pool> {
        let mut state = lock(&self.inner.state);
        if state.disposed {
            return Err(Error::Disposed);
        }
        if let Some(pool) = &state.shared {
            return Ok(pool.clone());
        }
        let pool = self.inner.factory.create(None)?;
        state.shared = Some(pool.clone());
        debug!("Created shared pool");
        Ok(pool)
    }

    /// Removes and closes the tenant's pool. Returns whether one existed.
    pub async fn evict(&self, tenant_id: &str, reason: EvictReason) -> Result<bool> {
        let schema = self.schema_for(tenant_id);
        let entry = {
            let mut state = lock(&self.inner.state);
            if state.disposed {
                return Err(Error::Disposed);
            }
            state.entries.pop(&schema)
        };

        let Some(entry) = entry else {
            return Ok(false);
        };
        info!("Evicting pool for schema {schema} ({reason})");
        let tenant_id = entry.tenant_id.clone();
        self.inner.factory.close(entry.pool).await;
        self.inner.notify_evicted(&tenant_id, reason);
        Ok(true)
    }

    /// Evicts every entry idle for longer than `pool_ttl`, regardless of
    /// capacity. Returns how many were evicted.
    pub fn evict_expired(&self) -> Result<usize> {
        self.inner.evict_expired()
    }

    /// Starts the periodic TTL sweep. No-op if it is already running.
    pub fn start_cleanup(&self) {
        let mut cleanup = lock(&self.inner.cleanup);
        if cleanup.is_some() {
            return;
        }

        let weak: Weak<Inner<F>> = Arc::downgrade(&self.inner);
        let period = self.inner.config.cleanup_interval;
        *cleanup = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match inner.evict_expired() {
                    Ok(0) => {}
                    Ok(n) => debug!("Pool sweep evicted {n} idle pool(s)"),
                    Err(_) => break,
                }
            }
        }));
    }

    pub fn has_pool(&self, tenant_id: &str) -> Result<bool> {
        let schema = self.schema_for(tenant_id);
        let state = self.inner.live_state()?;
        Ok(state.entries.contains(&schema))
    }

    pub fn pool_count(&self) -> Result<usize> {
        Ok(self.inner.live_state()?.entries.len())
    }

    /// Schema names currently cached, most recently accessed first.
    pub fn active_schemas(&self) -> Result<Vec<String>> {
        let state = self.inner.live_state()?;
        Ok(state.entries.iter().map(|(schema, _)| schema.clone()).collect())
    }

    pub fn active_tenants(&self) -> Result<Vec<String>> {
        let state = self.inner.live_state()?;
        Ok(state
            .entries
            .iter()
            .map(|(_, entry)| entry.tenant_id.clone())
            .collect())
    }

    /// `(tenant_id, schema, pool)` for cached pools, optionally restricted to
    /// a tenant subset. Does not count as an access.
    pub(crate) fn live_pools(
        &self,
        tenant_ids: Option<&[String]>,
    ) -> Result<Vec<(String, String, F::Pool)>> {
        let wanted: Option<Vec<String>> =
            tenant_ids.map(|ids| ids.iter().map(|id| self.schema_for(id)).collect());

        let state = self.inner.live_state()?;
        Ok(state
            .entries
            .iter()
            .filter(|(schema, _)| {
                wanted
                    .as_ref()
                    .map_or(true, |wanted| wanted.iter().any(|w| w == *schema))
            })
            .map(|(schema, entry)| (entry.tenant_id.clone(), schema.clone(), entry.pool.clone()))
            .collect())
    }

    pub(crate) fn shared_if_created(&self) -> Result<Option<F::Pool>> {
        Ok(self.inner.live_state()?.shared.clone())
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.inner.state).disposed
    }

    /// Closes every pool, shared pool included. Every later call on this
    /// manager (or its clones) fails with [`Error::Disposed`].
    pub async fn dispose(&self) {
        let (entries, shared) = {
            let mut state = lock(&self.inner.state);
            if state.disposed {
                return;
            }
            state.disposed = true;
            let mut entries = Vec::with_capacity(state.entries.len());
            while let Some((_, entry)) = state.entries.pop_lru() {
                entries.push(entry);
            }
            lock(&self.inner.pending).clear();
            (entries, state.shared.take())
        };

        if let Some(handle) = lock(&self.inner.cleanup).take() {
            handle.abort();
        }

        let count = entries.len();
        let factory = &self.inner.factory;
        join_all(entries.into_iter().map(|entry| async move {
            factory.close(entry.pool).await;
            entry.tenant_id
        }))
        .await
        .iter()
        .for_each(|tenant_id| self.inner.notify_evicted(tenant_id, EvictReason::Disposed));

        if let Some(shared) = shared {
            factory.close(shared).await;
        }
        info!("Pool manager disposed; closed {count} tenant pool(s)");
    }
}

/// Inserts a fresh entry, returning the entry pushed out by the capacity
/// bound, if any.
fn insert_entry<P>(
    entries: &mut LruCache<String, PoolEntry<P>>,
    schema: &str,
    tenant_id: &str,
    pool: P,
) -> Option<PoolEntry<P>> {
    let entry = PoolEntry {
        tenant_id: tenant_id.to_string(),
        pool,
        last_access: Instant::now(),
    };
    match entries.push(schema.to_string(), entry) {
        Some((key, old)) if key != schema => Some(old),
        _ => None,
    }
}

async fn ping_with_timeout<F: PoolFactory>(
    factory: &F,
    pool: &F::Pool,
    timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(timeout, factory.ping(pool)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

impl<F: PoolFactory> Inner<F> {
    fn live_state(&self) -> Result<MutexGuard<'_, State<F::Pool>>> {
        let state = lock(&self.state);
        if state.disposed {
            return Err(Error::Disposed);
        }
        Ok(state)
    }

    async fn create_validated(
        self: Arc<Self>,
        tenant_id: String,
        schema: String,
    ) -> std::result::Result<F::Pool, Arc<Error>> {
        let created = self.connect_with_retry(&schema).await;

        let pool = match created {
            Ok(pool) => pool,
            Err(e) => {
                lock(&self.pending).remove(&schema);
                warn!("Failed to create pool for schema {schema}: {e}");
                hooks::invoke("on_error", || self.hooks.on_error(&tenant_id, &e));
                return Err(Arc::new(e));
            }
        };

        enum Settled<P> {
            Inserted(P, Option<PoolEntry<P>>),
            Existing(P),
            Disposed,
        }

        let settled = {
            let mut state = lock(&self.state);
            let settled = if state.disposed {
                Settled::Disposed
            } else if let Some(entry) = state.entries.get_mut(&schema) {
                // An unvalidated acquire() won the race
                entry.last_access = Instant::now();
                Settled::Existing(entry.pool.clone())
            } else {
                let evicted = insert_entry(&mut state.entries, &schema, &tenant_id, pool.clone());
                Settled::Inserted(pool.clone(), evicted)
            };
            lock(&self.pending).remove(&schema);
            settled
        };

        match settled {
            Settled::Inserted(pool, evicted) => {
                info!("Created validated pool for schema {schema}");
                self.notify_created(&tenant_id);
                if let Some(entry) = evicted {
                    self.retire(entry, EvictReason::Lru);
                }
                Ok(pool)
            }
            Settled::Existing(existing) => {
                self.factory.close(pool).await;
                Ok(existing)
            }
            Settled::Disposed => {
                self.factory.close(pool).await;
                Err(Arc::new(Error::Disposed))
            }
        }
    }

    async fn connect_with_retry(&self, schema: &str) -> Result<F::Pool> {
        let pool = self.factory.create(Some(schema))?;

        let factory = &self.factory;
        let pool_ref = &pool;
        let timeout = self.config.ping_timeout;
        let outcome = with_retry(
            &self.config.retry,
            move |_| async move { ping_with_timeout(factory, pool_ref, timeout).await },
            Error::is_transient,
            |attempt, e, delay| {
                warn!("Pool validation for {schema} failed (attempt {attempt}): {e}; retrying in {delay:?}")
            },
        )
        .await;

        match outcome {
            Ok(outcome) => {
                debug!(
                    "Validated pool for {schema} after {} attempt(s) in {:?}",
                    outcome.attempts, outcome.total_time
                );
                Ok(pool)
            }
            Err(e) => {
                self.factory.close(pool).await;
                Err(e)
            }
        }
    }

    fn evict_expired(self: &Arc<Self>) -> Result<usize> {
        let ttl = self.config.pool_ttl;
        let expired: Vec<PoolEntry<F::Pool>> = {
            let mut state = self.live_state()?;
            let stale: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.last_access.elapsed() > ttl)
                .map(|(schema, _)| schema.clone())
                .collect();
            stale
                .iter()
                .filter_map(|schema| state.entries.pop(schema))
                .collect()
        };

        let count = expired.len();
        for entry in expired {
            self.retire(entry, EvictReason::Ttl);
        }
        Ok(count)
    }

    /// Fire-and-forget close of an evicted entry. Never blocks the caller.
    fn retire(self: &Arc<Self>, entry: PoolEntry<F::Pool>, reason: EvictReason) {
        debug!("Retiring pool for tenant {} ({reason})", entry.tenant_id);
        self.notify_evicted(&entry.tenant_id, reason);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.clone();
                handle.spawn(async move {
                    inner.factory.close(entry.pool).await;
                });
            }
            Err(_) => warn!(
                "No tokio runtime to close evicted pool for tenant {}; dropping it",
                entry.tenant_id
            ),
        }
    }

    fn notify_created(&self, tenant_id: &str) {
        hooks::invoke("on_pool_created", || self.hooks.on_pool_created(tenant_id));
    }

    fn notify_evicted(&self, tenant_id: &str, reason: EvictReason) {
        hooks::invoke("on_pool_evicted", || {
            self.hooks.on_pool_evicted(tenant_id, reason)
        });
    }
}
