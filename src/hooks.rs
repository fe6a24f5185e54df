//! Optional lifecycle callbacks. Every method has a no-op default so callers
//! implement only what they observe. Hooks run synchronously on the caller's
//! task; a panicking hook is caught and logged, never propagated.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use crate::error::Error;
use crate::models::migration::TenantMigrationResult;
use crate::pool::EvictReason;

pub trait PoolHooks: Send + Sync {
    fn on_pool_created(&self, _tenant_id: &str) {}

    fn on_pool_evicted(&self, _tenant_id: &str, _reason: EvictReason) {}

    fn on_error(&self, _tenant_id: &str, _error: &Error) {}
}

pub trait MigrationHooks: Send + Sync {
    fn before_tenant(&self, _tenant_id: &str) {}

    fn after_tenant(&self, _tenant_id: &str, _result: &TenantMigrationResult) {}

    fn before_migration(&self, _tenant_id: &str, _name: &str) {}

    fn after_migration(&self, _tenant_id: &str, _name: &str, _duration: Duration) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl PoolHooks for NoopHooks {}

impl MigrationHooks for NoopHooks {}

/// Runs a hook, returning `None` if it panicked.
pub(crate) fn invoke<T>(hook: &'static str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::error!("Hook {hook} panicked; ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_invoke_swallows_panics() {
        let ran_after = AtomicBool::new(false);
        let panicked: Option<()> = invoke("on_pool_created", || panic!("hook exploded"));
        assert!(panicked.is_none());
        invoke("on_pool_created", || ran_after.store(true, Ordering::SeqCst));
        assert!(ran_after.load(Ordering::SeqCst));
        assert_eq!(invoke("on_error", || 7), Some(7));
    }
}
