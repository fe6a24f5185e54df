use chrono::{DateTime, Utc};
use serde::Serialize;

/// One row of a schema's tracking table. `identifier` is the migration name
/// or content hash depending on the table's format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigrationRecord {
    pub id: i64,
    pub identifier: String,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Outcome of one `migrate_tenant` call. For dry runs, `applied_migrations`
/// lists what would have been applied.
#[derive(Debug, Clone, Serialize)]
pub struct TenantMigrationResult {
    pub tenant_id: String,
    pub schema_name: String,
    pub success: bool,
    pub applied_migrations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Never started because the batch was aborted. Not a failure.
    pub skipped: bool,
}

impl TenantMigrationResult {
    pub fn failed(tenant_id: &str, schema_name: &str, error: String, duration_ms: u64) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            schema_name: schema_name.to_string(),
            success: false,
            applied_migrations: Vec::new(),
            error: Some(error),
            duration_ms,
            skipped: false,
        }
    }

    pub fn skipped(tenant_id: &str, schema_name: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            schema_name: schema_name.to_string(),
            success: false,
            applied_migrations: Vec::new(),
            error: Some("skipped: batch aborted".to_string()),
            duration_ms: 0,
            skipped: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub details: Vec<TenantMigrationResult>,
}

impl BatchResult {
    pub fn from_results(details: Vec<TenantMigrationResult>) -> Self {
        let skipped = details.iter().filter(|r| r.skipped).count();
        let succeeded = details.iter().filter(|r| r.success).count();
        Self {
            total: details.len(),
            succeeded,
            failed: details.len() - succeeded - skipped,
            skipped,
            details,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaState {
    /// Every migration applied.
    Ok,
    /// Pending migrations exist.
    Behind,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantMigrationStatus {
    pub tenant_id: String,
    pub schema_name: String,
    pub applied_count: usize,
    pub pending_count: usize,
    pub pending_migrations: Vec<String>,
    /// Tracking format in use, `None` when the schema has no tracking table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub state: SchemaState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TenantMigrationStatus {
    pub fn errored(tenant_id: &str, schema_name: &str, error: String) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            schema_name: schema_name.to_string(),
            applied_count: 0,
            pending_count: 0,
            pending_migrations: Vec::new(),
            format: None,
            state: SchemaState::Error,
            error: Some(error),
        }
    }
}
