use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    /// `None` for the shared pool.
    pub tenant_id: Option<String>,
    pub schema_name: String,
    pub status: HealthStatus,
    pub total_connections: u32,
    pub idle_connections: u32,
    pub waiting_requests: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub pools: Vec<PoolHealth>,
    /// `None` when the shared pool was not checked or never created.
    pub shared_db: Option<PoolHealth>,
    pub total_pools: usize,
    pub degraded_pools: usize,
    pub unhealthy_pools: usize,
    pub duration_ms: u64,
}
