use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCounts {
    pub total: u32,
    pub idle: u32,
    pub waiting: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaPoolMetrics {
    pub tenant_id: String,
    pub schema_name: String,
    pub connections: ConnectionCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub pools: Vec<SchemaPoolMetrics>,
    pub shared: Option<ConnectionCounts>,
    pub pool_count: usize,
    pub max_pools: usize,
    pub collected_at: DateTime<Utc>,
}
