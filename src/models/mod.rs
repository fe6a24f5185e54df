pub mod clone;
pub mod health;
pub mod metrics;
pub mod migration;
