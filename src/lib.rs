// Library exports for the CLI and integration tests
pub mod clone;
pub mod config;
pub mod db;
pub mod error;
pub mod hooks;
pub mod migrate;
pub mod models;
pub mod pool;

pub use error::{Error, Result};
