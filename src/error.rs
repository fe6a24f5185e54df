use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("pool manager has been disposed")]
    Disposed,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("schema \"{0}\" does not exist")]
    SchemaNotFound(String),

    #[error("schema \"{0}\" already exists")]
    SchemaExists(String),

    #[error("invalid identifier {ident:?}: {reason}")]
    InvalidIdentifier { ident: String, reason: &'static str },

    #[error("invalid migration file name: {0}")]
    InvalidMigrationName(String),

    #[error("migration {name} failed: {source}")]
    Migration {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Error produced once and handed to every caller that awaited the same
    /// pool creation.
    #[error(transparent)]
    Shared(Arc<Error>),
}

impl Error {
    /// Connection-level failures worth retrying. SQL errors raised by the
    /// server for a statement are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(e) => is_transient_sqlx(e),
            Error::Timeout(_) => true,
            Error::Shared(inner) => inner.is_transient(),
            _ => false,
        }
    }
}

fn is_transient_sqlx(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| {
                // 08xxx connection exceptions, 57P0x admin shutdown / crash,
                // 53300 too many connections
                code.starts_with("08") || code.starts_with("57P0") || code == "53300"
            })
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(Error::Timeout(Duration::from_millis(10)).is_transient());
        assert!(!Error::Disposed.is_transient());
        assert!(!Error::SchemaNotFound("tenant_a".into()).is_transient());
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_transient());

        let shared = Error::Shared(Arc::new(Error::Database(sqlx::Error::PoolClosed)));
        assert!(shared.is_transient());
    }

    #[test]
    fn test_shared_error_is_transparent() {
        let shared = Error::Shared(Arc::new(Error::SchemaExists("tenant_b".into())));
        assert_eq!(shared.to_string(), "schema \"tenant_b\" already exists");
    }
}
