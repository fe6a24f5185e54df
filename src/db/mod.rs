pub mod tenant;

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, Connection, Executor, PgConnection, PgPool};

use crate::error::Result;

/// Builds a lazy pool whose every connection has its `search_path` pinned to
/// `schema` (then `public`). No connection is opened until first use.
pub fn lazy_schema_pool(
    options: PgConnectOptions,
    schema: Option<&str>,
    max_connections: u32,
    idle_timeout: Duration,
) -> Result<PgPool> {
    let search_path = match schema {
        Some(schema) => Some(search_path_sql(schema)?),
        None => None,
    };

    let mut builder = PgPoolOptions::new()
        .max_connections(max_connections)
        .idle_timeout(idle_timeout);

    if let Some(sql) = search_path {
        builder = builder.after_connect(move |conn, _meta| {
            let sql = sql.clone();
            Box::pin(async move {
                conn.execute(sql.as_str()).await?;
                Ok(())
            })
        });
    }

    Ok(builder.connect_lazy_with(options))
}

pub fn connect_options(database_url: &str) -> Result<PgConnectOptions> {
    Ok(PgConnectOptions::from_str(database_url)?)
}

/// Opens a dedicated connection outside any pool. Migrations and clones use
/// these so they can never be evicted mid-run.
pub async fn connect_dedicated(options: &PgConnectOptions) -> Result<PgConnection> {
    Ok(options.connect().await?)
}

pub async fn set_search_path(conn: &mut PgConnection, schema: &str) -> Result<()> {
    conn.execute(search_path_sql(schema)?.as_str()).await?;
    Ok(())
}

fn search_path_sql(schema: &str) -> Result<String> {
    Ok(format!("SET search_path TO {}, public", tenant::quote_ident(schema)?))
}

/// Leaves only `pg_catalog` on the session path, so `format_type`,
/// `pg_get_expr` and `pg_get_constraintdef` qualify every user object.
pub const CATALOG_SEARCH_PATH: &str = "SET search_path = pg_catalog";

pub async fn pin_catalog_search_path(conn: &mut PgConnection) -> Result<()> {
    conn.execute(CATALOG_SEARCH_PATH).await?;
    Ok(())
}

/// Closes a dedicated connection, logging rather than failing on error.
pub async fn close_quietly(conn: PgConnection) {
    if let Err(e) = conn.close().await {
        tracing::warn!("Failed to close dedicated connection: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_path_sql_quotes_schema() {
        assert_eq!(
            search_path_sql("tenant_acme").unwrap(),
            "SET search_path TO \"tenant_acme\", public"
        );
        assert!(search_path_sql("").is_err());
    }
}
