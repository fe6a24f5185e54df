use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use sqlx::postgres::PgConnectOptions;

use crate::error::{Error, Result};

/// PostgreSQL truncates identifiers longer than this (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LEN: usize = 63;

const TENANT_PLACEHOLDER: &str = "{tenant}";

/// Maps a tenant id to its schema name. Deterministic; collisions between
/// tenants are the caller's problem.
#[derive(Clone)]
pub struct SchemaNamer(Arc<dyn Fn(&str) -> String + Send + Sync>);

impl SchemaNamer {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Builds a namer from a template such as `tenant_{tenant}`. The tenant id
    /// is lowercased and dashes become underscores before substitution.
    pub fn template(template: &str) -> Self {
        let template = template.to_string();
        Self::new(move |tenant_id| {
            let normalized = tenant_id.to_lowercase().replace('-', "_");
            template.replace(TENANT_PLACEHOLDER, &normalized)
        })
    }

    pub fn schema_name(&self, tenant_id: &str) -> String {
        (self.0)(tenant_id)
    }

    pub fn resolve(&self, tenant_id: &str) -> TenantSchema {
        TenantSchema {
            tenant_id: tenant_id.to_string(),
            schema_name: self.schema_name(tenant_id),
        }
    }
}

impl Default for SchemaNamer {
    fn default() -> Self {
        Self::template("tenant_{tenant}")
    }
}

impl fmt::Debug for SchemaNamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SchemaNamer(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TenantSchema {
    pub tenant_id: String,
    pub schema_name: String,
}

/// Quotes an identifier for interpolation into generated SQL. Every schema,
/// table, column and constraint name goes through here.
pub fn quote_ident(ident: &str) -> Result<String> {
    validate_ident(ident)?;
    Ok(format!("\"{}\"", ident.replace('"', "\"\"")))
}

/// `"schema"."name"`
pub fn qualified(schema: &str, name: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(name)?))
}

pub fn validate_ident(ident: &str) -> Result<()> {
    let reason = if ident.is_empty() {
        "identifier is empty"
    } else if ident.len() > MAX_IDENTIFIER_LEN {
        "identifier is longer than 63 bytes"
    } else if ident.contains('\0') {
        "identifier contains a NUL byte"
    } else {
        return Ok(());
    };
    Err(Error::InvalidIdentifier {
        ident: ident.to_string(),
        reason,
    })
}

/// Standard-conforming string literal (`'it''s'`).
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Lists tenant ids whose schema exists in the database. Only works for
/// template namers (`prefix{tenant}suffix`), since the id is recovered by
/// stripping the fixed parts of the template.
pub async fn discover_tenants<'e, E>(executor: E, template: &str) -> Result<Vec<String>>
where
    E: sqlx::PgExecutor<'e>,
{
    let (prefix, suffix) = split_template(template)?;

    let schemas: Vec<String> = sqlx::query_scalar(
        "SELECT nspname::TEXT FROM pg_namespace
         WHERE nspname NOT IN ('pg_catalog', 'information_schema', 'public')
           AND nspname NOT LIKE 'pg_%'
         ORDER BY nspname",
    )
    .fetch_all(executor)
    .await?;

    Ok(tenants_from_schemas(&schemas, template, prefix, suffix))
}

/// One-off discovery over a dedicated connection, closed before returning.
pub async fn discover_tenants_once(options: &PgConnectOptions, template: &str) -> Result<Vec<String>> {
    split_template(template)?;
    let mut conn = super::connect_dedicated(options).await?;
    let tenants = discover_tenants(&mut conn, template).await;
    super::close_quietly(conn).await;
    tenants
}

fn split_template(template: &str) -> Result<(&str, &str)> {
    template
        .split_once(TENANT_PLACEHOLDER)
        .ok_or_else(|| Error::Config(format!("template {template:?} has no {{tenant}}")))
}

/// Ids recovered from schema names. Schemas the template namer would not
/// produce for their own id (`tenant_Acme` maps back to `tenant_acme`) are
/// skipped with a warning.
fn tenants_from_schemas(schemas: &[String], template: &str, prefix: &str, suffix: &str) -> Vec<String> {
    let namer = SchemaNamer::template(template);
    schemas
        .iter()
        .filter_map(|schema| {
            let id = schema.strip_prefix(prefix)?.strip_suffix(suffix)?;
            if id.is_empty() {
                return None;
            }
            if namer.schema_name(id) != *schema {
                tracing::warn!("Skipping schema {schema}: tenant id {id:?} maps to {}", namer.schema_name(id));
                return None;
            }
            Some(id.to_string())
        })
        .collect()
}

pub async fn schema_exists<'e, E>(executor: E, schema: &str) -> Result<bool>
where
    E: sqlx::PgExecutor<'e>,
{
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
    )
    .bind(schema)
    .fetch_one(executor)
    .await?;
    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_namer() {
        let namer = SchemaNamer::template("garderie_{tenant}");
        assert_eq!(namer.schema_name("Les-Petits"), "garderie_les_petits");
        assert_eq!(namer.schema_name("acme"), namer.schema_name("acme"));

        let resolved = namer.resolve("acme");
        assert_eq!(resolved.tenant_id, "acme");
        assert_eq!(resolved.schema_name, "garderie_acme");
    }

    #[test]
    fn test_custom_namer() {
        let namer = SchemaNamer::new(|id| format!("t_{}", id.len()));
        assert_eq!(namer.schema_name("abc"), "t_3");
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("users").unwrap(), "\"users\"");
        assert_eq!(
            quote_ident("evil\"; DROP SCHEMA public; --").unwrap(),
            "\"evil\"\"; DROP SCHEMA public; --\""
        );
        assert_eq!(qualified("tenant_a", "users").unwrap(), "\"tenant_a\".\"users\"");
    }

    #[test]
    fn test_quote_ident_rejects_invalid() {
        assert!(quote_ident("").is_err());
        assert!(quote_ident("a\0b").is_err());
        assert!(quote_ident(&"x".repeat(64)).is_err());
        assert!(quote_ident(&"x".repeat(63)).is_ok());
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_tenants_from_schemas() {
        let schemas = vec![
            "tenant_acme".to_string(),
            "tenant_globex".to_string(),
            "tenant_".to_string(),
            "audit".to_string(),
        ];
        assert_eq!(
            tenants_from_schemas(&schemas, "tenant_{tenant}", "tenant_", ""),
            vec!["acme".to_string(), "globex".to_string()]
        );
    }

    #[tokio::test]
    async fn test_discovery_rejects_template_before_connecting() {
        let options = crate::db::connect_options("postgres://localhost:1/none").unwrap();
        let result = discover_tenants_once(&options, "tenants").await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_discovered_ids_map_back_to_their_schema() {
        let schemas = vec![
            "tenant_Acme".to_string(),
            "tenant_big-co".to_string(),
            "tenant_initech".to_string(),
        ];
        assert_eq!(
            tenants_from_schemas(&schemas, "tenant_{tenant}", "tenant_", ""),
            vec!["initech".to_string()]
        );

        let namer = SchemaNamer::template("tenant_{tenant}");
        for id in tenants_from_schemas(&schemas, "tenant_{tenant}", "tenant_", "") {
            assert!(schemas.contains(&namer.schema_name(&id)));
        }
    }
}
