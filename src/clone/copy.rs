//! Data copy between schemas with `INSERT .. SELECT`, in foreign-key order.
//! Anonymized columns are replaced by literals in the projection, so source
//! rows are never touched.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::{Executor, PgConnection};
use tracing::{debug, warn};

use super::ddl::TableCloneInfo;
use super::introspect::IdentityKind;
use super::topo;
use crate::db::tenant::{qualified, quote_ident, quote_literal};
use crate::error::Result;
use crate::models::clone::{CloneProgress, TableCopyResult};

/// Replacement written in place of a column's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnonValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AnonValue {
    fn sql_literal(&self) -> String {
        match self {
            AnonValue::Null => "NULL".to_string(),
            AnonValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            AnonValue::Int(n) => n.to_string(),
            AnonValue::Float(f) if f.is_finite() => format!("{f:?}"),
            AnonValue::Float(f) => format!("'{f}'::float8"),
            AnonValue::Text(s) => quote_literal(s),
        }
    }
}

impl From<&str> for AnonValue {
    fn from(value: &str) -> Self {
        AnonValue::Text(value.to_string())
    }
}

/// `table -> column -> replacement`.
pub type AnonymizationRules = HashMap<String, HashMap<String, AnonValue>>;

/// `INSERT .. SELECT` copying `table` from `source` into `target`, or `None`
/// if the table has nothing to copy. Generated columns are left to the
/// target to compute. Rules for columns the table lacks have no effect.
pub fn copy_sql(
    table: &TableCloneInfo,
    source: &str,
    target: &str,
    rules: Option<&HashMap<String, AnonValue>>,
) -> Result<Option<String>> {
    let mut columns = Vec::new();
    let mut projection = Vec::new();
    for column in table.columns.iter().filter(|c| !c.generated) {
        let name = quote_ident(&column.name)?;
        let data_type = super::ddl::rewrite_schema_refs(&column.data_type, source, target)?;
        match rules.and_then(|r| r.get(&column.name)) {
            Some(value) => projection.push(format!("{}::{data_type}", value.sql_literal())),
            // Schema-local enums and domains have no cast to their copy in
            // the target, so go through text.
            None if data_type != column.data_type => {
                projection.push(format!("{name}::text::{data_type}"))
            }
            None => projection.push(name.clone()),
        }
        columns.push(name);
    }
    if columns.is_empty() {
        return Ok(None);
    }

    let overriding = if table
        .columns
        .iter()
        .any(|c| c.identity == Some(IdentityKind::Always))
    {
        " OVERRIDING SYSTEM VALUE"
    } else {
        ""
    };

    Ok(Some(format!(
        "INSERT INTO {} ({}){overriding} SELECT {} FROM {}",
        qualified(target, &table.name)?,
        columns.join(", "),
        projection.join(", "),
        qualified(source, &table.name)?,
    )))
}

/// Statements moving each serial or identity sequence of the copied table
/// past its highest value.
pub fn sequence_sync_sql(table: &TableCloneInfo, target: &str) -> Result<Vec<String>> {
    let relation = qualified(target, &table.name)?;
    table
        .columns
        .iter()
        .filter(|c| c.has_sequence())
        .map(|c| {
            Ok(format!(
                "SELECT setval(pg_get_serial_sequence({}, {}), COALESCE(MAX({}), 0) + 1, false) FROM {relation}",
                quote_literal(&relation),
                quote_literal(&c.name),
                quote_ident(&c.name)?,
            ))
        })
        .collect()
}

async fn replication_role(conn: &mut PgConnection) -> Result<String> {
    Ok(sqlx::query_scalar("SELECT current_setting('session_replication_role')")
        .fetch_one(conn)
        .await?)
}

async fn set_replication_role(conn: &mut PgConnection, role: &str) -> Result<()> {
    conn.execute(format!("SET session_replication_role = {}", quote_literal(role)).as_str())
        .await?;
    Ok(())
}

/// Copies every table's rows, referenced tables first. Triggers are
/// suppressed for the session when the role allows it; otherwise the copy
/// proceeds with a warning. Completed tables are appended to `copied` as
/// they finish, so a failure still leaves the partial progress there.
#[allow(clippy::too_many_arguments)]
pub async fn copy_data(
    conn: &mut PgConnection,
    source: &str,
    target: &str,
    tables: &[TableCloneInfo],
    rules: &AnonymizationRules,
    on_table: &(dyn Fn(&CloneProgress) + Send + Sync),
    copied: &mut Vec<TableCopyResult>,
    warnings: &mut Vec<String>,
) -> Result<()> {
    let order = topo::copy_order(tables.iter().map(|t| (t.name.as_str(), t.depends_on.as_slice())));
    if !order.cyclic.is_empty() {
        let names: Vec<&str> = order.cyclic.iter().map(|&i| tables[i].name.as_str()).collect();
        let message = format!(
            "foreign key cycle between {}; copied in catalog order",
            names.join(", ")
        );
        warn!("Clone: {message}");
        warnings.push(message);
    }

    let previous = replication_role(conn).await?;
    let replica = match set_replication_role(conn, "replica").await {
        Ok(()) => true,
        Err(e) => {
            let message = format!("could not disable triggers during copy: {e}");
            warn!("Clone: {message}");
            warnings.push(message);
            false
        }
    };

    let outcome = copy_in_order(conn, source, target, tables, &order.order, rules, on_table, copied).await;

    if replica {
        if let Err(e) = set_replication_role(conn, &previous).await {
            warn!("Clone: failed to restore session_replication_role to {previous}: {e}");
        }
    }
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn copy_in_order(
    conn: &mut PgConnection,
    source: &str,
    target: &str,
    tables: &[TableCloneInfo],
    order: &[usize],
    rules: &AnonymizationRules,
    on_table: &(dyn Fn(&CloneProgress) + Send + Sync),
    copied: &mut Vec<TableCopyResult>,
) -> Result<()> {
    for (position, &i) in order.iter().enumerate() {
        let table = &tables[i];
        on_table(&CloneProgress {
            table: table.name.clone(),
            progress: position + 1,
            total: order.len(),
        });

        let rows = match copy_sql(table, source, target, rules.get(&table.name))? {
            Some(sql) => sqlx::query(&sql).execute(&mut *conn).await?.rows_affected(),
            None => 0,
        };
        for sql in sequence_sync_sql(table, target)? {
            sqlx::query(&sql).execute(&mut *conn).await?;
        }

        debug!("Clone: copied {rows} row(s) into {target}.{}", table.name);
        copied.push(TableCopyResult {
            table: table.name.clone(),
            rows,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clone::introspect::ColumnDef;

    fn column(name: &str, data_type: &str) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            data_type: data_type.to_string(),
            not_null: false,
            default: None,
            identity: None,
            generated: false,
        }
    }

    fn users() -> TableCloneInfo {
        let mut id = column("id", "integer");
        id.default = Some("nextval('tenant_a.users_id_seq'::regclass)".to_string());
        let mut display = column("display", "text");
        display.generated = true;
        display.default = Some("(name || email)".to_string());

        TableCloneInfo {
            name: "users".to_string(),
            create_ddl: String::new(),
            constraint_ddls: Vec::new(),
            foreign_key_ddls: Vec::new(),
            index_ddls: Vec::new(),
            row_count: 3,
            depends_on: Vec::new(),
            columns: vec![
                id,
                column("name", "character varying(64)"),
                column("email", "text"),
                column("age", "integer"),
                display,
            ],
        }
    }

    #[test]
    fn test_plain_copy_skips_generated_columns() {
        let sql = copy_sql(&users(), "tenant_a", "tenant_b", None).unwrap().unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"tenant_b\".\"users\" (\"id\", \"name\", \"email\", \"age\") \
             SELECT \"id\", \"name\", \"email\", \"age\" FROM \"tenant_a\".\"users\""
        );
    }

    #[test]
    fn test_anonymized_projection() {
        let rules: HashMap<String, AnonValue> = [
            ("email".to_string(), AnonValue::from("redacted@example.com")),
            ("age".to_string(), AnonValue::Null),
            ("name".to_string(), AnonValue::from("o'brien")),
            ("no_such_column".to_string(), AnonValue::Int(1)),
        ]
        .into_iter()
        .collect();

        let sql = copy_sql(&users(), "tenant_a", "tenant_b", Some(&rules)).unwrap().unwrap();
        assert!(sql.contains(
            "SELECT \"id\", 'o''brien'::character varying(64), 'redacted@example.com'::text, NULL::integer FROM"
        ));
        assert!(!sql.contains("no_such_column"));
    }

    #[test]
    fn test_schema_local_types_cast_through_text() {
        let mut table = users();
        table.columns.push(column("status", "tenant_a.status"));
        table.columns.push(column("tags", "\"tenant_a\".tag[]"));
        table.columns.push(column("score", "tenant_a.positive_int"));

        let sql = copy_sql(&table, "tenant_a", "tenant_b", None).unwrap().unwrap();
        assert!(sql.contains(
            "\"age\", \"status\"::text::\"tenant_b\".status, \"tags\"::text::\"tenant_b\".tag[], \
             \"score\"::text::\"tenant_b\".positive_int FROM \"tenant_a\".\"users\""
        ));
    }

    #[test]
    fn test_identity_always_overrides_system_value() {
        let mut table = users();
        table.columns[0].default = None;
        table.columns[0].identity = Some(IdentityKind::Always);
        let sql = copy_sql(&table, "a", "b", None).unwrap().unwrap();
        assert!(sql.contains(") OVERRIDING SYSTEM VALUE SELECT "));
    }

    #[test]
    fn test_sequence_sync() {
        let statements = sequence_sync_sql(&users(), "tenant_b").unwrap();
        assert_eq!(
            statements,
            vec!["SELECT setval(pg_get_serial_sequence('\"tenant_b\".\"users\"', 'id'), \
                  COALESCE(MAX(\"id\"), 0) + 1, false) FROM \"tenant_b\".\"users\""]
        );
    }

    #[test]
    fn test_anon_literals() {
        assert_eq!(AnonValue::Bool(true).sql_literal(), "TRUE");
        assert_eq!(AnonValue::Int(-4).sql_literal(), "-4");
        assert_eq!(AnonValue::Float(1.5).sql_literal(), "1.5");
        assert_eq!(AnonValue::Float(f64::NAN).sql_literal(), "'NaN'::float8");
    }

    #[test]
    fn test_anon_values_from_json() {
        let rules: AnonymizationRules = serde_json::from_str(
            r#"{"users": {"email": "x@example.com", "age": 0, "vip": false, "phone": null}}"#,
        )
        .unwrap();
        let users = &rules["users"];
        assert_eq!(users["email"], AnonValue::from("x@example.com"));
        assert_eq!(users["age"], AnonValue::Int(0));
        assert_eq!(users["vip"], AnonValue::Bool(false));
        assert_eq!(users["phone"], AnonValue::Null);
    }
}
