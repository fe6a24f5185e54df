//! Catalog queries describing one schema. Everything is read from
//! `pg_catalog` and rendered by the server (`format_type`, `pg_get_expr`,
//! `pg_get_constraintdef`, `pg_get_indexdef`), so the text stays faithful to
//! the source. Names outside the session `search_path` come back
//! schema-qualified, which is what lets [`super::ddl`] retarget them.

use serde::Serialize;
use sqlx::PgConnection;
use tracing::debug;

use crate::db::tenant::qualified;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Always,
    ByDefault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: String,
    /// `format_type` output, e.g. `character varying(255)`.
    pub data_type: String,
    pub not_null: bool,
    /// Default expression, or the generation expression when `generated`.
    pub default: Option<String>,
    pub identity: Option<IdentityKind>,
    pub generated: bool,
}

impl ColumnDef {
    /// `SERIAL`-family type for integer columns fed by a sequence default.
    pub fn serial_type(&self) -> Option<&'static str> {
        if self.identity.is_some() || self.generated {
            return None;
        }
        if !self.default.as_deref()?.starts_with("nextval(") {
            return None;
        }
        match self.data_type.as_str() {
            "smallint" => Some("SMALLSERIAL"),
            "integer" => Some("SERIAL"),
            "bigint" => Some("BIGSERIAL"),
            _ => None,
        }
    }

    /// Backed by a sequence that must be resynchronised after a copy.
    pub fn has_sequence(&self) -> bool {
        self.identity.is_some() || self.serial_type().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    Check,
    Exclusion,
    ForeignKey,
}

impl ConstraintKind {
    fn from_contype(contype: &str) -> Option<Self> {
        match contype {
            "p" => Some(ConstraintKind::PrimaryKey),
            "u" => Some(ConstraintKind::Unique),
            "c" => Some(ConstraintKind::Check),
            "x" => Some(ConstraintKind::Exclusion),
            "f" => Some(ConstraintKind::ForeignKey),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConstraintDef {
    pub name: String,
    pub kind: ConstraintKind,
    /// `pg_get_constraintdef` output. Composite keys and referential
    /// actions are part of it.
    pub definition: String,
    /// `(schema, table)` referenced by a foreign key.
    pub references: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub constraints: Vec<ConstraintDef>,
    /// `CREATE INDEX` statements for indexes not backing a constraint.
    pub indexes: Vec<String>,
    pub row_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumDef {
    pub name: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaDef {
    pub enums: Vec<EnumDef>,
    pub tables: Vec<TableDef>,
}

/// Describes every ordinary table in `schema` except those in `exclude`.
pub async fn introspect_schema(
    conn: &mut PgConnection,
    schema: &str,
    exclude: &[String],
) -> Result<SchemaDef> {
    let enums = list_enums(conn, schema).await?;
    let mut tables = Vec::new();

    for name in list_tables(conn, schema).await? {
        if exclude.iter().any(|e| e == &name) {
            debug!("Clone: skipping excluded table {schema}.{name}");
            continue;
        }
        tables.push(describe_table(conn, schema, name).await?);
    }

    debug!(
        "Clone: introspected {schema}: {} table(s), {} enum type(s)",
        tables.len(),
        enums.len()
    );
    Ok(SchemaDef { enums, tables })
}

async fn list_tables(conn: &mut PgConnection, schema: &str) -> Result<Vec<String>> {
    let tables = sqlx::query_scalar(
        "SELECT c.relname::TEXT
         FROM pg_class c
         JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE n.nspname = $1 AND c.relkind = 'r' AND NOT c.relispartition
         ORDER BY c.relname",
    )
    .bind(schema)
    .fetch_all(conn)
    .await?;
    Ok(tables)
}

async fn list_enums(conn: &mut PgConnection, schema: &str) -> Result<Vec<EnumDef>> {
    let rows: Vec<(String, Vec<String>)> = sqlx::query_as(
        "SELECT t.typname::TEXT, array_agg(e.enumlabel::TEXT ORDER BY e.enumsortorder)
         FROM pg_type t
         JOIN pg_namespace n ON n.oid = t.typnamespace
         JOIN pg_enum e ON e.enumtypid = t.oid
         WHERE n.nspname = $1
         GROUP BY t.typname
         ORDER BY t.typname",
    )
    .bind(schema)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(name, labels)| EnumDef { name, labels })
        .collect())
}

async fn describe_table(conn: &mut PgConnection, schema: &str, name: String) -> Result<TableDef> {
    let columns = list_columns(&mut *conn, schema, &name).await?;
    let constraints = list_constraints(&mut *conn, schema, &name).await?;
    let indexes = list_indexes(&mut *conn, schema, &name).await?;

    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", qualified(schema, &name)?))
        .fetch_one(conn)
        .await?;

    Ok(TableDef {
        name,
        columns,
        constraints,
        indexes,
        row_count: u64::try_from(count).unwrap_or(0),
    })
}

type ColumnRow = (String, String, bool, Option<String>, String, String);

async fn list_columns(conn: &mut PgConnection, schema: &str, table: &str) -> Result<Vec<ColumnDef>> {
    let rows: Vec<ColumnRow> = sqlx::query_as(
        "SELECT a.attname::TEXT,
                format_type(a.atttypid, a.atttypmod),
                a.attnotnull,
                pg_get_expr(d.adbin, d.adrelid),
                a.attidentity::TEXT,
                a.attgenerated::TEXT
         FROM pg_attribute a
         JOIN pg_class c ON c.oid = a.attrelid
         JOIN pg_namespace n ON n.oid = c.relnamespace
         LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
         WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped
         ORDER BY a.attnum",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(name, data_type, not_null, default, identity, generated)| ColumnDef {
            name,
            data_type,
            not_null,
            default,
            identity: match identity.as_str() {
                "a" => Some(IdentityKind::Always),
                "d" => Some(IdentityKind::ByDefault),
                _ => None,
            },
            generated: generated == "s",
        })
        .collect())
}

type ConstraintRow = (String, String, String, Option<String>, Option<String>);

async fn list_constraints(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
) -> Result<Vec<ConstraintDef>> {
    let rows: Vec<ConstraintRow> = sqlx::query_as(
        "SELECT con.conname::TEXT,
                con.contype::TEXT,
                pg_get_constraintdef(con.oid),
                fn.nspname::TEXT,
                fc.relname::TEXT
         FROM pg_constraint con
         JOIN pg_class c ON c.oid = con.conrelid
         JOIN pg_namespace n ON n.oid = c.relnamespace
         LEFT JOIN pg_class fc ON fc.oid = con.confrelid
         LEFT JOIN pg_namespace fn ON fn.oid = fc.relnamespace
         WHERE n.nspname = $1 AND c.relname = $2
           AND con.contype IN ('p', 'u', 'c', 'x', 'f')
         ORDER BY con.contype, con.conname",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(name, contype, definition, foreign_schema, foreign_table)| {
            Some(ConstraintDef {
                name,
                kind: ConstraintKind::from_contype(&contype)?,
                definition,
                references: foreign_schema.zip(foreign_table),
            })
        })
        .collect())
}

async fn list_indexes(conn: &mut PgConnection, schema: &str, table: &str) -> Result<Vec<String>> {
    let indexes = sqlx::query_scalar(
        "SELECT pg_get_indexdef(i.indexrelid)
         FROM pg_index i
         JOIN pg_class c ON c.oid = i.indrelid
         JOIN pg_namespace n ON n.oid = c.relnamespace
         JOIN pg_class ic ON ic.oid = i.indexrelid
         WHERE n.nspname = $1 AND c.relname = $2
           AND NOT EXISTS (
             SELECT 1 FROM pg_constraint con
             WHERE con.conindid = i.indexrelid AND con.contype IN ('p', 'u', 'x')
           )
         ORDER BY ic.relname",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(conn)
    .await?;
    Ok(indexes)
}
