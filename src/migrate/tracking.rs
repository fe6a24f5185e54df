//! Tracking-table formats: how a schema records which migrations ran.
//!
//! | preset       | identifier | timestamp                           |
//! |--------------|------------|-------------------------------------|
//! | `name`       | `name`     | `applied_at TIMESTAMPTZ DEFAULT NOW()` |
//! | `hash`       | `hash`     | `created_at TIMESTAMPTZ DEFAULT NOW()` |
//! | `epoch-hash` | `hash`     | `created_at BIGINT` (epoch millis)  |

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::Serialize;
use sqlx::PgConnection;

use super::files::MigrationFile;
use crate::db::tenant::{qualified, quote_ident};
use crate::error::{Error, Result};
use crate::models::migration::AppliedMigrationRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierColumn {
    Name,
    Hash,
}

impl IdentifierColumn {
    fn column(self) -> &'static str {
        match self {
            IdentifierColumn::Name => "name",
            IdentifierColumn::Hash => "hash",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampEncoding {
    Timestamptz,
    EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackingFormat {
    pub table: String,
    pub identifier: IdentifierColumn,
    pub timestamp_column: String,
    pub timestamp_encoding: TimestampEncoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingPreset {
    #[default]
    NameBased,
    HashBased,
    EpochHash,
}

impl TrackingPreset {
    pub fn format(self, table: &str) -> TrackingFormat {
        let (identifier, timestamp_column, timestamp_encoding) = match self {
            TrackingPreset::NameBased => (IdentifierColumn::Name, "applied_at", TimestampEncoding::Timestamptz),
            TrackingPreset::HashBased => (IdentifierColumn::Hash, "created_at", TimestampEncoding::Timestamptz),
            TrackingPreset::EpochHash => (IdentifierColumn::Hash, "created_at", TimestampEncoding::EpochMillis),
        };
        TrackingFormat {
            table: table.to_string(),
            identifier,
            timestamp_column: timestamp_column.to_string(),
            timestamp_encoding,
        }
    }
}

impl FromStr for TrackingPreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "name" => Ok(TrackingPreset::NameBased),
            "hash" => Ok(TrackingPreset::HashBased),
            "epoch-hash" => Ok(TrackingPreset::EpochHash),
            other => Err(Error::Config(format!("unknown tracking format {other:?}"))),
        }
    }
}

impl fmt::Display for TrackingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match (self.identifier, self.timestamp_encoding) {
            (IdentifierColumn::Name, TimestampEncoding::Timestamptz) => "name",
            (IdentifierColumn::Name, TimestampEncoding::EpochMillis) => "epoch-name",
            (IdentifierColumn::Hash, TimestampEncoding::Timestamptz) => "hash",
            (IdentifierColumn::Hash, TimestampEncoding::EpochMillis) => "epoch-hash",
        };
        write!(f, "{label} ({})", self.table)
    }
}

const TIMESTAMP_CANDIDATES: &[&str] = &["applied_at", "created_at", "migrated_at"];

/// Infers the format of an existing tracking table from its
/// `(column_name, data_type)` pairs. `Ok(None)` when the table has no
/// columns, i.e. does not exist.
pub fn infer_format(table: &str, columns: &[(String, String)]) -> Result<Option<TrackingFormat>> {
    if columns.is_empty() {
        return Ok(None);
    }
    let find = |name: &str| columns.iter().find(|(c, _)| c == name);
    let unrecognized = |what: &str| {
        Error::Config(format!("tracking table {table} has no recognizable {what} column"))
    };

    let identifier = if find("name").is_some() {
        IdentifierColumn::Name
    } else if find("hash").is_some() {
        IdentifierColumn::Hash
    } else {
        return Err(unrecognized("identifier"));
    };

    let (timestamp_column, data_type) = TIMESTAMP_CANDIDATES
        .iter()
        .find_map(|c| find(*c))
        .ok_or_else(|| unrecognized("timestamp"))?;

    let timestamp_encoding = match data_type.as_str() {
        "bigint" | "integer" | "numeric" => TimestampEncoding::EpochMillis,
        _ => TimestampEncoding::Timestamptz,
    };

    Ok(Some(TrackingFormat {
        table: table.to_string(),
        identifier,
        timestamp_column: timestamp_column.clone(),
        timestamp_encoding,
    }))
}

pub async fn probe_columns(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
) -> Result<Vec<(String, String)>> {
    let columns = sqlx::query_as(
        "SELECT column_name::TEXT, data_type::TEXT
         FROM information_schema.columns
         WHERE table_schema = $1 AND table_name = $2
         ORDER BY ordinal_position",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(conn)
    .await?;
    Ok(columns)
}

impl TrackingFormat {
    pub fn create_table_sql(&self, schema: &str) -> Result<String> {
        let identifier = match self.identifier {
            IdentifierColumn::Name => "name VARCHAR(255) NOT NULL UNIQUE",
            IdentifierColumn::Hash => "hash TEXT NOT NULL",
        };
        let timestamp = match self.timestamp_encoding {
            TimestampEncoding::Timestamptz => "TIMESTAMPTZ NOT NULL DEFAULT NOW()",
            TimestampEncoding::EpochMillis => "BIGINT",
        };
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    id SERIAL PRIMARY KEY,\n    {identifier},\n    {} {timestamp}\n)",
            qualified(schema, &self.table)?,
            quote_ident(&self.timestamp_column)?,
        ))
    }

    pub fn select_applied_sql(&self, schema: &str) -> Result<String> {
        let ts = quote_ident(&self.timestamp_column)?;
        let applied_at = match self.timestamp_encoding {
            TimestampEncoding::Timestamptz => ts,
            TimestampEncoding::EpochMillis => format!("to_timestamp({ts} / 1000.0)"),
        };
        Ok(format!(
            "SELECT id::BIGINT, {}::TEXT, {applied_at} FROM {} ORDER BY id",
            self.identifier.column(),
            qualified(schema, &self.table)?,
        ))
    }

    /// Insert statement taking the identifier as `$1` and, for epoch
    /// formats, the timestamp in millis as `$2`.
    pub fn insert_sql(&self, schema: &str) -> Result<String> {
        let table = qualified(schema, &self.table)?;
        let identifier = self.identifier.column();
        Ok(match self.timestamp_encoding {
            TimestampEncoding::Timestamptz => {
                format!("INSERT INTO {table} ({identifier}) VALUES ($1)")
            }
            TimestampEncoding::EpochMillis => format!(
                "INSERT INTO {table} ({identifier}, {}) VALUES ($1, $2)",
                quote_ident(&self.timestamp_column)?
            ),
        })
    }

    pub fn identifier_of<'a>(&self, file: &'a MigrationFile) -> &'a str {
        match self.identifier {
            IdentifierColumn::Name => &file.name,
            IdentifierColumn::Hash => &file.hash,
        }
    }

    pub async fn read_applied(
        &self,
        conn: &mut PgConnection,
        schema: &str,
    ) -> Result<Vec<AppliedMigrationRecord>> {
        let rows: Vec<(i64, String, Option<chrono::DateTime<Utc>>)> =
            sqlx::query_as(&self.select_applied_sql(schema)?)
                .fetch_all(conn)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, identifier, applied_at)| AppliedMigrationRecord {
                id,
                identifier,
                applied_at,
            })
            .collect())
    }

    pub async fn record(
        &self,
        conn: &mut PgConnection,
        schema: &str,
        file: &MigrationFile,
    ) -> Result<()> {
        let sql = self.insert_sql(schema)?;
        let query = sqlx::query(&sql).bind(self.identifier_of(file));
        let query = match self.timestamp_encoding {
            TimestampEncoding::Timestamptz => query,
            TimestampEncoding::EpochMillis => query.bind(Utc::now().timestamp_millis()),
        };
        query.execute(conn).await?;
        Ok(())
    }
}

/// Migrations whose identifier is not in `applied`, in file order. Hash
/// formats also accept a recorded *name*, so history written by a
/// name-based table keeps counting after a switch to hashes.
pub fn compute_pending<'a>(
    files: &'a [MigrationFile],
    applied: &[AppliedMigrationRecord],
    format: &TrackingFormat,
) -> Vec<&'a MigrationFile> {
    let recorded: HashSet<&str> = applied.iter().map(|r| r.identifier.as_str()).collect();
    files
        .iter()
        .filter(|file| {
            let by_identifier = recorded.contains(format.identifier_of(file));
            let by_name = format.identifier == IdentifierColumn::Hash
                && recorded.contains(file.name.as_str());
            !(by_identifier || by_name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files() -> Vec<MigrationFile> {
        vec![
            MigrationFile::new("0001_users.sql", "CREATE TABLE users (id INT);".into()).unwrap(),
            MigrationFile::new("0002_orders.sql", "CREATE TABLE orders (id INT);".into()).unwrap(),
            MigrationFile::new("0003_index.sql", "CREATE INDEX ON orders (id);".into()).unwrap(),
        ]
    }

    fn record(id: i64, identifier: &str) -> AppliedMigrationRecord {
        AppliedMigrationRecord {
            id,
            identifier: identifier.to_string(),
            applied_at: None,
        }
    }

    fn cols(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(c, t)| (c.to_string(), t.to_string()))
            .collect()
    }

    #[test]
    fn test_pending_by_name() {
        let files = files();
        let format = TrackingPreset::NameBased.format("__tenant_migrations");
        let applied = vec![record(1, "0001_users")];

        let pending: Vec<&str> = compute_pending(&files, &applied, &format)
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(pending, vec!["0002_orders", "0003_index"]);
    }

    #[test]
    fn test_pending_by_hash() {
        let files = files();
        let format = TrackingPreset::EpochHash.format("__tenant_migrations");
        let applied = vec![record(1, &files[0].hash), record(2, &files[1].hash)];

        let pending = compute_pending(&files, &applied, &format);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "0003_index");
    }

    #[test]
    fn test_hash_format_accepts_name_history() {
        let files = files();
        let format = TrackingPreset::HashBased.format("__tenant_migrations");
        // Written under name-based tracking
        let applied = vec![record(1, "0001_users"), record(2, "0002_orders")];

        let pending = compute_pending(&files, &applied, &format);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "0003_index");
    }

    #[test]
    fn test_name_format_ignores_hash_history() {
        let files = files();
        let format = TrackingPreset::NameBased.format("__tenant_migrations");
        let applied = vec![record(1, &files[0].hash)];

        assert_eq!(compute_pending(&files, &applied, &format).len(), 3);
    }

    #[test]
    fn test_infer_format() {
        assert_eq!(infer_format("t", &[]).unwrap(), None);

        let name = infer_format(
            "t",
            &cols(&[("id", "integer"), ("name", "character varying"), ("applied_at", "timestamp with time zone")]),
        )
        .unwrap()
        .unwrap();
        assert_eq!(name, TrackingPreset::NameBased.format("t"));

        let epoch = infer_format("t", &cols(&[("id", "integer"), ("hash", "text"), ("created_at", "bigint")]))
            .unwrap()
            .unwrap();
        assert_eq!(epoch, TrackingPreset::EpochHash.format("t"));

        let hash = infer_format(
            "t",
            &cols(&[("id", "integer"), ("hash", "text"), ("created_at", "timestamp with time zone")]),
        )
        .unwrap()
        .unwrap();
        assert_eq!(hash, TrackingPreset::HashBased.format("t"));

        assert!(infer_format("t", &cols(&[("id", "integer"), ("version", "text")])).is_err());
        assert!(infer_format("t", &cols(&[("id", "integer"), ("hash", "text")])).is_err());
    }

    #[test]
    fn test_generated_sql() {
        let epoch = TrackingPreset::EpochHash.format("__tenant_migrations");
        assert_eq!(
            epoch.insert_sql("tenant_a").unwrap(),
            "INSERT INTO \"tenant_a\".\"__tenant_migrations\" (hash, \"created_at\") VALUES ($1, $2)"
        );
        assert!(epoch
            .select_applied_sql("tenant_a")
            .unwrap()
            .contains("to_timestamp(\"created_at\" / 1000.0)"));

        let name = TrackingPreset::NameBased.format("__tenant_migrations");
        let ddl = name.create_table_sql("tenant_a").unwrap();
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"tenant_a\".\"__tenant_migrations\""));
        assert!(ddl.contains("name VARCHAR(255) NOT NULL UNIQUE"));
        assert!(ddl.contains("\"applied_at\" TIMESTAMPTZ NOT NULL DEFAULT NOW()"));
    }

    #[test]
    fn test_preset_parsing() {
        assert_eq!("name".parse::<TrackingPreset>().unwrap(), TrackingPreset::NameBased);
        assert_eq!("epoch-hash".parse::<TrackingPreset>().unwrap(), TrackingPreset::EpochHash);
        assert!("auto".parse::<TrackingPreset>().is_err());
    }
}
