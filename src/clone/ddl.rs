//! Regenerates DDL for a target schema from an introspected source table.

use serde::Serialize;

use super::introspect::{ColumnDef, ConstraintKind, EnumDef, IdentityKind, TableDef};
use crate::db::tenant::{qualified, quote_ident, quote_literal};
use crate::error::Result;

/// DDL and copy inputs for one table, split by the phase that applies them.
#[derive(Debug, Clone, Serialize)]
pub struct TableCloneInfo {
    pub name: String,
    pub create_ddl: String,
    /// Primary key, unique, check and exclusion constraints.
    pub constraint_ddls: Vec<String>,
    pub foreign_key_ddls: Vec<String>,
    pub index_ddls: Vec<String>,
    pub row_count: u64,
    /// Tables in the source schema this one references.
    pub depends_on: Vec<String>,
    pub columns: Vec<ColumnDef>,
}

/// Points every reference to `source` at `target`. Handles the quoted
/// (`"Source".x`) and, for names Postgres prints bare, the unquoted
/// (`source.x`) qualifier.
pub fn rewrite_schema_refs(text: &str, source: &str, target: &str) -> Result<String> {
    let replacement = format!("{}.", quote_ident(target)?);
    let rewritten = text.replace(&format!("{}.", quote_ident(source)?), &replacement);

    if !prints_bare(source) {
        return Ok(rewritten);
    }
    Ok(replace_unquoted(&rewritten, &format!("{source}."), &replacement))
}

/// Whether Postgres renders `ident` without quotes (keywords aside).
fn prints_bare(ident: &str) -> bool {
    let mut chars = ident.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$')
}

fn replace_unquoted(text: &str, needle: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for (at, _) in text.match_indices(needle) {
        let at_boundary = text[..at]
            .chars()
            .next_back()
            .map_or(true, |c| !(c.is_alphanumeric() || matches!(c, '_' | '$' | '"' | '.')));
        if at_boundary {
            out.push_str(&text[last..at]);
            out.push_str(replacement);
            last = at + needle.len();
        }
    }
    out.push_str(&text[last..]);
    out
}

pub fn enum_sql(def: &EnumDef, target: &str) -> Result<String> {
    let labels: Vec<String> = def.labels.iter().map(|l| quote_literal(l)).collect();
    Ok(format!(
        "CREATE TYPE {} AS ENUM ({})",
        qualified(target, &def.name)?,
        labels.join(", ")
    ))
}

fn column_sql(column: &ColumnDef, source: &str, target: &str) -> Result<String> {
    let name = quote_ident(&column.name)?;
    if let Some(serial) = column.serial_type() {
        return Ok(format!("{name} {serial} NOT NULL"));
    }

    let mut sql = format!("{name} {}", rewrite_schema_refs(&column.data_type, source, target)?);
    match (column.identity, column.default.as_deref()) {
        (Some(IdentityKind::Always), _) => sql.push_str(" GENERATED ALWAYS AS IDENTITY"),
        (Some(IdentityKind::ByDefault), _) => sql.push_str(" GENERATED BY DEFAULT AS IDENTITY"),
        (None, Some(expr)) => {
            let expr = rewrite_schema_refs(expr, source, target)?;
            if column.generated {
                sql.push_str(&format!(" GENERATED ALWAYS AS ({expr}) STORED"));
            } else {
                sql.push_str(&format!(" DEFAULT {expr}"));
            }
        }
        (None, None) => {}
    }
    if column.not_null {
        sql.push_str(" NOT NULL");
    }
    Ok(sql)
}

/// Builds the target DDL for `def`, moving it from `source` to `target`.
pub fn plan_table(def: &TableDef, source: &str, target: &str) -> Result<TableCloneInfo> {
    let table = qualified(target, &def.name)?;

    let columns = def
        .columns
        .iter()
        .map(|c| column_sql(c, source, target).map(|sql| format!("    {sql}")))
        .collect::<Result<Vec<_>>>()?;
    let create_ddl = format!("CREATE TABLE {table} (\n{}\n)", columns.join(",\n"));

    let mut constraint_ddls = Vec::new();
    let mut foreign_key_ddls = Vec::new();
    let mut depends_on = Vec::new();
    for constraint in &def.constraints {
        let sql = format!(
            "ALTER TABLE {table} ADD CONSTRAINT {} {}",
            quote_ident(&constraint.name)?,
            rewrite_schema_refs(&constraint.definition, source, target)?
        );
        if constraint.kind == ConstraintKind::ForeignKey {
            foreign_key_ddls.push(sql);
            if let Some((schema, referenced)) = &constraint.references {
                if schema == source && referenced != &def.name && !depends_on.contains(referenced) {
                    depends_on.push(referenced.clone());
                }
            }
        } else {
            constraint_ddls.push(sql);
        }
    }

    let index_ddls = def
        .indexes
        .iter()
        .map(|sql| rewrite_schema_refs(sql, source, target))
        .collect::<Result<Vec<_>>>()?;

    Ok(TableCloneInfo {
        name: def.name.clone(),
        create_ddl,
        constraint_ddls,
        foreign_key_ddls,
        index_ddls,
        row_count: def.row_count,
        depends_on,
        columns: def.columns.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clone::introspect::ConstraintDef;

    fn column(name: &str, data_type: &str, not_null: bool, default: Option<&str>) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            data_type: data_type.to_string(),
            not_null,
            default: default.map(str::to_string),
            identity: None,
            generated: false,
        }
    }

    #[test]
    fn test_rewrite_schema_refs() {
        assert_eq!(
            rewrite_schema_refs("REFERENCES tenant_a.users(id)", "tenant_a", "tenant_b").unwrap(),
            "REFERENCES \"tenant_b\".users(id)"
        );
        assert_eq!(
            rewrite_schema_refs("\"Tenant-A\".mood", "Tenant-A", "copy").unwrap(),
            "\"copy\".mood"
        );
        // Only whole qualifiers are rewritten
        assert_eq!(
            rewrite_schema_refs("old_tenant_a.users, xtenant_a.x", "tenant_a", "b").unwrap(),
            "old_tenant_a.users, xtenant_a.x"
        );
        assert_eq!(
            rewrite_schema_refs("CREATE INDEX i ON tenant_a.orders USING btree (user_id)", "tenant_a", "t2")
                .unwrap(),
            "CREATE INDEX i ON \"t2\".orders USING btree (user_id)"
        );
    }

    #[test]
    fn test_enum_sql_escapes_labels() {
        let def = EnumDef {
            name: "mood".to_string(),
            labels: vec!["ok".to_string(), "it's bad".to_string()],
        };
        assert_eq!(
            enum_sql(&def, "tenant_b").unwrap(),
            "CREATE TYPE \"tenant_b\".\"mood\" AS ENUM ('ok', 'it''s bad')"
        );
    }

    #[test]
    fn test_column_variants() {
        let serial = column("id", "integer", true, Some("nextval('tenant_a.users_id_seq'::regclass)"));
        assert_eq!(column_sql(&serial, "tenant_a", "t").unwrap(), "\"id\" SERIAL NOT NULL");

        let typed = column("mood", "tenant_a.mood", false, Some("'ok'::tenant_a.mood"));
        assert_eq!(
            column_sql(&typed, "tenant_a", "t").unwrap(),
            "\"mood\" \"t\".mood DEFAULT 'ok'::\"t\".mood"
        );

        let mut identity = column("id", "bigint", true, None);
        identity.identity = Some(IdentityKind::Always);
        assert_eq!(
            column_sql(&identity, "tenant_a", "t").unwrap(),
            "\"id\" bigint GENERATED ALWAYS AS IDENTITY NOT NULL"
        );

        let mut generated = column("total", "numeric", false, Some("(price * qty)"));
        generated.generated = true;
        assert_eq!(
            column_sql(&generated, "tenant_a", "t").unwrap(),
            "\"total\" numeric GENERATED ALWAYS AS ((price * qty)) STORED"
        );
    }

    #[test]
    fn test_plan_orders_table() {
        let def = TableDef {
            name: "orders".to_string(),
            columns: vec![
                column("id", "integer", true, Some("nextval('tenant_a.orders_id_seq'::regclass)")),
                column("user_id", "integer", true, None),
                column("total", "numeric(10,2)", false, None),
            ],
            constraints: vec![
                ConstraintDef {
                    name: "orders_pkey".to_string(),
                    kind: ConstraintKind::PrimaryKey,
                    definition: "PRIMARY KEY (id)".to_string(),
                    references: None,
                },
                ConstraintDef {
                    name: "orders_user_id_fkey".to_string(),
                    kind: ConstraintKind::ForeignKey,
                    definition: "FOREIGN KEY (user_id) REFERENCES tenant_a.users(id) ON DELETE CASCADE"
                        .to_string(),
                    references: Some(("tenant_a".to_string(), "users".to_string())),
                },
                ConstraintDef {
                    name: "orders_audit_fkey".to_string(),
                    kind: ConstraintKind::ForeignKey,
                    definition: "FOREIGN KEY (id) REFERENCES public.audit(id)".to_string(),
                    references: Some(("public".to_string(), "audit".to_string())),
                },
            ],
            indexes: vec!["CREATE INDEX orders_user_idx ON tenant_a.orders USING btree (user_id)".to_string()],
            row_count: 7,
        };

        let plan = plan_table(&def, "tenant_a", "tenant_b").unwrap();
        assert_eq!(
            plan.create_ddl,
            "CREATE TABLE \"tenant_b\".\"orders\" (\n    \"id\" SERIAL NOT NULL,\n    \"user_id\" integer NOT NULL,\n    \"total\" numeric(10,2)\n)"
        );
        assert_eq!(
            plan.constraint_ddls,
            vec!["ALTER TABLE \"tenant_b\".\"orders\" ADD CONSTRAINT \"orders_pkey\" PRIMARY KEY (id)"]
        );
        assert_eq!(plan.foreign_key_ddls.len(), 2);
        assert!(plan.foreign_key_ddls[0].contains("REFERENCES \"tenant_b\".users(id) ON DELETE CASCADE"));
        assert!(plan.foreign_key_ddls[1].contains("REFERENCES public.audit(id)"));
        assert_eq!(plan.depends_on, vec!["users"]);
        assert_eq!(
            plan.index_ddls,
            vec!["CREATE INDEX orders_user_idx ON \"tenant_b\".orders USING btree (user_id)"]
        );
        assert_eq!(plan.row_count, 7);
    }
}
