//! Fetch foreign keys from pg_catalog.

use anyhow::Result;
use sqlx::postgres::PgConnection;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub name: String,
    /// Table carrying the constraint.
    pub schema: String,
    pub table: String,
    pub columns: Vec<String>,
    pub referenced_schema: String,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

impl ForeignKey {
    pub fn constrained(&self) -> (&str, &str) {
        (&self.schema, &self.table)
    }

    pub fn referenced(&self) -> (&str, &str) {
        (&self.referenced_schema, &self.referenced_table)
    }
}

pub async fn fetch(conn: &mut PgConnection) -> Result<Vec<ForeignKey>> {
    debug!("reflecting foreign keys");
    let rows: Vec<(
        String,
        String,
        String,
        Vec<String>,
        String,
        String,
        Vec<String>,
    )> = sqlx::query_as(
        r#"
        SELECT
            c.conname,
            n.nspname,
            cl.relname,
            ARRAY(
                SELECT a.attname
                FROM pg_attribute a
                WHERE a.attrelid = c.conrelid
                  AND a.attnum = ANY(c.conkey)
                ORDER BY array_position(c.conkey, a.attnum)
            ),
            fn.nspname,
            fcl.relname,
            ARRAY(
                SELECT a.attname
                FROM pg_attribute a
                WHERE a.attrelid = c.confrelid
                  AND a.attnum = ANY(c.confkey)
                ORDER BY array_position(c.confkey, a.attnum)
            )
        FROM pg_constraint c
        JOIN pg_class cl ON c.conrelid = cl.oid
        JOIN pg_namespace n ON cl.relnamespace = n.oid
        JOIN pg_class fcl ON c.confrelid = fcl.oid
        JOIN pg_namespace fn ON fcl.relnamespace = fn.oid
        WHERE c.contype = 'f'
          AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
        ORDER BY n.nspname, cl.relname, c.conname
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(
            |(name, schema, table, columns, referenced_schema, referenced_table, referenced_columns)| {
                ForeignKey {
                    name,
                    schema,
                    table,
                    columns,
                    referenced_schema,
                    referenced_table,
                    referenced_columns,
                }
            },
        )
        .collect())
}

#[cfg(test)]
pub(crate) fn fixture(
    name: &str,
    constrained: (&str, &str),
    columns: &[&str],
    referenced: (&str, &str),
    referenced_columns: &[&str],
) -> ForeignKey {
    ForeignKey {
        name: name.to_string(),
        schema: constrained.0.to_string(),
        table: constrained.1.to_string(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
        referenced_schema: referenced.0.to_string(),
        referenced_table: referenced.1.to_string(),
        referenced_columns: referenced_columns.iter().map(|c| c.to_string()).collect(),
    }
}
