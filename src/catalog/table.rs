//! Fetch tables, columns, and primary keys from pg_catalog.

use std::collections::BTreeMap;

use anyhow::Result;
use sqlx::postgres::PgConnection;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    /// Attribute number; orders columns the way the table declares them.
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKey {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub schema: String,
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Option<PrimaryKey>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Primary-key column names in declaration order; empty when the table
    /// has no primary key.
    pub fn primary_key_columns(&self) -> Vec<String> {
        self.primary_key
            .as_ref()
            .map(|pk| pk.columns.clone())
            .unwrap_or_default()
    }
}

async fn fetch_all_tables(conn: &mut PgConnection) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT n.nspname, c.relname
        FROM pg_class c
        JOIN pg_namespace n ON c.relnamespace = n.oid
        WHERE c.relkind = 'r'
          AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
        ORDER BY n.nspname, c.relname
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows)
}

async fn fetch_table_columns(
    conn: &mut PgConnection,
) -> Result<Vec<(String, String, String, String, bool, i32)>> {
    let rows: Vec<(String, String, String, String, bool, i32)> = sqlx::query_as(
        r#"
        SELECT
          n.nspname,
          c.relname,
          a.attname,
          pg_catalog.format_type(a.atttypid, a.atttypmod),
          a.attnotnull,
          a.attnum::int
        FROM pg_attribute a
        JOIN pg_class c ON a.attrelid = c.oid
        JOIN pg_namespace n ON c.relnamespace = n.oid
        WHERE a.attnum > 0
          AND NOT a.attisdropped
          AND c.relkind = 'r'
          AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
        ORDER BY n.nspname, c.relname, a.attnum
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows)
}

async fn fetch_primary_keys(
    conn: &mut PgConnection,
) -> Result<Vec<(String, String, String, Vec<String>)>> {
    let rows: Vec<(String, String, String, Vec<String>)> = sqlx::query_as(
        r#"
        SELECT
            n.nspname,
            cl.relname,
            c.conname,
            ARRAY(
                SELECT a.attname
                FROM pg_attribute a
                WHERE a.attrelid = c.conrelid
                  AND a.attnum = ANY(c.conkey)
                ORDER BY array_position(c.conkey, a.attnum)
            )
        FROM pg_constraint c
        JOIN pg_class cl ON c.conrelid = cl.oid
        JOIN pg_namespace n ON cl.relnamespace = n.oid
        WHERE c.contype = 'p'
          AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows)
}

pub async fn fetch(conn: &mut PgConnection) -> Result<Vec<Table>> {
    debug!("reflecting tables");
    let all_tables = fetch_all_tables(&mut *conn).await?;
    let column_rows = fetch_table_columns(&mut *conn).await?;
    let pk_rows = fetch_primary_keys(&mut *conn).await?;

    let mut index: BTreeMap<(String, String), usize> = BTreeMap::new();
    let mut tables = Vec::new();
    for (schema, name) in all_tables {
        index.insert((schema.clone(), name.clone()), tables.len());
        tables.push(Table {
            schema,
            name,
            columns: Vec::new(),
            primary_key: None,
        });
    }

    for (schema, table, name, data_type, not_null, position) in column_rows {
        if let Some(&idx) = index.get(&(schema, table)) {
            tables[idx].columns.push(Column {
                name,
                data_type,
                not_null,
                position,
            });
        }
    }

    for (schema, table, name, columns) in pk_rows {
        if let Some(&idx) = index.get(&(schema, table)) {
            tables[idx].primary_key = Some(PrimaryKey { name, columns });
        }
    }

    Ok(tables)
}

#[cfg(test)]
pub(crate) fn fixture(
    schema: &str,
    name: &str,
    columns: &[(&str, &str)],
    pk: Option<(&str, &[&str])>,
) -> Table {
    Table {
        schema: schema.to_string(),
        name: name.to_string(),
        columns: columns
            .iter()
            .enumerate()
            .map(|(i, (col, data_type))| Column {
                name: col.to_string(),
                data_type: data_type.to_string(),
                not_null: false,
                position: i as i32 + 1,
            })
            .collect(),
        primary_key: pk.map(|(pk_name, cols)| PrimaryKey {
            name: pk_name.to_string(),
            columns: cols.iter().map(|c| c.to_string()).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_lookup() {
        let table = fixture(
            "public",
            "book",
            &[("isbn", "character varying"), ("title", "text")],
            Some(("book_pkey", &["isbn"])),
        );
        assert!(table.column("isbn").is_some());
        assert!(table.column("missing").is_none());
        assert_eq!(table.primary_key_columns(), vec!["isbn"]);
    }

    #[test]
    fn test_columns_keep_declaration_order() {
        let table = fixture(
            "public",
            "book_author",
            &[("id", "integer"), ("book_isbn", "text"), ("author_id", "integer")],
            Some(("book_author_pkey", &["id"])),
        );
        assert_eq!(
            table.column_names(),
            vec!["id", "book_isbn", "author_id"]
        );
    }
}
