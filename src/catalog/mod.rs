//! Reflection of the source database.
//!
//! pg_catalog is the sole source of truth for columns, primary keys, and
//! foreign keys; nothing here is re-derived from the schema document.

use anyhow::Result;
use sqlx::PgPool;

pub mod foreign_key;
pub mod table;

pub use foreign_key::ForeignKey;
pub use table::{Column, PrimaryKey, Table};

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub schemas: Vec<String>,
    pub tables: Vec<Table>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl Catalog {
    pub async fn load(pool: &PgPool) -> Result<Self> {
        // One connection for all fetches so every query sees the same
        // snapshot of the catalogs.
        let mut conn = pool.acquire().await?;

        let schemas = fetch_schemas(&mut conn).await?;
        let tables = table::fetch(&mut conn).await?;
        let foreign_keys = foreign_key::fetch(&mut conn).await?;

        Ok(Self {
            schemas,
            tables,
            foreign_keys,
        })
    }

    pub fn has_schema(&self, name: &str) -> bool {
        self.schemas.iter().any(|s| s == name)
    }

    pub fn table(&self, schema: &str, name: &str) -> Option<&Table> {
        self.tables
            .iter()
            .find(|t| t.schema == schema && t.name == name)
    }

    /// Foreign keys connecting two tables, in either direction.
    pub fn foreign_keys_between(&self, a: (&str, &str), b: (&str, &str)) -> Vec<&ForeignKey> {
        self.foreign_keys
            .iter()
            .filter(|fk| {
                (fk.constrained() == a && fk.referenced() == b)
                    || (fk.constrained() == b && fk.referenced() == a)
            })
            .collect()
    }
}

async fn fetch_schemas(conn: &mut sqlx::PgConnection) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT nspname
        FROM pg_namespace
        WHERE nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
          AND nspname NOT LIKE 'pg_temp_%'
          AND nspname NOT LIKE 'pg_toast_temp_%'
        ORDER BY nspname
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().map(|(name,)| name).collect())
}
