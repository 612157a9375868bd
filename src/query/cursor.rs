//! Server-side cursor over the document query.
//!
//! Pivot tables can be arbitrarily large, so results stream through a
//! `DECLARE … FETCH FORWARD n` loop inside one transaction rather than
//! being buffered client-side.

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Row, Transaction};

use crate::query::PivotKey;

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRow {
    pub key: PivotKey,
    pub document: JsonValue,
    pub txid: i64,
}

pub struct DocumentCursor {
    tx: Transaction<'static, Postgres>,
    fetch_size: usize,
    exhausted: bool,
}

const CURSOR_NAME: &str = "pgriver_documents";

impl DocumentCursor {
    pub async fn open(pool: &PgPool, sql: &str, fetch_size: usize) -> Result<Self> {
        let mut tx = pool.begin().await?;
        sqlx::query(&format!("DECLARE {CURSOR_NAME} NO SCROLL CURSOR FOR {sql}"))
            .execute(&mut *tx)
            .await
            .context("declaring document cursor")?;
        Ok(Self {
            tx,
            fetch_size: fetch_size.max(1),
            exhausted: false,
        })
    }

    /// Next batch of documents; empty when the cursor is drained.
    pub async fn next_batch(&mut self) -> Result<Vec<DocumentRow>> {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            "FETCH FORWARD {} FROM {CURSOR_NAME}",
            self.fetch_size
        ))
        .fetch_all(&mut *self.tx)
        .await
        .context("fetching from document cursor")?;

        if rows.len() < self.fetch_size {
            self.exhausted = true;
        }

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let key: JsonValue = row.try_get("key")?;
            let document: JsonValue = row.try_get("document")?;
            let txid: i64 = row.try_get("txid")?;
            let key = key
                .as_array()
                .cloned()
                .context("pivot key is always a jsonb array")?;
            documents.push(DocumentRow {
                key,
                document,
                txid,
            });
        }
        Ok(documents)
    }

    pub async fn close(mut self) -> Result<()> {
        sqlx::query(&format!("CLOSE {CURSOR_NAME}"))
            .execute(&mut *self.tx)
            .await?;
        self.tx.commit().await?;
        Ok(())
    }
}
