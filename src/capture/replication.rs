//! Replication-slot reader worker.
//!
//! Polls the logical decoding slot, normalizes WAL rows into change
//! events, and appends them to the queue. Rows are only consumed from the
//! slot (`pg_logical_slot_get_changes`) after the engine's checkpoint has
//! passed the batch, so a crash between peek and index replays the batch.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::capture::event::{ChangeEvent, JsonMap, TgOp};
use crate::checkpoint::CheckpointSnapshot;
use crate::error::SourceError;

const RETRY_INITIAL: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(60);
const RETRY_LIMIT: u32 = 10;

/// The replication slot is named after the database it decodes.
pub fn slot_name(database: &str) -> String {
    format!("pgriver_{database}")
}

pub struct ReplicationReader {
    pool: PgPool,
    slot: String,
    tables: BTreeSet<(String, String)>,
    queue: mpsc::Sender<ChangeEvent>,
    acked: CheckpointSnapshot,
    chunk_size: usize,
    poll_timeout: Duration,
}

struct PeekedBatch {
    /// Raw WAL rows peeked, BEGIN/COMMIT markers included; the unit the
    /// slot advances by.
    wal_rows: usize,
    events: Vec<ChangeEvent>,
}

impl ReplicationReader {
    pub fn new(
        pool: PgPool,
        slot: String,
        tables: BTreeSet<(String, String)>,
        queue: mpsc::Sender<ChangeEvent>,
        acked: CheckpointSnapshot,
        chunk_size: usize,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            slot,
            tables,
            queue,
            acked,
            chunk_size,
            poll_timeout,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut failures = 0u32;
        let mut backoff = RETRY_INITIAL;

        loop {
            if *shutdown.borrow() {
                debug!("replication reader shutting down");
                return Ok(());
            }

            let batch = match self.peek().await {
                Ok(batch) => {
                    failures = 0;
                    backoff = RETRY_INITIAL;
                    batch
                }
                Err(e) => {
                    failures += 1;
                    if failures > RETRY_LIMIT {
                        return Err(e.into());
                    }
                    warn!(error = %e, attempt = failures, "replication poll failed, backing off");
                    if sleep_or_shutdown(backoff, &mut shutdown).await {
                        return Ok(());
                    }
                    backoff = (backoff * 2).min(RETRY_MAX);
                    continue;
                }
            };

            if batch.wal_rows == 0 {
                if sleep_or_shutdown(self.poll_timeout, &mut shutdown).await {
                    return Ok(());
                }
                continue;
            }

            let max_xid = batch.events.iter().map(|e| e.xmin).max();
            for event in batch.events {
                tokio::select! {
                    _ = shutdown.changed() => return Ok(()),
                    sent = self.queue.send(event) => sent?,
                }
            }

            // Hold the slot until the engine has durably indexed past the
            // batch, then consume exactly the rows we peeked.
            if let Some(max_xid) = max_xid {
                while self.acked.get() < max_xid {
                    if sleep_or_shutdown(self.poll_timeout, &mut shutdown).await {
                        return Ok(());
                    }
                }
            }
            self.advance(batch.wal_rows).await?;
        }
    }

    async fn peek(&self) -> Result<PeekedBatch, SourceError> {
        let (wal_rows, events) =
            peek_slot(&self.pool, &self.slot, &self.tables, self.chunk_size).await?;
        Ok(PeekedBatch { wal_rows, events })
    }

    async fn advance(&self, wal_rows: usize) -> Result<(), SourceError> {
        advance_slot(&self.pool, &self.slot, wal_rows).await
    }
}

/// Peek up to `chunk_size` WAL rows without consuming them; returns the
/// raw row count (the unit the slot advances by) and the normalized events
/// for tables in the tree.
pub async fn peek_slot(
    pool: &PgPool,
    slot: &str,
    tables: &BTreeSet<(String, String)>,
    chunk_size: usize,
) -> Result<(usize, Vec<ChangeEvent>), SourceError> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT xid::text, data FROM pg_logical_slot_peek_changes($1, NULL, $2)",
    )
    .bind(slot)
    .bind(chunk_size as i32)
    .fetch_all(pool)
    .await
    .map_err(|e| classify_slot_error(slot, e))?;

    let wal_rows = rows.len();
    let mut events = Vec::new();
    for (xid, data) in rows {
        let xid: u64 = xid.parse().unwrap_or(0);
        if let Some(event) = parse_wal_line(&data, xid) {
            if tables.contains(&(event.schema.clone(), event.table.clone())) {
                events.push(event);
            }
        }
    }

    Ok((wal_rows, events))
}

/// Consume `wal_rows` rows from the slot.
pub async fn advance_slot(pool: &PgPool, slot: &str, wal_rows: usize) -> Result<(), SourceError> {
    sqlx::query("SELECT 1 FROM pg_logical_slot_get_changes($1, NULL, $2)")
        .bind(slot)
        .bind(wal_rows as i32)
        .execute(pool)
        .await
        .map_err(|e| classify_slot_error(slot, e))?;
    debug!(rows = wal_rows, slot, "slot advanced");
    Ok(())
}

fn classify_slot_error(slot: &str, e: sqlx::Error) -> SourceError {
    if e.to_string().contains("does not exist") {
        SourceError::ReplicationSlotGone(slot.to_string())
    } else {
        SourceError::ConnectionLost(e)
    }
}

/// True when shutdown fired during the sleep.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

static WAL_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^table ([^.]+)\.([^:]+): (INSERT|UPDATE|DELETE|TRUNCATE):\s?(.*)$")
        .expect("static pattern compiles")
});

/// Normalize one test_decoding line; BEGIN/COMMIT markers yield None.
pub fn parse_wal_line(data: &str, xid: u64) -> Option<ChangeEvent> {
    let captures = WAL_LINE.captures(data.trim_end())?;
    let schema = unquote_ident(&captures[1]);
    let table = unquote_ident(&captures[2]);
    let rest = &captures[4];

    let (tg_op, old, new) = match &captures[3] {
        "INSERT" => (TgOp::Insert, None, Some(parse_tuple(rest))),
        "DELETE" => (TgOp::Delete, Some(parse_tuple(rest)), None),
        "TRUNCATE" => (TgOp::Truncate, None, None),
        "UPDATE" => {
            // With a replica identity the old key precedes the new tuple.
            if let Some(rest) = rest.strip_prefix("old-key:") {
                let (old_part, new_part) = rest.split_once("new-tuple:")?;
                (
                    TgOp::Update,
                    Some(parse_tuple(old_part)),
                    Some(parse_tuple(new_part)),
                )
            } else {
                (TgOp::Update, None, Some(parse_tuple(rest)))
            }
        }
        _ => return None,
    };

    Some(ChangeEvent {
        tg_op,
        schema,
        table,
        old,
        new,
        xmin: xid,
    })
}

fn unquote_ident(raw: &str) -> String {
    let raw = raw.trim();
    raw.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .map(|s| s.replace("\"\"", "\""))
        .unwrap_or_else(|| raw.to_string())
}

/// Parse a test_decoding tuple: `name[type]:value ...` where values are
/// quoted strings with doubled-quote escapes or bare tokens.
fn parse_tuple(s: &str) -> JsonMap {
    let mut map = JsonMap::new();
    let bytes = s.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        while i < bytes.len() && bytes[i] == b' ' {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }

        let name_start = i;
        while i < bytes.len() && bytes[i] != b'[' {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let name = s[name_start..i].trim().to_string();

        // Bracketed type name; array types nest brackets.
        let mut depth = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'[' => depth += 1,
                b']' => {
                    depth -= 1;
                    if depth == 0 {
                        i += 1;
                        break;
                    }
                }
                _ => {}
            }
            i += 1;
        }

        if i >= bytes.len() || bytes[i] != b':' {
            break;
        }
        i += 1;

        let value = if i < bytes.len() && bytes[i] == b'\'' {
            i += 1;
            let mut text = String::new();
            let mut chunk_start = i;
            loop {
                if i >= bytes.len() {
                    warn!(column = %name, "unterminated quoted value in WAL tuple");
                    break;
                }
                if bytes[i] == b'\'' {
                    text.push_str(&s[chunk_start..i]);
                    if bytes.get(i + 1) == Some(&b'\'') {
                        text.push('\'');
                        i += 2;
                        chunk_start = i;
                    } else {
                        i += 1;
                        break;
                    }
                } else {
                    i += 1;
                }
            }
            JsonValue::String(text)
        } else {
            let value_start = i;
            while i < bytes.len() && bytes[i] != b' ' {
                i += 1;
            }
            bare_value(&s[value_start..i])
        };

        map.insert(name, value);
    }

    map
}

fn bare_value(token: &str) -> JsonValue {
    match token {
        "null" => JsonValue::Null,
        "true" => JsonValue::Bool(true),
        "false" => JsonValue::Bool(false),
        _ => {
            if let Ok(i) = token.parse::<i64>() {
                JsonValue::Number(i.into())
            } else if let Ok(f) = token.parse::<f64>() {
                serde_json::Number::from_f64(f)
                    .map(JsonValue::Number)
                    .unwrap_or_else(|| JsonValue::String(token.to_string()))
            } else {
                JsonValue::String(token.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_begin_commit_skipped() {
        assert!(parse_wal_line("BEGIN 812", 812).is_none());
        assert!(parse_wal_line("COMMIT 812", 812).is_none());
    }

    #[test]
    fn test_parse_insert() {
        let line = "table public.book: INSERT: isbn[character varying]:'9788374950978' title[character varying]:'Kafka on the Shore' pages[integer]:505";
        let event = parse_wal_line(line, 812).unwrap();
        assert_eq!(event.tg_op, TgOp::Insert);
        assert_eq!(event.schema, "public");
        assert_eq!(event.table, "book");
        assert_eq!(event.xmin, 812);
        assert!(event.old.is_none());
        let new = event.new.unwrap();
        assert_eq!(new["isbn"], json!("9788374950978"));
        assert_eq!(new["title"], json!("Kafka on the Shore"));
        assert_eq!(new["pages"], json!(505));
    }

    #[test]
    fn test_parse_delete() {
        let line = "table public.book_author: DELETE: id[integer]:3";
        let event = parse_wal_line(line, 99).unwrap();
        assert_eq!(event.tg_op, TgOp::Delete);
        assert!(event.new.is_none());
        assert_eq!(event.old.unwrap()["id"], json!(3));
    }

    #[test]
    fn test_parse_update_with_old_key() {
        let line = "table public.author: UPDATE: old-key: id[integer]:2 new-tuple: id[integer]:2 name[character varying]:'H. Murakami'";
        let event = parse_wal_line(line, 813).unwrap();
        assert_eq!(event.tg_op, TgOp::Update);
        assert_eq!(event.old.unwrap()["id"], json!(2));
        let new = event.new.unwrap();
        assert_eq!(new["name"], json!("H. Murakami"));
    }

    #[test]
    fn test_parse_update_without_old_key() {
        let line = "table public.author: UPDATE: id[integer]:2 name[character varying]:'X'";
        let event = parse_wal_line(line, 1).unwrap();
        assert!(event.old.is_none());
        assert_eq!(event.new.unwrap()["id"], json!(2));
    }

    #[test]
    fn test_parse_truncate() {
        let event = parse_wal_line("table public.author: TRUNCATE: (no-flags)", 5).unwrap();
        assert_eq!(event.tg_op, TgOp::Truncate);
        assert!(event.old.is_none() && event.new.is_none());
    }

    #[test]
    fn test_quoted_value_escapes() {
        let line = "table public.author: INSERT: id[integer]:4 name[character varying]:'O''Brien'";
        let event = parse_wal_line(line, 1).unwrap();
        assert_eq!(event.new.unwrap()["name"], json!("O'Brien"));
    }

    #[test]
    fn test_array_type_brackets() {
        let line = "table public.book: INSERT: isbn[character varying]:'1' tags[text[]]:'{a,b}'";
        let event = parse_wal_line(line, 1).unwrap();
        assert_eq!(event.new.unwrap()["tags"], json!("{a,b}"));
    }

    #[test]
    fn test_bare_values() {
        let line =
            "table public.t: INSERT: id[integer]:7 ok[boolean]:true gone[text]:null score[numeric]:1.5";
        let new = parse_wal_line(line, 1).unwrap().new.unwrap();
        assert_eq!(new["id"], json!(7));
        assert_eq!(new["ok"], json!(true));
        assert_eq!(new["gone"], JsonValue::Null);
        assert_eq!(new["score"], json!(1.5));
    }

    #[test]
    fn test_quoted_identifiers() {
        let line = r#"table "MySchema"."My Table": DELETE: id[integer]:1"#;
        let event = parse_wal_line(line, 1).unwrap();
        assert_eq!(event.schema, "MySchema");
        assert_eq!(event.table, "My Table");
    }

    #[test]
    fn test_slot_name() {
        assert_eq!(slot_name("books"), "pgriver_books");
    }
}
