//! The normalized change event both capture surfaces produce.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub type JsonMap = Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TgOp {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl std::fmt::Display for TgOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TgOp::Insert => "INSERT",
            TgOp::Update => "UPDATE",
            TgOp::Delete => "DELETE",
            TgOp::Truncate => "TRUNCATE",
        };
        f.write_str(s)
    }
}

/// `old` and `new` carry the primary-key and foreign-key columns of the
/// affected row: DELETE sets only `old`, INSERT only `new`, UPDATE both,
/// TRUNCATE neither. `xmin` is the transaction id the change committed
/// under (for notifications, an upper bound stamped at receipt).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub tg_op: TgOp,
    pub schema: String,
    pub table: String,
    pub old: Option<JsonMap>,
    pub new: Option<JsonMap>,
    pub xmin: u64,
}

/// Wire shape of a trigger notification; `xmin` is attached by the
/// listener.
#[derive(Debug, Deserialize)]
struct NotificationPayload {
    tg_op: TgOp,
    schema: String,
    table: String,
    #[serde(default)]
    old: Option<JsonMap>,
    #[serde(default)]
    new: Option<JsonMap>,
}

impl ChangeEvent {
    pub fn from_notification(payload: &str, xmin: u64) -> Result<Self> {
        let parsed: NotificationPayload =
            serde_json::from_str(payload).context("malformed trigger notification payload")?;
        Ok(Self {
            tg_op: parsed.tg_op,
            schema: parsed.schema,
            table: parsed.table,
            old: parsed.old,
            new: parsed.new,
            xmin,
        })
    }

    /// The row image to read identifying values from: the new image when
    /// present, otherwise the old one.
    pub fn row(&self) -> Option<&JsonMap> {
        self.new.as_ref().or(self.old.as_ref())
    }

    /// Values for the named columns from the preferred row image; None if
    /// any column is absent.
    pub fn values(&self, columns: &[String]) -> Option<Vec<JsonValue>> {
        let row = self.row()?;
        columns
            .iter()
            .map(|c| row.get(c).cloned())
            .collect::<Option<Vec<_>>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_notification() {
        let payload = r#"{"tg_op": "UPDATE", "schema": "public", "table": "author",
                          "old": {"id": 2}, "new": {"id": 2}}"#;
        let event = ChangeEvent::from_notification(payload, 812).unwrap();
        assert_eq!(event.tg_op, TgOp::Update);
        assert_eq!(event.table, "author");
        assert_eq!(event.xmin, 812);
        assert_eq!(event.old.as_ref().unwrap()["id"], json!(2));
    }

    #[test]
    fn test_delete_has_only_old() {
        let payload = r#"{"tg_op": "DELETE", "schema": "public", "table": "book",
                          "old": {"isbn": "9781471331435"}}"#;
        let event = ChangeEvent::from_notification(payload, 99).unwrap();
        assert!(event.new.is_none());
        assert_eq!(
            event.values(&["isbn".to_string()]).unwrap(),
            vec![json!("9781471331435")]
        );
    }

    #[test]
    fn test_truncate_has_no_rows() {
        let payload = r#"{"tg_op": "TRUNCATE", "schema": "public", "table": "author"}"#;
        let event = ChangeEvent::from_notification(payload, 7).unwrap();
        assert_eq!(event.tg_op, TgOp::Truncate);
        assert!(event.row().is_none());
    }

    #[test]
    fn test_malformed_payload_rejected() {
        assert!(ChangeEvent::from_notification("not json", 1).is_err());
        assert!(ChangeEvent::from_notification(r#"{"tg_op": "NOPE"}"#, 1).is_err());
    }

    #[test]
    fn test_values_missing_column() {
        let payload = r#"{"tg_op": "INSERT", "schema": "public", "table": "book",
                          "new": {"isbn": "1"}}"#;
        let event = ChangeEvent::from_notification(payload, 1).unwrap();
        assert!(event.values(&["isbn".to_string(), "title".to_string()]).is_none());
    }
}
