//! Shared SQL rendering helpers.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Safety {
    Safe,
    Destructive,
}

/// A single SQL statement with a destructiveness marker, so callers can
/// log teardown differently and dry-run output stays honest.
#[derive(Debug, Clone)]
pub struct RenderedSql {
    pub safety: Safety,
    pub sql: String,
}

impl RenderedSql {
    pub fn new(sql: String) -> Self {
        Self {
            sql,
            safety: Safety::Safe,
        }
    }

    pub fn destructive(sql: String) -> Self {
        Self {
            sql,
            safety: Safety::Destructive,
        }
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string as a SQL literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a JSON value as a SQL literal for filter predicates. Strings are
/// quoted, numbers and booleans pass through, null renders as NULL.
pub fn json_literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => quote_literal(s),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "NULL".to_string(),
        other => quote_literal(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("book"), "\"book\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_literal_escapes() {
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn test_json_literal() {
        assert_eq!(json_literal(&json!("abc")), "'abc'");
        assert_eq!(json_literal(&json!(42)), "42");
        assert_eq!(json_literal(&json!(true)), "true");
        assert_eq!(json_literal(&serde_json::Value::Null), "NULL");
    }
}
