//! Filter modes for the synthesized document query.

use itertools::Itertools;
use serde_json::Value as JsonValue;

use crate::render::{json_literal, quote_ident};

/// Composite pivot primary-key values in reflection column order.
pub type PivotKey = Vec<JsonValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Full sync, optionally windowed to pivot rows committed in
    /// `(txmin, txmax]`.
    Full {
        txmin: Option<i64>,
        txmax: Option<i64>,
    },
    /// Pointed sync over an explicit pivot-key set. Callers chunk the set
    /// with [`chunk_keys`] before building queries.
    Keys(Vec<PivotKey>),
    /// Tuple-id paged sync over heap blocks `[start_block, end_block)`.
    TupleRange { start_block: u32, end_block: u32 },
}

impl Filter {
    pub fn full() -> Self {
        Filter::Full {
            txmin: None,
            txmax: None,
        }
    }

    /// WHERE predicate over the pivot alias, or None for an unfiltered scan.
    pub fn predicate(&self, alias: &str, primary_key: &[String]) -> Option<String> {
        match self {
            Filter::Full { txmin, txmax } => {
                let mut parts = Vec::new();
                if let Some(txmin) = txmin {
                    parts.push(format!("{alias}.xmin::text::bigint > {txmin}"));
                }
                if let Some(txmax) = txmax {
                    parts.push(format!("{alias}.xmin::text::bigint <= {txmax}"));
                }
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join(" AND "))
                }
            }
            Filter::Keys(keys) => {
                if keys.is_empty() {
                    return Some("false".to_string());
                }
                let lhs = if primary_key.len() == 1 {
                    format!("{alias}.{}", quote_ident(&primary_key[0]))
                } else {
                    format!(
                        "({})",
                        primary_key
                            .iter()
                            .map(|c| format!("{alias}.{}", quote_ident(c)))
                            .join(", ")
                    )
                };
                let rhs = keys
                    .iter()
                    .map(|key| {
                        if key.len() == 1 {
                            json_literal(&key[0])
                        } else {
                            format!("({})", key.iter().map(json_literal).join(", "))
                        }
                    })
                    .join(", ");
                Some(format!("{lhs} IN ({rhs})"))
            }
            Filter::TupleRange {
                start_block,
                end_block,
            } => Some(format!(
                "{alias}.ctid >= '({start_block},0)'::tid AND {alias}.ctid < '({end_block},0)'::tid"
            )),
        }
    }
}

/// Split a key set into `IN`-list chunks no larger than `size`.
pub fn chunk_keys(keys: Vec<PivotKey>, size: usize) -> Vec<Vec<PivotKey>> {
    assert!(size > 0, "chunk size must be positive");
    let mut chunks = Vec::with_capacity(keys.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(keys.len()));
    for key in keys {
        current.push(key);
        if current.len() == size {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
