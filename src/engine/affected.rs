//! Mapping change events to affected pivot primary keys.
//!
//! Each non-root node's chain is walked with its terminal table dropped:
//! the last hop's child-side column values come from the event payload
//! (trigger payloads carry primary- and foreign-key columns), so deleted
//! rows never need to be read back. When the last hop lands directly on
//! the pivot's primary key the keys come straight from the payload; other
//! positions produce a rooting query for the engine to run.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::capture::{ChangeEvent, JsonMap, TgOp};
use crate::query::{PivotKey, canonical_id};
use crate::render::{json_literal, quote_ident};
use crate::tree::{JoinStep, Node, NodeId, Tree};

/// Rooting work that needs the database: join the chain prefix back to the
/// pivot, filtered on the last hop's parent-side columns.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChain {
    pub node: NodeId,
    pub position: usize,
    pub prefix: Vec<JoinStep>,
    pub values: Vec<Vec<JsonValue>>,
}

impl PendingChain {
    /// `SELECT DISTINCT jsonb_build_array(<root pk>) ...` over the chain
    /// prefix, excluding the changed table itself.
    pub fn sql(&self, root: &Node) -> String {
        let key_expr = root
            .primary_key
            .iter()
            .map(|c| format!("n0.{}", quote_ident(c)))
            .join(", ");

        let mut sql = format!(
            "SELECT DISTINCT jsonb_build_array({key_expr}) AS \"key\"\nFROM {}.{} AS n0",
            quote_ident(&root.schema),
            quote_ident(&root.table),
        );

        // Join every hop before the changed table.
        for (i, step) in self.prefix[..self.prefix.len() - 1].iter().enumerate() {
            let prev = if i == 0 {
                "n0".to_string()
            } else {
                format!("t{}", i - 1)
            };
            let on = step
                .on
                .iter()
                .map(|(from_col, to_col)| {
                    format!(
                        "t{i}.{} = {prev}.{}",
                        quote_ident(to_col),
                        quote_ident(from_col)
                    )
                })
                .join(" AND ");
            sql.push_str(&format!(
                "\nJOIN {}.{} AS t{i} ON {on}",
                quote_ident(&step.to.schema),
                quote_ident(&step.to.table),
            ));
        }

        let last = self.prefix.last().expect("chains have at least one hop");
        let filter_alias = if self.prefix.len() == 1 {
            "n0".to_string()
        } else {
            format!("t{}", self.prefix.len() - 2)
        };
        let lhs = if last.on.len() == 1 {
            format!("{filter_alias}.{}", quote_ident(&last.on[0].0))
        } else {
            format!(
                "({})",
                last.on
                    .iter()
                    .map(|(from_col, _)| format!("{filter_alias}.{}", quote_ident(from_col)))
                    .join(", ")
            )
        };
        let rhs = self
            .values
            .iter()
            .map(|tuple| {
                if tuple.len() == 1 {
                    json_literal(&tuple[0])
                } else {
                    format!("({})", tuple.iter().map(json_literal).join(", "))
                }
            })
            .join(", ");

        sql.push_str(&format!("\nWHERE {lhs} IN ({rhs})"));
        sql
    }
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub upserts: Vec<PivotKey>,
    pub deletes: Vec<String>,
    pub truncate_root: bool,
    pub full_resync: bool,
    pub pending: Vec<PendingChain>,
}

pub fn resolve(tree: &Tree, events: &[ChangeEvent]) -> Resolution {
    let root = tree.root();
    let mut upserts: BTreeSet<String> = BTreeSet::new();
    let mut upsert_keys: Vec<PivotKey> = Vec::new();
    let mut deletes: BTreeSet<String> = BTreeSet::new();
    let mut truncate_root = false;
    let mut full_resync = false;
    let mut pending: BTreeMap<(NodeId, usize), PendingChain> = BTreeMap::new();
    let mut pending_seen: BTreeSet<(NodeId, usize, String)> = BTreeSet::new();

    let mut push_upsert = |key: PivotKey, upsert_keys: &mut Vec<PivotKey>| {
        let fingerprint = serde_json::to_string(&key).unwrap_or_default();
        if upserts.insert(fingerprint) {
            upsert_keys.push(key);
        }
    };

    for event in events {
        // The pivot itself.
        let hits_root = tree
            .nodes_for_table(&event.schema, &event.table)
            .iter()
            .any(|&id| tree.node(id).is_root());
        if hits_root {
            match event.tg_op {
                TgOp::Truncate => truncate_root = true,
                TgOp::Insert | TgOp::Update => {
                    match image_values(event.new.as_ref(), &root.primary_key) {
                        Some(key) => {
                            // A key-changing update abandons the old
                            // document.
                            if event.tg_op == TgOp::Update {
                                if let Some(old_key) =
                                    image_values(event.old.as_ref(), &root.primary_key)
                                {
                                    if old_key != key {
                                        deletes.insert(canonical_id(&old_key));
                                    }
                                }
                            }
                            push_upsert(key, &mut upsert_keys);
                        }
                        None => {
                            warn!(table = %event.table, "pivot event lacks key columns, forcing full re-sync");
                            full_resync = true;
                        }
                    }
                }
                TgOp::Delete => match image_values(event.old.as_ref(), &root.primary_key) {
                    Some(key) => {
                        deletes.insert(canonical_id(&key));
                    }
                    None => {
                        warn!(table = %event.table, "pivot delete lacks key columns, forcing full re-sync");
                        full_resync = true;
                    }
                },
            }
        }

        // Every chain position the changed table occupies, node tables and
        // through tables alike.
        for node in tree.nodes().filter(|n| !n.is_root()) {
            let chain = tree.root_plan(node.id);
            for (position, step) in chain.iter().enumerate() {
                if step.to.schema != event.schema || step.to.table != event.table {
                    continue;
                }
                if event.tg_op == TgOp::Truncate {
                    full_resync = true;
                    continue;
                }

                let to_cols: Vec<String> = step.on.iter().map(|(_, to)| to.clone()).collect();
                let mut tuples: Vec<Vec<JsonValue>> = Vec::new();
                for image in [event.old.as_ref(), event.new.as_ref()].into_iter().flatten() {
                    if let Some(values) = map_values(image, &to_cols) {
                        if !tuples.contains(&values) {
                            tuples.push(values);
                        }
                    }
                }

                if tuples.is_empty() {
                    // Replication deletes only carry the replica identity;
                    // without the link columns the pivot set is unknown.
                    warn!(
                        table = %event.table,
                        node = node.id,
                        "event lacks link columns, forcing full re-sync"
                    );
                    full_resync = true;
                    continue;
                }

                let prefix = &chain[..=position];
                let from_cols: Vec<&str> =
                    step.on.iter().map(|(from, _)| from.as_str()).collect();
                let lands_on_root_pk = prefix.len() == 1
                    && step.from.schema == root.schema
                    && step.from.table == root.table
                    && same_columns(&from_cols, &root.primary_key);

                if lands_on_root_pk {
                    for tuple in &tuples {
                        // Reorder the hop values into primary-key order.
                        let key: PivotKey = root
                            .primary_key
                            .iter()
                            .map(|pk| {
                                let idx = from_cols
                                    .iter()
                                    .position(|c| *c == pk.as_str())
                                    .expect("column sets match");
                                tuple[idx].clone()
                            })
                            .collect();
                        push_upsert(key, &mut upsert_keys);
                    }
                } else {
                    let entry = pending
                        .entry((node.id, position))
                        .or_insert_with(|| PendingChain {
                            node: node.id,
                            position,
                            prefix: prefix.to_vec(),
                            values: Vec::new(),
                        });
                    for tuple in tuples {
                        let fingerprint =
                            serde_json::to_string(&tuple).unwrap_or_default();
                        if pending_seen.insert((node.id, position, fingerprint)) {
                            entry.values.push(tuple);
                        }
                    }
                }
            }
        }
    }

    Resolution {
        upserts: upsert_keys,
        deletes: deletes.into_iter().collect(),
        truncate_root,
        full_resync,
        pending: pending.into_values().collect(),
    }
}

fn image_values(image: Option<&JsonMap>, columns: &[String]) -> Option<Vec<JsonValue>> {
    map_values(image?, columns)
}

fn map_values(image: &JsonMap, columns: &[String]) -> Option<Vec<JsonValue>> {
    columns
        .iter()
        .map(|c| image.get(c).cloned())
        .collect::<Option<Vec<_>>>()
}

fn same_columns(a: &[&str], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let left: BTreeSet<&str> = a.iter().copied().collect();
    let right: BTreeSet<&str> = b.iter().map(String::as_str).collect();
    left == right
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures::books_catalog;
    use crate::schema::parse;
    use serde_json::json;

    fn books_tree() -> Tree {
        let syncs = parse(crate::tree::tests::BOOKS_SCHEMA).unwrap();
        Tree::build(&syncs[0], &books_catalog()).unwrap()
    }

    fn event(tg_op: TgOp, table: &str, old: Option<JsonValue>, new: Option<JsonValue>) -> ChangeEvent {
        ChangeEvent {
            tg_op,
            schema: "public".to_string(),
            table: table.to_string(),
            old: old.map(|v| v.as_object().unwrap().clone()),
            new: new.map(|v| v.as_object().unwrap().clone()),
            xmin: 100,
        }
    }

    #[test]
    fn test_pivot_insert_upserts() {
        let tree = books_tree();
        let resolution = resolve(
            &tree,
            &[event(
                TgOp::Insert,
                "book",
                None,
                Some(json!({"isbn": "9788374950978"})),
            )],
        );
        assert_eq!(resolution.upserts, vec![vec![json!("9788374950978")]]);
        assert!(resolution.deletes.is_empty());
        assert!(resolution.pending.is_empty());
    }

    #[test]
    fn test_pivot_delete_removes_document() {
        let tree = books_tree();
        let resolution = resolve(
            &tree,
            &[event(
                TgOp::Delete,
                "book",
                Some(json!({"isbn": "9781471331435"})),
                None,
            )],
        );
        assert!(resolution.upserts.is_empty());
        assert_eq!(resolution.deletes, vec!["9781471331435".to_string()]);
    }

    #[test]
    fn test_pivot_key_change_deletes_old_document() {
        let tree = books_tree();
        let resolution = resolve(
            &tree,
            &[event(
                TgOp::Update,
                "book",
                Some(json!({"isbn": "old"})),
                Some(json!({"isbn": "new"})),
            )],
        );
        assert_eq!(resolution.upserts, vec![vec![json!("new")]]);
        assert_eq!(resolution.deletes, vec!["old".to_string()]);
    }

    #[test]
    fn test_through_table_change_maps_directly_to_pivot() {
        // book_author carries the foreign key onto the pivot's primary
        // key, so no query is needed even for a delete.
        let tree = books_tree();
        let resolution = resolve(
            &tree,
            &[event(
                TgOp::Delete,
                "book_author",
                Some(json!({"id": 3, "book_isbn": "9788374950978", "author_id": 3})),
                None,
            )],
        );
        assert_eq!(resolution.upserts, vec![vec![json!("9788374950978")]]);
        assert!(resolution.pending.is_empty());
        assert!(!resolution.full_resync);
    }

    #[test]
    fn test_leaf_change_produces_rooting_query() {
        let tree = books_tree();
        let resolution = resolve(
            &tree,
            &[event(
                TgOp::Update,
                "author",
                Some(json!({"id": 2})),
                Some(json!({"id": 2})),
            )],
        );
        assert!(resolution.upserts.is_empty());
        assert_eq!(resolution.pending.len(), 1);

        let chain = &resolution.pending[0];
        assert_eq!(chain.values, vec![vec![json!(2)]]);
        let sql = chain.sql(tree.root());
        assert!(sql.contains(r#"SELECT DISTINCT jsonb_build_array(n0."isbn") AS "key""#));
        assert!(sql.contains(r#"FROM "public"."book" AS n0"#));
        assert!(sql.contains(r#"JOIN "public"."book_author" AS t0 ON t0."book_isbn" = n0."isbn""#));
        // The deleted/updated author row itself is never joined.
        assert!(!sql.contains(r#""public"."author""#));
        assert!(sql.contains(r#"WHERE t0."author_id" IN (2)"#));
    }

    #[test]
    fn test_foreign_key_repoint_touches_both_pivots() {
        let tree = books_tree();
        let resolution = resolve(
            &tree,
            &[event(
                TgOp::Update,
                "book_author",
                Some(json!({"id": 1, "book_isbn": "A", "author_id": 1})),
                Some(json!({"id": 1, "book_isbn": "B", "author_id": 1})),
            )],
        );
        assert_eq!(
            resolution.upserts,
            vec![vec![json!("A")], vec![json!("B")]]
        );
    }

    #[test]
    fn test_truncate_root_and_leaf() {
        let tree = books_tree();
        let resolution = resolve(&tree, &[event(TgOp::Truncate, "book", None, None)]);
        assert!(resolution.truncate_root);
        assert!(!resolution.full_resync);

        let resolution = resolve(&tree, &[event(TgOp::Truncate, "author", None, None)]);
        assert!(!resolution.truncate_root);
        assert!(resolution.full_resync);
    }

    #[test]
    fn test_missing_link_columns_fall_back_to_full_resync() {
        // A replication-path delete only carries the replica identity.
        let tree = books_tree();
        let resolution = resolve(
            &tree,
            &[event(
                TgOp::Delete,
                "book_author",
                Some(json!({"id": 3})),
                None,
            )],
        );
        assert!(resolution.full_resync);
        assert!(resolution.upserts.is_empty());
    }

    #[test]
    fn test_batch_deduplicates_pivot_keys() {
        let tree = books_tree();
        let events: Vec<ChangeEvent> = (0..3)
            .map(|_| {
                event(
                    TgOp::Insert,
                    "book_author",
                    None,
                    Some(json!({"id": 9, "book_isbn": "X", "author_id": 1})),
                )
            })
            .collect();
        let resolution = resolve(&tree, &events);
        assert_eq!(resolution.upserts, vec![vec![json!("X")]]);
    }

    #[test]
    fn test_pending_values_merge_across_events() {
        let tree = books_tree();
        let events = vec![
            event(TgOp::Update, "author", None, Some(json!({"id": 2}))),
            event(TgOp::Update, "author", None, Some(json!({"id": 3}))),
            event(TgOp::Update, "author", None, Some(json!({"id": 2}))),
        ];
        let resolution = resolve(&tree, &events);
        assert_eq!(resolution.pending.len(), 1);
        assert_eq!(
            resolution.pending[0].values,
            vec![vec![json!(2)], vec![json!(3)]]
        );
    }
}
