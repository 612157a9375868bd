//! The query synthesizer.
//!
//! One SQL statement per tree, returning one row per pivot primary key:
//! the key as a jsonb array, the complete denormalized document as jsonb,
//! and the pivot row's transaction id. Children fold into their parents
//! through grouped subqueries joined on the parent-side foreign-key
//! columns, so the whole document is pre-aggregated by the server.

use itertools::Itertools;
use serde_json::Value as JsonValue;

use crate::render::{quote_ident, quote_literal};
use crate::schema::{RelKind, Variant};
use crate::settings::DOC_ID_DELIMITER;
use crate::tree::{Node, PathSeg, ProjectedColumn, Tree};

pub mod cursor;
pub mod filter;

pub use cursor::{DocumentCursor, DocumentRow};
pub use filter::{Filter, PivotKey, chunk_keys};

/// Canonical document id: pivot primary-key values joined in reflection
/// column order.
pub fn canonical_id(key: &[JsonValue]) -> String {
    key.iter()
        .map(|v| match v {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        })
        .join(DOC_ID_DELIMITER)
}

pub struct Synthesizer<'a> {
    tree: &'a Tree,
}

impl<'a> Synthesizer<'a> {
    pub fn new(tree: &'a Tree) -> Self {
        Self { tree }
    }

    /// The document query for one filter. Column names on the result are
    /// fixed: `key`, `document`, `txid`.
    pub fn document_query(&self, filter: &Filter) -> String {
        let root = self.tree.root();
        let alias = node_alias(root);

        let key_expr = format!(
            "jsonb_build_array({})",
            root.primary_key
                .iter()
                .map(|c| format!("{alias}.{}", quote_ident(c)))
                .join(", ")
        );

        let mut sql = format!(
            "SELECT {key_expr} AS \"key\", {} AS \"document\", {alias}.xmin::text::bigint AS \"txid\"\nFROM {} AS {alias}",
            self.object_expr(root, &alias),
            qualified(&root.schema, &root.table),
        );

        for &child in &root.children {
            sql.push('\n');
            sql.push_str(&self.child_join(self.tree.node(child), &alias));
        }

        if let Some(predicate) = filter.predicate(&alias, &root.primary_key) {
            sql.push_str("\nWHERE ");
            sql.push_str(&predicate);
        }

        sql
    }

    /// jsonb_build_object over the node's projected columns plus one entry
    /// per child label.
    fn object_expr(&self, node: &Node, alias: &str) -> String {
        let mut pairs: Vec<String> = node
            .columns
            .iter()
            .map(|c| format!("{}, {}", quote_literal(&c.key), column_expr(alias, c)))
            .collect();

        for &child_id in &node.children {
            let child = self.tree.node(child_id);
            pairs.push(format!(
                "{}, {}",
                quote_literal(&child.label),
                child_value_expr(child)
            ));
        }

        format!("jsonb_build_object({})", pairs.join(", "))
    }

    /// LEFT JOIN folding one child (and, recursively, its own children)
    /// into the parent's scope, grouped on the parent-side link columns.
    fn child_join(&self, child: &Node, parent_alias: &str) -> String {
        let plan = &child.join_plan;
        let first = &plan[0];
        let child_alias = chain_alias(plan.len() - 1);
        let subquery_alias = node_alias(child);

        // Group keys are the link columns on the hop nearest the parent.
        let key_cols: Vec<String> = first
            .on
            .iter()
            .enumerate()
            .map(|(i, (_, to_col))| format!("t0.{} AS \"k{i}\"", quote_ident(to_col)))
            .collect();

        let mut from_clause = format!("FROM {} AS t0", qualified(&first.to.schema, &first.to.table));
        for (i, step) in plan.iter().enumerate().skip(1) {
            let prev = chain_alias(i - 1);
            let this = chain_alias(i);
            let on = step
                .on
                .iter()
                .map(|(from_col, to_col)| {
                    format!(
                        "{this}.{} = {prev}.{}",
                        quote_ident(to_col),
                        quote_ident(from_col)
                    )
                })
                .join(" AND ");
            from_clause.push_str(&format!(
                "\n  JOIN {} AS {this} ON {on}",
                qualified(&step.to.schema, &step.to.table)
            ));
        }

        let relationship = child
            .relationship
            .expect("non-root node carries a relationship");
        let element = match relationship.variant {
            Variant::Scalar => format!("to_jsonb({})", column_expr(&child_alias, child.scalar_column())),
            Variant::Object => self.object_expr(child, &child_alias),
        };

        let order_by = child
            .primary_key
            .iter()
            .map(|c| format!("{child_alias}.{}", quote_ident(c)))
            .join(", ");
        let value_expr = match relationship.kind {
            RelKind::OneToMany => format!("jsonb_agg({element} ORDER BY {order_by})"),
            // The foreign key is unique, so the group holds a single row.
            RelKind::OneToOne => format!("(jsonb_agg({element})) -> 0"),
        };

        let mut grandchild_joins = String::new();
        for &grandchild in &child.children {
            grandchild_joins.push_str("\n  ");
            grandchild_joins.push_str(&self.child_join(self.tree.node(grandchild), &child_alias));
        }

        let group_by = first
            .on
            .iter()
            .map(|(_, to_col)| format!("t0.{}", quote_ident(to_col)))
            .join(", ");

        let on_parent = first
            .on
            .iter()
            .enumerate()
            .map(|(i, (from_col, _))| {
                format!(
                    "{subquery_alias}.\"k{i}\" = {parent_alias}.{}",
                    quote_ident(from_col)
                )
            })
            .join(" AND ");

        format!(
            "LEFT JOIN (\n  SELECT {keys}, {value_expr} AS \"value\"\n  {from_clause}{grandchild_joins}\n  GROUP BY {group_by}\n) AS {subquery_alias} ON {on_parent}",
            keys = key_cols.join(", "),
        )
    }
}

/// Value a child contributes to its parent's object.
fn child_value_expr(child: &Node) -> String {
    let alias = node_alias(child);
    let relationship = child
        .relationship
        .expect("non-root node carries a relationship");
    match relationship.kind {
        // An empty group is an empty array, never null.
        RelKind::OneToMany => format!("COALESCE({alias}.\"value\", '[]'::jsonb)"),
        RelKind::OneToOne => format!("{alias}.\"value\""),
    }
}

/// Column reference with JSON-path accessors compiled to native operators.
fn column_expr(alias: &str, column: &ProjectedColumn) -> String {
    let mut expr = format!("{alias}.{}", quote_ident(&column.column));
    for seg in &column.path {
        match seg {
            PathSeg::Key(k) => expr.push_str(&format!(" -> {}", quote_literal(k))),
            PathSeg::Index(i) => expr.push_str(&format!(" -> {i}")),
        }
    }
    expr
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

fn node_alias(node: &Node) -> String {
    if node.is_root() {
        "n0".to_string()
    } else {
        format!("c{}", node.id)
    }
}

fn chain_alias(i: usize) -> String {
    format!("t{i}")
}
