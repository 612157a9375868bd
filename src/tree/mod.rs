//! The schema tree: one node per table placement, bound to reflection.
//!
//! Nodes live in an arena in depth-first order; parents and children are
//! plain indices. Every non-root node carries the join plan connecting it
//! to its parent, resolved against reflected foreign keys at build time so
//! nothing about connectivity is decided at query time.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;

use crate::catalog::Catalog;
use crate::error::ConfigError;
use crate::schema::{NodeDef, RelKind, SyncDef, Variant};
use crate::transform::TransformSet;

pub mod columns;

pub use columns::{PathSeg, ProjectedColumn};

pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    pub fn as_pair(&self) -> (&str, &str) {
        (&self.schema, &self.table)
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// One join hop; `from` is the side closer to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinStep {
    pub from: TableRef,
    pub to: TableRef,
    /// Column pairs `(from_col, to_col)` equated by the join.
    pub on: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relationship {
    pub variant: Variant,
    pub kind: RelKind,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub schema: String,
    pub table: String,
    pub label: String,
    pub columns: Vec<ProjectedColumn>,
    pub primary_key: Vec<String>,
    pub relationship: Option<Relationship>,
    pub transform: TransformSet,
    /// Hops from the parent's table to this node's table, through tables
    /// included. Empty on the root.
    pub join_plan: Vec<JoinStep>,
    pub children: Vec<NodeId>,
}

impl Node {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.schema, &self.table)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Projected columns that are not part of the primary key.
    pub fn value_columns(&self) -> Vec<&ProjectedColumn> {
        self.columns
            .iter()
            .filter(|c| !(c.path.is_empty() && self.primary_key.contains(&c.column)))
            .collect()
    }

    /// The sole non-key column a scalar relationship emits.
    pub fn scalar_column(&self) -> &ProjectedColumn {
        self.value_columns()
            .into_iter()
            .next()
            .expect("scalar arity validated at build")
    }
}

#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    by_table: BTreeMap<(String, String), Vec<NodeId>>,
}

impl Tree {
    pub fn build(sync: &SyncDef, catalog: &Catalog) -> Result<Self, ConfigError> {
        let mut tree = Tree {
            nodes: Vec::new(),
            by_table: BTreeMap::new(),
        };
        tree.add_node(&sync.nodes, None, catalog)?;
        Ok(tree)
    }

    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Depth-first iteration; the arena is stored in visit order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Node placements of a table; a table may appear at several positions.
    pub fn nodes_for_table(&self, schema: &str, table: &str) -> &[NodeId] {
        self.by_table
            .get(&(schema.to_string(), table.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every table the tree touches, through tables included.
    pub fn tables(&self) -> BTreeSet<TableRef> {
        let mut tables = BTreeSet::new();
        for node in &self.nodes {
            tables.insert(node.table_ref());
            for step in &node.join_plan {
                tables.insert(step.from.clone());
                tables.insert(step.to.clone());
            }
        }
        tables
    }

    /// The full hop chain from the root's table down to the node's table.
    pub fn root_plan(&self, id: NodeId) -> Vec<JoinStep> {
        let mut chain = Vec::new();
        let mut lineage = Vec::new();
        let mut cursor = Some(id);
        while let Some(node_id) = cursor {
            lineage.push(node_id);
            cursor = self.nodes[node_id].parent;
        }
        for node_id in lineage.into_iter().rev() {
            chain.extend(self.nodes[node_id].join_plan.iter().cloned());
        }
        chain
    }

    /// Output keys of a node after column selection and transform rename,
    /// with child labels appended in declaration order.
    pub fn projection(&self, id: NodeId) -> Vec<String> {
        let node = &self.nodes[id];
        let mut keys: Vec<String> = node
            .columns
            .iter()
            .map(|c| node.transform.renamed(&c.key).to_string())
            .collect();
        keys.extend(
            node.children
                .iter()
                .map(|&child| self.nodes[child].label.clone()),
        );
        keys
    }

    fn add_node(
        &mut self,
        def: &NodeDef,
        parent: Option<NodeId>,
        catalog: &Catalog,
    ) -> Result<NodeId, ConfigError> {
        if !catalog.has_schema(&def.schema) {
            return Err(ConfigError::UnknownSchema(def.schema.clone()));
        }
        let table = catalog
            .table(&def.schema, &def.table)
            .ok_or_else(|| ConfigError::UnknownTable {
                schema: def.schema.clone(),
                table: def.table.clone(),
            })?;

        let primary_key = table.primary_key_columns();
        if primary_key.is_empty() {
            return Err(ConfigError::InvalidSchema(format!(
                "table {}.{} has no primary key",
                def.schema, def.table
            )));
        }

        let columns = if def.columns.is_empty() {
            table
                .column_names()
                .iter()
                .map(|c| ProjectedColumn::plain(c))
                .collect()
        } else {
            let mut projected = Vec::with_capacity(def.columns.len());
            for raw in &def.columns {
                let column = columns::parse(raw)?;
                if table.column(&column.column).is_none() {
                    return Err(ConfigError::UnknownColumn {
                        schema: def.schema.clone(),
                        table: def.table.clone(),
                        column: column.column.clone(),
                    });
                }
                projected.push(column);
            }
            projected
        };

        let relationship = self.resolve_relationship(def, parent)?;

        let join_plan = match parent {
            Some(parent_id) => {
                let parent_table = self.nodes[parent_id].table_ref();
                compute_join_plan(&parent_table, def, catalog)?
            }
            None => Vec::new(),
        };

        let transform = TransformSet::from_def(def.transform.as_ref())
            .map_err(|e| ConfigError::InvalidSchema(e.to_string()))?;

        let id = self.nodes.len();
        let node = Node {
            id,
            parent,
            schema: def.schema.clone(),
            table: def.table.clone(),
            label: def.label().to_string(),
            columns,
            primary_key,
            relationship,
            transform,
            join_plan,
            children: Vec::new(),
        };

        if let Some(Relationship {
            variant: Variant::Scalar,
            ..
        }) = node.relationship
        {
            if node.value_columns().len() != 1 {
                return Err(ConfigError::InvalidSchema(format!(
                    "scalar node {} must project exactly one non-key column",
                    node.table_ref()
                )));
            }
        }

        self.nodes.push(node);
        self.by_table
            .entry((def.schema.clone(), def.table.clone()))
            .or_default()
            .push(id);

        let mut labels: BTreeSet<&str> = BTreeSet::new();
        for child_def in &def.children {
            if !labels.insert(child_def.label()) {
                return Err(ConfigError::InvalidSchema(format!(
                    "duplicate sibling label {} under {}",
                    child_def.label(),
                    def.table
                )));
            }
        }

        for child_def in &def.children {
            let child_id = self.add_node(child_def, Some(id), catalog)?;
            self.nodes[id].children.push(child_id);
        }

        Ok(id)
    }

    fn resolve_relationship(
        &self,
        def: &NodeDef,
        parent: Option<NodeId>,
    ) -> Result<Option<Relationship>, ConfigError> {
        match (parent, &def.relationship) {
            (None, None) => Ok(None),
            (None, Some(_)) => Err(ConfigError::InvalidSchema(format!(
                "root node {} must not declare a relationship",
                def.table
            ))),
            (Some(_), rel) => {
                let rel = rel.as_ref().ok_or_else(|| ConfigError::MissingRelationship {
                    table: def.table.clone(),
                })?;
                match (rel.variant, rel.kind) {
                    (Some(variant), Some(kind)) => Ok(Some(Relationship { variant, kind })),
                    _ => Err(ConfigError::MissingRelationship {
                        table: def.table.clone(),
                    }),
                }
            }
        }
    }
}

/// Resolve the hop chain parent -> through tables -> child against the
/// reflected foreign keys.
fn compute_join_plan(
    parent: &TableRef,
    def: &NodeDef,
    catalog: &Catalog,
) -> Result<Vec<JoinStep>, ConfigError> {
    let rel = def.relationship.as_ref();
    let through: Vec<TableRef> = rel
        .map(|r| {
            r.through_tables
                .iter()
                .map(|t| TableRef::new(&def.schema, t))
                .collect()
        })
        .unwrap_or_default();

    let mut chain = vec![parent.clone()];
    chain.extend(through);
    chain.push(TableRef::new(&def.schema, &def.table));

    detect_chain_cycle(&chain)?;

    let explicit = rel.and_then(|r| r.foreign_key.as_ref());
    let direct = chain.len() == 2;

    let mut steps = Vec::with_capacity(chain.len() - 1);
    for pair in chain.windows(2) {
        let (from, to) = (&pair[0], &pair[1]);
        if catalog.table(&to.schema, &to.table).is_none() {
            return Err(ConfigError::UnknownTable {
                schema: to.schema.clone(),
                table: to.table.clone(),
            });
        }

        // An explicit foreign_key override only makes sense for the direct
        // parent/child pair; chains resolve every hop from reflection.
        if direct {
            if let Some(fk) = explicit {
                if fk.parent.len() != fk.child.len() || fk.parent.is_empty() {
                    return Err(ConfigError::InvalidSchema(format!(
                        "foreign_key override between {from} and {to} must pair columns"
                    )));
                }
                steps.push(JoinStep {
                    from: from.clone(),
                    to: to.clone(),
                    on: fk
                        .parent
                        .iter()
                        .cloned()
                        .zip(fk.child.iter().cloned())
                        .collect(),
                });
                continue;
            }
        }

        let fks = catalog.foreign_keys_between(from.as_pair(), to.as_pair());
        let fk = match fks.len() {
            0 => {
                return Err(ConfigError::UnreachableNode {
                    parent: from.to_string(),
                    child: to.to_string(),
                });
            }
            1 => fks[0],
            _ => {
                return Err(ConfigError::AmbiguousForeignKey {
                    parent: from.to_string(),
                    child: to.to_string(),
                });
            }
        };

        // Orient the constraint so `on` always pairs (from_col, to_col).
        let on = if fk.constrained() == to.as_pair() {
            fk.referenced_columns
                .iter()
                .cloned()
                .zip(fk.columns.iter().cloned())
                .collect()
        } else {
            fk.columns
                .iter()
                .cloned()
                .zip(fk.referenced_columns.iter().cloned())
                .collect()
        };

        steps.push(JoinStep {
            from: from.clone(),
            to: to.clone(),
            on,
        });
    }

    Ok(steps)
}

/// A chain that revisits a table loops back on itself.
fn detect_chain_cycle(chain: &[TableRef]) -> Result<(), ConfigError> {
    for pair in chain.windows(2) {
        if pair[0] == pair[1] {
            return Err(ConfigError::CycleDetected(pair[0].to_string()));
        }
    }

    let mut graph: DiGraph<&TableRef, ()> = DiGraph::new();
    let mut indices = BTreeMap::new();
    for table in chain {
        indices
            .entry(table)
            .or_insert_with(|| graph.add_node(table));
    }
    for pair in chain.windows(2) {
        graph.add_edge(indices[&pair[0]], indices[&pair[1]], ());
    }

    for scc in tarjan_scc(&graph) {
        if scc.len() > 1 {
            return Err(ConfigError::CycleDetected(graph[scc[0]].to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::fixtures::books_catalog;
    use crate::schema::parse;

    pub(crate) const BOOKS_SCHEMA: &str = r#"
    [
      {
        "database": "books",
        "nodes": {
          "table": "book",
          "columns": ["isbn", "title", "description"],
          "children": [
            {
              "table": "author",
              "label": "authors",
              "columns": ["name"],
              "relationship": {
                "variant": "scalar",
                "type": "one_to_many",
                "through_tables": ["book_author"]
              }
            }
          ]
        }
      }
    ]
    "#;

    pub(crate) fn books_tree() -> Tree {
        let syncs = parse(BOOKS_SCHEMA).unwrap();
        Tree::build(&syncs[0], &books_catalog()).unwrap()
    }

    #[test]
    fn test_build_books_tree() {
        let tree = books_tree();
        assert!(!tree.is_empty());
        assert_eq!(tree.len(), 2);
        let root = tree.root();
        assert_eq!(root.table, "book");
        assert_eq!(root.primary_key, vec!["isbn"]);
        assert!(root.is_root());

        let author = tree.node(root.children[0]);
        assert_eq!(author.label, "authors");
        assert_eq!(
            author.relationship,
            Some(Relationship {
                variant: Variant::Scalar,
                kind: RelKind::OneToMany
            })
        );
        assert_eq!(author.scalar_column().column, "name");
    }

    #[test]
    fn test_join_plan_through_table() {
        let tree = books_tree();
        let author = tree.node(tree.root().children[0]);
        assert_eq!(author.join_plan.len(), 2);

        let first = &author.join_plan[0];
        assert_eq!(first.from.table, "book");
        assert_eq!(first.to.table, "book_author");
        assert_eq!(first.on, vec![("isbn".to_string(), "book_isbn".to_string())]);

        let second = &author.join_plan[1];
        assert_eq!(second.from.table, "book_author");
        assert_eq!(second.to.table, "author");
        assert_eq!(second.on, vec![("author_id".to_string(), "id".to_string())]);
    }

    #[test]
    fn test_root_plan_matches_join_plans() {
        let tree = books_tree();
        let author_id = tree.root().children[0];
        assert_eq!(tree.root_plan(author_id), tree.node(author_id).join_plan);
        assert!(tree.root_plan(0).is_empty());
    }

    #[test]
    fn test_tables_include_through_tables() {
        let tree = books_tree();
        let tables: Vec<String> = tree.tables().iter().map(|t| t.table.clone()).collect();
        assert_eq!(tables, vec!["author", "book", "book_author"]);
    }

    #[test]
    fn test_unknown_table() {
        let syncs = parse(
            r#"[{"database": "books", "nodes": {"table": "missing"}}]"#,
        )
        .unwrap();
        let err = Tree::build(&syncs[0], &books_catalog()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTable { table, .. } if table == "missing"));
    }

    #[test]
    fn test_unknown_schema() {
        let syncs = parse(
            r#"[{"database": "books", "nodes": {"table": "book", "schema": "nope"}}]"#,
        )
        .unwrap();
        let err = Tree::build(&syncs[0], &books_catalog()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSchema(s) if s == "nope"));
    }

    #[test]
    fn test_unknown_column() {
        let syncs = parse(
            r#"[{"database": "books", "nodes": {"table": "book", "columns": ["nope"]}}]"#,
        )
        .unwrap();
        let err = Tree::build(&syncs[0], &books_catalog()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownColumn { column, .. } if column == "nope"));
    }

    #[test]
    fn test_missing_relationship() {
        let syncs = parse(
            r#"[{"database": "books",
                 "nodes": {"table": "book",
                           "children": [{"table": "publisher"}]}}]"#,
        )
        .unwrap();
        let err = Tree::build(&syncs[0], &books_catalog()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRelationship { table } if table == "publisher"));
    }

    #[test]
    fn test_relationship_requires_both_variant_and_type() {
        let syncs = parse(
            r#"[{"database": "books",
                 "nodes": {"table": "book",
                           "children": [{"table": "publisher",
                                         "relationship": {"variant": "object"}}]}}]"#,
        )
        .unwrap();
        let err = Tree::build(&syncs[0], &books_catalog()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRelationship { .. }));
    }

    #[test]
    fn test_unreachable_node() {
        // author is not directly connected to book; without the through
        // table there is no foreign key path.
        let syncs = parse(
            r#"[{"database": "books",
                 "nodes": {"table": "book",
                           "children": [{"table": "author",
                                         "relationship": {"variant": "object",
                                                          "type": "one_to_many"}}]}}]"#,
        )
        .unwrap();
        let err = Tree::build(&syncs[0], &books_catalog()).unwrap_err();
        assert!(matches!(err, ConfigError::UnreachableNode { .. }));
    }

    #[test]
    fn test_cycle_detected() {
        let syncs = parse(
            r#"[{"database": "books",
                 "nodes": {"table": "book",
                           "children": [{"table": "author",
                                         "relationship": {"variant": "scalar",
                                                          "type": "one_to_many",
                                                          "through_tables": ["book_author", "book", "book_author"]}}]}}]"#,
        )
        .unwrap();
        let err = Tree::build(&syncs[0], &books_catalog()).unwrap_err();
        assert!(matches!(err, ConfigError::CycleDetected(_)));
    }

    #[test]
    fn test_ambiguous_foreign_key() {
        let mut catalog = books_catalog();
        // A second constraint between book_author and book makes the hop
        // ambiguous.
        let mut dup = catalog.foreign_keys[0].clone();
        dup.name = "book_author_book_isbn_fkey2".to_string();
        catalog.foreign_keys.push(dup);

        let syncs = parse(BOOKS_SCHEMA).unwrap();
        let err = Tree::build(&syncs[0], &catalog).unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousForeignKey { .. }));
    }

    #[test]
    fn test_explicit_foreign_key_override() {
        let mut catalog = books_catalog();
        let mut dup = catalog.foreign_keys[2].clone();
        dup.name = "book_publisher_alt_fkey".to_string();
        catalog.foreign_keys.push(dup);

        let syncs = parse(
            r#"[{"database": "books",
                 "nodes": {"table": "book",
                           "children": [{"table": "publisher",
                                         "relationship": {"variant": "object",
                                                          "type": "one_to_one",
                                                          "foreign_key": {"parent": ["publisher_id"],
                                                                          "child": ["id"]}}}]}}]"#,
        )
        .unwrap();
        let tree = Tree::build(&syncs[0], &catalog).unwrap();
        let publisher = tree.node(tree.root().children[0]);
        assert_eq!(
            publisher.join_plan[0].on,
            vec![("publisher_id".to_string(), "id".to_string())]
        );
    }

    #[test]
    fn test_duplicate_sibling_labels() {
        let syncs = parse(
            r#"[{"database": "books",
                 "nodes": {"table": "book",
                           "children": [
                             {"table": "publisher", "label": "extra",
                              "relationship": {"variant": "object", "type": "one_to_one"}},
                             {"table": "author", "label": "extra",
                              "relationship": {"variant": "scalar", "type": "one_to_many",
                                               "through_tables": ["book_author"]}}]}}]"#,
        )
        .unwrap();
        let err = Tree::build(&syncs[0], &books_catalog()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSchema(_)));
    }

    #[test]
    fn test_root_relationship_rejected() {
        let syncs = parse(
            r#"[{"database": "books",
                 "nodes": {"table": "book",
                           "relationship": {"variant": "object", "type": "one_to_one"}}}]"#,
        )
        .unwrap();
        let err = Tree::build(&syncs[0], &books_catalog()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSchema(_)));
    }

    #[test]
    fn test_empty_columns_project_all() {
        let syncs = parse(r#"[{"database": "books", "nodes": {"table": "book"}}]"#).unwrap();
        let tree = Tree::build(&syncs[0], &books_catalog()).unwrap();
        let keys: Vec<&str> = tree.root().columns.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["isbn", "title", "description", "publisher_id"]);
    }

    #[test]
    fn test_projection_applies_rename_and_child_labels() {
        let syncs = parse(
            r#"[{"database": "books",
                 "nodes": {"table": "book",
                           "columns": ["isbn", "title"],
                           "transform": {"rename": {"isbn": "book_isbn"}},
                           "children": [
                             {"table": "author", "label": "authors", "columns": ["name"],
                              "relationship": {"variant": "scalar", "type": "one_to_many",
                                               "through_tables": ["book_author"]}}]}}]"#,
        )
        .unwrap();
        let tree = Tree::build(&syncs[0], &books_catalog()).unwrap();
        assert_eq!(tree.projection(0), vec!["book_isbn", "title", "authors"]);
    }

    #[test]
    fn test_nodes_for_table() {
        let tree = books_tree();
        assert_eq!(tree.nodes_for_table("public", "book"), &[0]);
        assert_eq!(tree.nodes_for_table("public", "author"), &[1]);
        assert!(tree.nodes_for_table("public", "book_author").is_empty());
    }

    #[test]
    fn test_scalar_arity_enforced() {
        // book_author projects two non-key columns; a scalar relationship
        // needs exactly one.
        let syncs = parse(
            r#"[{"database": "books",
                 "nodes": {"table": "book",
                           "children": [{"table": "book_author",
                                         "relationship": {"variant": "scalar",
                                                          "type": "one_to_many"}}]}}]"#,
        )
        .unwrap();
        let err = Tree::build(&syncs[0], &books_catalog()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSchema(_)));

        // Projecting all of author's columns leaves id + name; the primary
        // key does not count, so the scalar arity holds.
        let syncs = parse(
            r#"[{"database": "books",
                 "nodes": {"table": "book",
                           "children": [{"table": "author",
                                         "relationship": {"variant": "scalar",
                                                          "type": "one_to_many",
                                                          "through_tables": ["book_author"]}}]}}]"#,
        )
        .unwrap();
        assert!(Tree::build(&syncs[0], &books_catalog()).is_ok());
    }

    #[test]
    fn test_table_without_primary_key_rejected() {
        let mut catalog = books_catalog();
        catalog
            .tables
            .iter_mut()
            .find(|t| t.name == "book")
            .unwrap()
            .primary_key = None;
        let syncs = parse(r#"[{"database": "books", "nodes": {"table": "book"}}]"#).unwrap();
        let err = Tree::build(&syncs[0], &catalog).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSchema(_)));
    }
}
