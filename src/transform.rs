//! Document transforms.
//!
//! Rules apply to a node's projected row before emission, in a fixed order:
//! rename, replace, concat, move, mapping. Mapping entries are type hints
//! passed through to the index and never touch the document itself.

use std::collections::BTreeMap;

use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::error::DataError;
use crate::schema::TransformDef;

#[derive(Debug, Clone, PartialEq)]
pub struct ConcatRule {
    pub columns: Vec<String>,
    pub destination: String,
    pub delimiter: String,
}

#[derive(Debug, Clone, Default)]
pub struct TransformSet {
    pub rename: BTreeMap<String, String>,
    pub replace: BTreeMap<String, BTreeMap<String, String>>,
    pub concat: Vec<ConcatRule>,
    /// Key -> destination label path relative to `$root`.
    pub relocate: BTreeMap<String, Vec<String>>,
    pub mapping: BTreeMap<String, JsonValue>,
}

/// A key extracted by a `move` rule, waiting to be inserted at its
/// destination node once the whole document has been transformed.
#[derive(Debug, Clone, PartialEq)]
pub struct Relocation {
    pub key: String,
    pub path: Vec<String>,
    pub value: JsonValue,
}

impl TransformSet {
    pub fn from_def(def: Option<&TransformDef>) -> Result<Self, DataError> {
        let Some(def) = def else {
            return Ok(Self::default());
        };

        let mut relocate = BTreeMap::new();
        for (key, path) in &def.relocate {
            relocate.insert(key.clone(), parse_root_path(path)?);
        }

        Ok(Self {
            rename: def.rename.clone(),
            replace: def.replace.clone(),
            concat: def
                .concat
                .iter()
                .map(|c| ConcatRule {
                    columns: c.columns.clone(),
                    destination: c.destination.clone(),
                    delimiter: c.delimiter.clone(),
                })
                .collect(),
            relocate,
            mapping: def.mapping.clone(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rename.is_empty()
            && self.replace.is_empty()
            && self.concat.is_empty()
            && self.relocate.is_empty()
    }

    /// Rename a projected key, honoring the rename rules.
    pub fn renamed<'a>(&'a self, key: &'a str) -> &'a str {
        self.rename.get(key).map(String::as_str).unwrap_or(key)
    }

    /// Apply the rules to one materialized row. `allow_moves` is false when
    /// the row is an element of a one_to_many array; relocating out of an
    /// array element has no well-defined destination key, so the rule is
    /// skipped with a warning.
    pub fn apply(
        &self,
        row: &mut Map<String, JsonValue>,
        allow_moves: bool,
    ) -> Result<Vec<Relocation>, DataError> {
        for (old, new) in &self.rename {
            let value = row
                .remove(old)
                .ok_or_else(|| DataError::TransformRuleMissingColumn(old.clone()))?;
            row.insert(new.clone(), value);
        }

        for (key, substitutions) in &self.replace {
            let value = row
                .get_mut(key)
                .ok_or_else(|| DataError::TransformRuleMissingColumn(key.clone()))?;
            if let JsonValue::String(s) = value {
                let mut replaced = s.clone();
                for (from, to) in substitutions {
                    replaced = replaced.replace(from, to);
                }
                *value = JsonValue::String(replaced);
            }
        }

        for rule in &self.concat {
            let joined = rule
                .columns
                .iter()
                .map(|c| row.get(c).map(value_as_text).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(&rule.delimiter);
            row.insert(rule.destination.clone(), JsonValue::String(joined));
        }

        let mut relocations = Vec::new();
        for (key, path) in &self.relocate {
            if !allow_moves {
                warn!(key = %key, "skipping move rule on array-materialized node");
                continue;
            }
            let value = row
                .remove(key)
                .ok_or_else(|| DataError::TransformRuleMissingColumn(key.clone()))?;
            relocations.push(Relocation {
                key: key.clone(),
                path: path.clone(),
                value,
            });
        }

        Ok(relocations)
    }
}

/// Insert a relocated key under the node addressed by its label path,
/// creating intermediate objects where the document has none.
pub fn insert_relocation(doc: &mut JsonValue, relocation: Relocation) {
    let mut target = doc;
    for label in &relocation.path {
        if !target.is_object() {
            *target = JsonValue::Object(Map::new());
        }
        target = target
            .as_object_mut()
            .expect("object ensured above")
            .entry(label.clone())
            .or_insert_with(|| JsonValue::Object(Map::new()));
    }
    if !target.is_object() {
        *target = JsonValue::Object(Map::new());
    }
    target
        .as_object_mut()
        .expect("object ensured above")
        .insert(relocation.key, relocation.value);
}

/// Apply every node's transform rules to a fetched document, walking the
/// tree by label. Relocations are collected first and inserted after the
/// walk so a move can target a node that has not been visited yet.
pub fn apply_document(tree: &crate::tree::Tree, doc: &mut JsonValue) -> Result<(), DataError> {
    let mut moves = Vec::new();
    apply_node(tree, tree.root().id, doc, true, &mut moves)?;
    for relocation in moves {
        insert_relocation(doc, relocation);
    }
    Ok(())
}

fn apply_node(
    tree: &crate::tree::Tree,
    id: crate::tree::NodeId,
    value: &mut JsonValue,
    single: bool,
    moves: &mut Vec<Relocation>,
) -> Result<(), DataError> {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                apply_node(tree, id, item, false, moves)?;
            }
        }
        JsonValue::Object(map) => {
            let node = tree.node(id);
            if !node.transform.is_empty() {
                moves.extend(node.transform.apply(map, single)?);
            }
            for &child in &node.children {
                let label = &tree.node(child).label;
                if let Some(child_value) = map.get_mut(label) {
                    apply_node(tree, child, child_value, single, moves)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn parse_root_path(path: &str) -> Result<Vec<String>, DataError> {
    let mut parts = path.split('.');
    if parts.next() != Some("$root") {
        return Err(DataError::UnsupportedJsonPath(path.to_string()));
    }
    let labels: Vec<String> = parts.map(str::to_string).collect();
    if labels.iter().any(String::is_empty) {
        return Err(DataError::UnsupportedJsonPath(path.to_string()));
    }
    Ok(labels)
}

fn value_as_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
