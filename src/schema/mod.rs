//! The schema document: a list of sync definitions, each binding a tree of
//! tables rooted at a pivot to one target index.
//!
//! Parsing is strict. Unknown keys anywhere in the document are rejected as
//! `InvalidSchema`; semantic validation against the reflected catalog
//! happens later in `crate::tree`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncDef {
    /// Source database name.
    pub database: String,
    /// Target index; defaults to the database name.
    #[serde(default)]
    pub index: Option<String>,
    /// Pass-through to the index; consumed by the mapping collaborator.
    #[serde(default)]
    pub mappings: Option<JsonValue>,
    #[serde(default)]
    pub settings: Option<JsonValue>,
    /// Plugin names applied in order after transforms, by the plugin host.
    #[serde(default)]
    pub plugins: Vec<String>,
    /// Root node of the document tree.
    pub nodes: NodeDef,
}

impl SyncDef {
    pub fn index(&self) -> &str {
        self.index.as_deref().unwrap_or(&self.database)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDef {
    pub table: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Subset of columns to project; empty means all columns. Entries may be
    /// JSON-path expressions (`col->key`, `col->key->0`, `col#>{a,b}->0`).
    #[serde(default)]
    pub columns: Vec<String>,
    /// Key this node appears under in the parent document; defaults to table.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub relationship: Option<RelationshipDef>,
    #[serde(default)]
    pub transform: Option<TransformDef>,
    #[serde(default)]
    pub children: Vec<NodeDef>,
}

impl NodeDef {
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.table)
    }
}

fn default_schema() -> String {
    "public".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationshipDef {
    #[serde(default)]
    pub variant: Option<Variant>,
    #[serde(rename = "type", default)]
    pub kind: Option<RelKind>,
    #[serde(default)]
    pub through_tables: Vec<String>,
    /// Explicit override when more than one foreign key connects the two
    /// tables.
    #[serde(default)]
    pub foreign_key: Option<ForeignKeyDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Object,
    Scalar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelKind {
    OneToOne,
    OneToMany,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForeignKeyDef {
    pub parent: Vec<String>,
    pub child: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformDef {
    /// Old key -> new key.
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    /// Column -> substring -> replacement, applied to string values only.
    #[serde(default)]
    pub replace: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub concat: Vec<ConcatDef>,
    /// Key -> `$root.a.b` destination path.
    #[serde(rename = "move", default)]
    pub relocate: BTreeMap<String, String>,
    /// Type hints passed through to the index mapping.
    #[serde(default)]
    pub mapping: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConcatDef {
    pub columns: Vec<String>,
    pub destination: String,
    #[serde(default)]
    pub delimiter: String,
}

/// Parse the schema document from a file.
pub fn load(path: &Path) -> Result<Vec<SyncDef>, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::InvalidSchema(format!("{}: {e}", path.display())))?;
    parse(&raw)
}

/// Parse the schema document from its JSON text.
pub fn parse(raw: &str) -> Result<Vec<SyncDef>, ConfigError> {
    let syncs: Vec<SyncDef> =
        serde_json::from_str(raw).map_err(|e| ConfigError::InvalidSchema(e.to_string()))?;
    if syncs.is_empty() {
        return Err(ConfigError::InvalidSchema(
            "schema document declares no syncs".to_string(),
        ));
    }
    Ok(syncs)
}
