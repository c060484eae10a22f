//! Graph entity representation
//!
//! Nodes and relationships share one shape: an id, a type name and a map of
//! persisted property values. Relationships additionally carry their label
//! and endpoint ids.

use crate::value::EntityRef;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Whether an entity is a node or a relationship between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EntityKind {
    Node,
    #[serde(rename_all = "camelCase")]
    Relationship {
        /// Relationship label, e.g. `has`
        rel: String,
        source_id: String,
        target_id: String,
    },
}

/// A stored graph entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    /// Schema type (nodes) or relationship definition name (relationships)
    #[serde(rename = "type")]
    pub type_name: String,
    pub kind: EntityKind,
    /// Persisted property values keyed by property name
    pub properties: BTreeMap<String, JsonValue>,
    /// Creation sequence, keeps query results in insertion order
    #[serde(skip)]
    pub seq: u64,
}

impl Entity {
    pub fn node(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            kind: EntityKind::Node,
            properties: BTreeMap::new(),
            seq: 0,
        }
    }

    pub fn is_node(&self) -> bool {
        matches!(self.kind, EntityKind::Node)
    }

    pub fn is_relationship(&self) -> bool {
        !self.is_node()
    }

    /// Source node id for relationships, `None` for nodes
    pub fn source_id(&self) -> Option<&str> {
        match &self.kind {
            EntityKind::Relationship { source_id, .. } => Some(source_id),
            EntityKind::Node => None,
        }
    }

    /// Target node id for relationships, `None` for nodes
    pub fn target_id(&self) -> Option<&str> {
        match &self.kind {
            EntityKind::Relationship { target_id, .. } => Some(target_id),
            EntityKind::Node => None,
        }
    }

    pub fn property(&self, key: &str) -> Option<&JsonValue> {
        self.properties.get(key)
    }

    pub fn name(&self) -> Option<&str> {
        self.properties.get("name").and_then(JsonValue::as_str)
    }

    pub fn to_ref(&self) -> EntityRef {
        EntityRef {
            id: self.id.clone(),
            type_name: self.type_name.clone(),
            name: self.name().map(str::to_string),
        }
    }
}
