//! Relationship accessors
//!
//! Every relationship generates one accessor on each endpoint type, singular
//! or collection depending on cardinality. Relationship entities expose their
//! endpoints through `sourceNode` and `targetNode`. All of them return
//! null/empty when attached to an entity of the wrong kind.

use crate::graph::{Direction, Entity, GraphTransaction};
use crate::property::{PropertyDescriptor, PropertyError, PropertyInfo, ReadContext, WriteContext};
use crate::value::Value;
use std::collections::HashSet;

/// How an accessor reaches the other side of its relationship
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationLink {
    /// Relationship definition name (the relationship entity type)
    pub relationship: String,
    pub rel: String,
    /// `Outgoing` when the accessor lives on the source type
    pub direction: Direction,
    pub other_type: String,
    /// This accessor is a collection
    pub many: bool,
    /// The other side's accessor is a collection
    pub other_many: bool,
    /// Writing through this side may create missing related entities
    pub cascade_create: bool,
    /// Deleting this side deletes the related entities
    pub cascade_delete: bool,
}

impl RelationLink {
    fn opposite(&self) -> Direction {
        match self.direction {
            Direction::Outgoing => Direction::Incoming,
            Direction::Incoming => Direction::Outgoing,
        }
    }

    fn other_end(&self, relationship: &Entity) -> Option<String> {
        let id = match self.direction {
            Direction::Outgoing => relationship.target_id(),
            Direction::Incoming => relationship.source_id(),
        };
        id.map(str::to_string)
    }

    /// `(relationship id, related node id)` pairs for a node
    pub fn related(&self, graph: &dyn GraphTransaction, node_id: &str) -> Vec<(String, String)> {
        graph
            .relationships(node_id, &self.relationship, self.direction)
            .into_iter()
            .filter_map(|r| self.other_end(r).map(|other| (r.id.clone(), other)))
            .collect()
    }
}

/// Singular or collection accessor for related nodes
#[derive(Debug)]
pub struct RelatedNodeProperty {
    info: PropertyInfo,
    link: RelationLink,
}

impl RelatedNodeProperty {
    pub fn new(name: &str, declaring_type: &str, link: RelationLink) -> Self {
        let kind_name = if link.many {
            format!("{}[]", link.other_type)
        } else {
            link.other_type.clone()
        };
        let mut info = PropertyInfo::new(name, declaring_type, kind_name);
        info.is_collection = link.many;
        Self { info, link }
    }

    fn empty(&self) -> Value {
        if self.link.many {
            Value::List(Vec::new())
        } else {
            Value::Null
        }
    }

    fn validate_target(&self, ctx: &WriteContext<'_>, id: &str) -> Result<(), PropertyError> {
        let allowed = ctx.schema.subtypes_of(&self.link.other_type);
        match ctx.graph.get(id) {
            Some(entity) if entity.is_node() && allowed.iter().any(|t| t == &entity.type_name) => Ok(()),
            Some(entity) => Err(PropertyError::invalid(self.info.token(
                "invalid_related_type",
                format!("{} is a {}, expected {}", id, entity.type_name, self.link.other_type),
            ))),
            None => Err(PropertyError::invalid(
                self.info.token("not_found", format!("no entity with id {}", id)),
            )),
        }
    }
}

/// Ids referenced by a written value: entities, id strings, `{id: ...}` maps or lists of those
pub(crate) fn referenced_ids(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::Entity(entity) => vec![entity.id.clone()],
        Value::String(id) if !id.is_empty() => vec![id.clone()],
        Value::Map(map) => map
            .get("id")
            .and_then(Value::as_str)
            .map(|id| vec![id.to_string()])
            .unwrap_or_default(),
        Value::List(items) => items.iter().flat_map(referenced_ids).collect(),
        _ => Vec::new(),
    }
}

impl PropertyDescriptor for RelatedNodeProperty {
    fn info(&self) -> &PropertyInfo {
        &self.info
    }

    fn read(&self, ctx: &ReadContext<'_>, entity: &Entity) -> Result<Value, PropertyError> {
        if !entity.is_node() {
            return Ok(self.empty());
        }

        let related: Vec<Value> = self
            .link
            .related(ctx.graph, &entity.id)
            .into_iter()
            .filter_map(|(_, other)| ctx.graph.get(&other).map(|e| Value::Entity(e.to_ref())))
            .collect();

        Ok(if self.link.many {
            Value::List(related)
        } else {
            related.into_iter().next().unwrap_or_default()
        })
    }

    fn write(&self, ctx: &mut WriteContext<'_>, entity_id: &str, value: Value) -> Result<(), PropertyError> {
        match ctx.graph.get(entity_id) {
            Some(entity) if entity.is_node() => {}
            Some(_) => {
                tracing::debug!("Ignoring write of {} on relationship {}", self.info.name, entity_id);
                return Ok(());
            }
            None => return Err(crate::graph::GraphError::NotFound(entity_id.to_string()).into()),
        }

        let mut wanted = referenced_ids(&value);
        let mut seen = HashSet::new();
        wanted.retain(|id| seen.insert(id.clone()));
        if !self.link.many && wanted.len() > 1 {
            return Err(PropertyError::invalid(self.info.token(
                "too_many_related",
                format!("expected at most one {}", self.link.other_type),
            )));
        }
        for id in &wanted {
            self.validate_target(ctx, id)?;
        }

        let existing = self.link.related(ctx.graph, entity_id);
        for (rel_id, other) in &existing {
            if !wanted.contains(other) {
                ctx.graph.delete(rel_id)?;
            }
        }

        for id in wanted {
            if existing.iter().any(|(_, other)| other == &id) {
                continue;
            }
            if !self.link.other_many {
                let previous: Vec<String> = ctx
                    .graph
                    .relationships(&id, &self.link.relationship, self.link.opposite())
                    .iter()
                    .map(|r| r.id.clone())
                    .collect();
                for rel_id in previous {
                    ctx.graph.delete(&rel_id)?;
                }
            }
            let (source, target) = match self.link.direction {
                Direction::Outgoing => (entity_id, id.as_str()),
                Direction::Incoming => (id.as_str(), entity_id),
            };
            ctx.graph
                .create_relationship(&self.link.relationship, &self.link.rel, source, target)?;
        }

        Ok(())
    }

    fn relation(&self) -> Option<&RelationLink> {
        Some(&self.link)
    }
}

/// Which endpoint of a relationship entity a property exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Source,
    Target,
}

/// `sourceNode` / `targetNode` on relationship entities
#[derive(Debug)]
pub struct EndpointProperty {
    info: PropertyInfo,
    end: Endpoint,
}

impl EndpointProperty {
    pub fn new(declaring_type: &str, end: Endpoint, node_type: &str) -> Self {
        let name = match end {
            Endpoint::Source => "sourceNode",
            Endpoint::Target => "targetNode",
        };
        let mut info = PropertyInfo::new(name, declaring_type, node_type);
        info.is_builtin = true;
        Self { info, end }
    }
}

impl PropertyDescriptor for EndpointProperty {
    fn info(&self) -> &PropertyInfo {
        &self.info
    }

    fn read(&self, ctx: &ReadContext<'_>, entity: &Entity) -> Result<Value, PropertyError> {
        let id = match self.end {
            Endpoint::Source => entity.source_id(),
            Endpoint::Target => entity.target_id(),
        };
        Ok(id
            .and_then(|id| ctx.graph.get(id))
            .map(|node| Value::Entity(node.to_ref()))
            .unwrap_or_default())
    }

    fn write(&self, _ctx: &mut WriteContext<'_>, _entity_id: &str, _value: Value) -> Result<(), PropertyError> {
        Err(PropertyError::ReadOnly(self.info.name.clone()))
    }
}
