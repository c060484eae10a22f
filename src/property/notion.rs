//! Notion properties
//!
//! A notion surfaces related entities through some of their own properties,
//! e.g. the ids of all tasks of a project. The wrapped relationship accessor
//! is used purely as a projection; writes resolve the given key values back
//! to entities (optionally creating them) and delegate to the accessor.

use crate::graph::Entity;
use crate::property::{PropertyDescriptor, PropertyError, PropertyInfo, ReadContext, WriteContext};
use crate::value::Value;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct NotionProperty {
    info: PropertyInfo,
    base: String,
    keys: Vec<String>,
    other_type: String,
    create_if_missing: bool,
}

impl NotionProperty {
    pub fn new(
        name: &str,
        declaring_type: &str,
        base: &str,
        keys: Vec<String>,
        other_type: &str,
        many: bool,
        create_if_missing: bool,
    ) -> Self {
        let mut info = PropertyInfo::new(name, declaring_type, if many { "Notion[]" } else { "Notion" });
        info.is_collection = many;
        Self {
            info,
            base: base.to_string(),
            keys,
            other_type: other_type.to_string(),
            create_if_missing,
        }
    }

    fn project(&self, ctx: &ReadContext<'_>, related: &Value) -> Result<Value, PropertyError> {
        let Value::Entity(reference) = related else {
            return Ok(Value::Null);
        };
        let Some(entity) = ctx.graph.get(&reference.id) else {
            return Ok(Value::Null);
        };

        let mut projected = BTreeMap::new();
        for key in &self.keys {
            let value = match ctx.schema.property(&entity.type_name, key) {
                Some(descriptor) => descriptor.read(ctx, entity)?,
                None => entity.property(key).map(Value::from_json).unwrap_or_default(),
            };
            if self.keys.len() == 1 {
                return Ok(value);
            }
            projected.insert(key.clone(), value);
        }
        Ok(Value::Map(projected))
    }

    /// Find (or create) the related entity identified by `element`
    fn resolve(&self, ctx: &mut WriteContext<'_>, element: &Value, may_create: bool) -> Result<Option<String>, PropertyError> {
        if let Value::Entity(reference) = element {
            return Ok(Some(reference.id.clone()));
        }

        let criteria: Vec<(String, Value)> = match (self.keys.as_slice(), element) {
            ([key], value) => vec![(key.clone(), value.clone())],
            (keys, Value::Map(map)) => keys
                .iter()
                .filter_map(|k| map.get(k).map(|v| (k.clone(), v.clone())))
                .collect(),
            _ => Vec::new(),
        };
        if criteria.is_empty() {
            return Err(PropertyError::invalid(self.info.token(
                "invalid_notion_value",
                format!("cannot identify a {} from {:?}", self.other_type, element),
            )));
        }

        let schema = ctx.schema;
        let types = schema.subtypes_of(&self.other_type);
        let mut stored_criteria = Vec::with_capacity(criteria.len());
        for (key, value) in &criteria {
            let stored = match schema.property(&self.other_type, key) {
                Some(descriptor) if descriptor.info().stored => descriptor.to_storage_form(value)?,
                _ => Some(value.to_json()),
            };
            stored_criteria.push((key.as_str(), stored.unwrap_or(JsonValue::Null)));
        }

        let (first_key, first_value) = &stored_criteria[0];
        let found = ctx
            .graph
            .find(types, first_key, first_value)
            .into_iter()
            .find(|candidate| {
                stored_criteria[1..].iter().all(|(key, value)| {
                    (*key == "id" && value.as_str() == Some(candidate.id.as_str()))
                        || candidate.property(key) == Some(value)
                })
            })
            .map(|entity| entity.id.clone());
        if found.is_some() {
            return Ok(found);
        }

        if !may_create || criteria.iter().any(|(key, _)| key == "id") {
            return Err(PropertyError::invalid(self.info.token(
                "not_found",
                format!("no {} matching {:?}", self.other_type, element),
            )));
        }

        let input: Map<String, JsonValue> = criteria
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect();
        tracing::debug!("✨ Creating {} for notion {}", self.other_type, self.info.name);
        ctx.create(&self.other_type, &input).map(Some)
    }
}

impl PropertyDescriptor for NotionProperty {
    fn info(&self) -> &PropertyInfo {
        &self.info
    }

    fn read(&self, ctx: &ReadContext<'_>, entity: &Entity) -> Result<Value, PropertyError> {
        let empty = if self.info.is_collection {
            Value::List(Vec::new())
        } else {
            Value::Null
        };
        if !entity.is_node() {
            return Ok(empty);
        }
        let Some(base) = ctx.schema.property(&entity.type_name, &self.base) else {
            return Ok(empty);
        };

        match base.read(ctx, entity)? {
            Value::List(related) => {
                let mut projected = Vec::with_capacity(related.len());
                for item in &related {
                    projected.push(self.project(ctx, item)?);
                }
                Ok(Value::List(projected))
            }
            single => self.project(ctx, &single),
        }
    }

    fn write(&self, ctx: &mut WriteContext<'_>, entity_id: &str, value: Value) -> Result<(), PropertyError> {
        let schema = ctx.schema;
        let type_name = match ctx.graph.get(entity_id) {
            Some(entity) if entity.is_node() => entity.type_name.clone(),
            Some(_) => return Ok(()),
            None => return Err(crate::graph::GraphError::NotFound(entity_id.to_string()).into()),
        };
        let Some(base) = schema.property(&type_name, &self.base) else {
            return Err(PropertyError::invalid(
                self.info.token("unknown_base", format!("{} has no property {}", type_name, self.base)),
            ));
        };
        let may_create = self.create_if_missing || base.relation().is_some_and(|link| link.cascade_create);

        let elements = match value {
            Value::List(items) => items,
            Value::Null => Vec::new(),
            single => vec![single],
        };

        let mut ids = Vec::with_capacity(elements.len());
        for element in elements.iter().filter(|e| !e.is_null()) {
            if let Some(id) = self.resolve(ctx, element, may_create)? {
                ids.push(Value::String(id));
            }
        }

        let target = if self.info.is_collection {
            Value::List(ids)
        } else {
            ids.into_iter().next().unwrap_or_default()
        };
        base.write(ctx, entity_id, target)
    }
}
