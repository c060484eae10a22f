//! Read/write contexts and entity operations
//!
//! A context pairs the caller's transaction with the compiled schema it was
//! opened against. Descriptors never reach storage any other way, so every
//! constraint check sees the same transactional view as the write itself.

use crate::graph::{Entity, GraphError, GraphTransaction};
use crate::property::{FunctionEvaluator, PropertyDescriptor, PropertyError};
use crate::schema::{CompiledSchema, TypeDescriptor};
use crate::value::Value;
use chrono::Utc;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;
use std::sync::Arc;

/// Built-in timestamps maintained on every write
const CREATED_DATE: &str = "createdDate";
const LAST_MODIFIED_DATE: &str = "lastModifiedDate";

/// Read access to entities through their compiled descriptors
pub struct ReadContext<'a> {
    pub graph: &'a dyn GraphTransaction,
    pub schema: &'a CompiledSchema,
    pub functions: Option<&'a dyn FunctionEvaluator>,
}

impl<'a> ReadContext<'a> {
    pub fn new(graph: &'a dyn GraphTransaction, schema: &'a CompiledSchema) -> Self {
        Self {
            graph,
            schema,
            functions: None,
        }
    }

    pub fn with_functions(mut self, functions: &'a dyn FunctionEvaluator) -> Self {
        self.functions = Some(functions);
        self
    }

    /// Read one property; unknown keys fall back to the raw stored value
    pub fn read(&self, entity: &Entity, key: &str) -> Result<Value, PropertyError> {
        match self.schema.property(&entity.type_name, key) {
            Some(descriptor) => descriptor.read(self, entity),
            None => Ok(entity.property(key).map(Value::from_json).unwrap_or_default()),
        }
    }

    /// Project an entity onto a view as a JSON object, in view order
    pub fn render(&self, entity: &Entity, view: &str) -> Result<Map<String, JsonValue>, PropertyError> {
        let members = self
            .schema
            .view_members(&entity.type_name, view)
            .ok_or_else(|| PropertyError::UnknownType(entity.type_name.clone()))?;

        let mut rendered = Map::new();
        for name in members {
            let value = self.read(entity, name)?;
            rendered.insert(name.clone(), value.to_json());
        }
        Ok(rendered)
    }
}

/// Write access; all mutations go through the descriptors
pub struct WriteContext<'a> {
    pub graph: &'a mut dyn GraphTransaction,
    pub schema: &'a CompiledSchema,
    pub functions: Option<&'a dyn FunctionEvaluator>,
}

impl<'a> WriteContext<'a> {
    pub fn new(graph: &'a mut dyn GraphTransaction, schema: &'a CompiledSchema) -> Self {
        Self {
            graph,
            schema,
            functions: None,
        }
    }

    pub fn with_functions(mut self, functions: &'a dyn FunctionEvaluator) -> Self {
        self.functions = Some(functions);
        self
    }

    /// Read view over the same transaction
    pub fn reader(&self) -> ReadContext<'_> {
        ReadContext {
            graph: &*self.graph,
            schema: self.schema,
            functions: self.functions,
        }
    }

    fn descriptor_for(&self, entity_id: &str, key: &str) -> Result<Arc<dyn PropertyDescriptor>, PropertyError> {
        let entity = self
            .graph
            .get(entity_id)
            .ok_or_else(|| GraphError::NotFound(entity_id.to_string()))?;
        self.schema
            .property(&entity.type_name, key)
            .cloned()
            .ok_or_else(|| {
                PropertyError::invalid(
                    crate::error::ErrorToken::new(&entity.type_name, "unknown_property").with_property(key),
                )
            })
    }

    fn touch(&mut self, entity_id: &str) -> Result<(), PropertyError> {
        let Ok(descriptor) = self.descriptor_for(entity_id, LAST_MODIFIED_DATE) else {
            return Ok(());
        };
        descriptor.write(self, entity_id, Value::Date(Utc::now()))
    }

    /// Write a domain value through the property's descriptor
    pub fn set(&mut self, entity_id: &str, key: &str, value: Value) -> Result<(), PropertyError> {
        let descriptor = self.descriptor_for(entity_id, key)?;
        descriptor.write(self, entity_id, value)?;
        if key != LAST_MODIFIED_DATE {
            self.touch(entity_id)?;
        }
        Ok(())
    }

    /// Write external (API) values; every failing property is reported
    pub fn set_input(&mut self, entity_id: &str, input: &Map<String, JsonValue>) -> Result<(), PropertyError> {
        let mut errors = Vec::new();
        for (key, raw) in input {
            if key == "id" || key == "type" {
                continue;
            }
            let result = self
                .descriptor_for(entity_id, key)
                .and_then(|descriptor| {
                    let value = descriptor.from_input_form(raw)?;
                    descriptor.write(self, entity_id, value)
                });
            match result {
                Ok(()) => {}
                Err(PropertyError::Validation(tokens)) => errors.extend(tokens),
                Err(e) => return Err(e),
            }
        }
        if !errors.is_empty() {
            return Err(PropertyError::Validation(errors));
        }
        self.touch(entity_id)
    }

    /// Create a node from external input, applying defaults and
    /// enforcing required properties
    pub fn create(&mut self, type_name: &str, input: &Map<String, JsonValue>) -> Result<String, PropertyError> {
        let schema = self.schema;
        let descriptor: &TypeDescriptor = schema
            .type_descriptor(type_name)
            .ok_or_else(|| PropertyError::UnknownType(type_name.to_string()))?;
        if descriptor.is_abstract {
            return Err(PropertyError::invalid(
                crate::error::ErrorToken::new(type_name, "abstract_type")
                    .with_detail(format!("{} cannot be instantiated", type_name)),
            ));
        }

        let id = self.graph.create_node(type_name);
        let now = Value::Date(Utc::now());
        for timestamp in [CREATED_DATE, LAST_MODIFIED_DATE] {
            if let Some(property) = descriptor.property(timestamp) {
                property.write(self, &id, now.clone())?;
            }
        }

        let mut errors = Vec::new();
        for (key, raw) in input {
            if key == "id" || key == "type" {
                continue;
            }
            let Some(property) = descriptor.property(key) else {
                errors.push(
                    crate::error::ErrorToken::new(type_name, "unknown_property")
                        .with_property(key)
                        .with_detail(format!("{} has no property {}", type_name, key)),
                );
                continue;
            };
            let result = property
                .from_input_form(raw)
                .and_then(|value| property.write(self, &id, value));
            match result {
                Ok(()) => {}
                Err(PropertyError::Validation(tokens)) => errors.extend(tokens),
                Err(e) => return Err(e),
            }
        }

        for (name, property) in &descriptor.properties {
            if input.contains_key(name) {
                continue;
            }
            if let Some(default) = property.default_value() {
                let value = property.from_input_form(&JsonValue::String(default.to_string()))?;
                property.write(self, &id, value)?;
            }
        }

        for (name, property) in &descriptor.properties {
            let info = property.info();
            if !info.required || !info.stored {
                continue;
            }
            let missing = self
                .graph
                .get(&id)
                .map_or(true, |entity| entity.property(name).is_none());
            let reported = errors
                .iter()
                .any(|t| t.property.as_deref() == Some(name.as_str()));
            if missing && !reported {
                errors.push(info.token("must_not_be_empty", "value is required"));
            }
        }

        if !errors.is_empty() {
            tracing::debug!("❌ Rejected new {}: {} error(s)", type_name, errors.len());
            return Err(PropertyError::Validation(errors));
        }
        Ok(id)
    }

    /// Delete an entity and whatever its relationships' cascading policy
    /// takes along. Returns every deleted id, relationships included.
    pub fn delete(&mut self, entity_id: &str) -> Result<Vec<String>, PropertyError> {
        if self.graph.get(entity_id).is_none() {
            return Err(GraphError::NotFound(entity_id.to_string()).into());
        }

        let schema = self.schema;
        let mut pending = vec![entity_id.to_string()];
        let mut visited = HashSet::new();
        let mut deleted = Vec::new();

        while let Some(id) = pending.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let Some(entity) = self.graph.get(&id) else {
                continue;
            };
            if entity.is_node() {
                if let Some(properties) = schema.properties_of(&entity.type_name) {
                    for property in properties.values() {
                        let Some(link) = property.relation().filter(|link| link.cascade_delete) else {
                            continue;
                        };
                        for (_, other) in link.related(&*self.graph, &id) {
                            pending.push(other);
                        }
                    }
                }
            }
            deleted.extend(self.graph.delete(&id)?);
        }

        tracing::debug!("🗑️ Deleted {} entities starting at {}", deleted.len(), entity_id);
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use crate::schema::{compile, Cardinality, Cascade, CompileEnv, NotionSpec, PropertyKind, SchemaModel};
    use serde_json::json;

    fn project_schema() -> CompiledSchema {
        let mut model = SchemaModel::builtin();
        {
            let project = model.add_type("Project");
            project.extends = Some("AbstractNode".to_string());
            project.add_property("code", PropertyKind::String).required().unique();
            project
                .add_property("budget", PropertyKind::Integer)
                .range(Some(0.0), Some(1000.0));
            project
                .add_property("status", PropertyKind::String)
                .default_value("open");
            project.add_property(
                "taskNames",
                PropertyKind::Notion(NotionSpec {
                    base: "tasks".to_string(),
                    keys: vec!["name".to_string()],
                    create_if_missing: true,
                }),
            );
            project.add_to_view("ui", &["id", "name", "code", "tasks"]);
        }
        model.add_type("Task").extends = Some("AbstractNode".to_string());
        model
            .relate("Project", "has", "Task", Cardinality::OneToMany)
            .named("project", "tasks")
            .cascade(Cascade::None, Cascade::SourceToTarget);
        model.add_type("Label").extends = Some("AbstractNode".to_string());
        model
            .relate("Project", "tagged", "Label", Cardinality::ManyToMany)
            .named("projects", "labels");

        compile(&model, &CompileEnv::default()).unwrap()
    }

    fn input(value: JsonValue) -> Map<String, JsonValue> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_create_applies_defaults_and_timestamps() {
        let schema = project_schema();
        let graph = MemoryGraph::new();
        let mut tx = graph.begin();
        let mut ctx = WriteContext::new(&mut tx, &schema);

        let id = ctx.create("Project", &input(json!({"code": "P1", "name": "First"}))).unwrap();
        let entity = ctx.graph.get(&id).unwrap();
        assert_eq!(entity.property("status"), Some(&json!("open")));
        assert!(entity.property("createdDate").is_some());
        assert!(entity.property("lastModifiedDate").is_some());
    }

    #[test]
    fn test_create_reports_every_failure() {
        let schema = project_schema();
        let graph = MemoryGraph::new();
        let mut tx = graph.begin();
        let mut ctx = WriteContext::new(&mut tx, &schema);

        let err = ctx
            .create("Project", &input(json!({"budget": 5000, "bogus": 1})))
            .unwrap_err();
        let PropertyError::Validation(tokens) = err else {
            panic!("expected validation error");
        };
        let names: Vec<&str> = tokens.iter().map(|t| t.token.as_str()).collect();
        assert!(names.contains(&"must_be_less_than"));
        assert!(names.contains(&"unknown_property"));
        assert!(names.contains(&"must_not_be_empty"));
    }

    #[test]
    fn test_unique_is_enforced_within_the_transaction() {
        let schema = project_schema();
        let graph = MemoryGraph::new();
        let mut tx = graph.begin();
        let mut ctx = WriteContext::new(&mut tx, &schema);

        ctx.create("Project", &input(json!({"code": "P1"}))).unwrap();
        let err = ctx.create("Project", &input(json!({"code": "P1"}))).unwrap_err();
        assert!(matches!(err, PropertyError::Validation(ref t) if t[0].token == "already_taken"));
    }

    #[test]
    fn test_unique_claims_race_across_transactions() {
        let schema = project_schema();
        let graph = MemoryGraph::new();
        let mut first = graph.begin();
        let mut second = graph.begin();

        WriteContext::new(&mut first, &schema)
            .create("Project", &input(json!({"code": "X"})))
            .unwrap();
        WriteContext::new(&mut second, &schema)
            .create("Project", &input(json!({"code": "X"})))
            .unwrap();

        first.commit().unwrap();
        assert!(matches!(second.commit(), Err(GraphError::Conflict(_))));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_abstract_types_cannot_be_created() {
        let schema = project_schema();
        let graph = MemoryGraph::new();
        let mut tx = graph.begin();
        let mut ctx = WriteContext::new(&mut tx, &schema);

        let err = ctx.create("AbstractNode", &Map::new()).unwrap_err();
        assert!(matches!(err, PropertyError::Validation(ref t) if t[0].token == "abstract_type"));
    }

    #[test]
    fn test_notion_creates_missing_tasks_and_projects_names() {
        let schema = project_schema();
        let graph = MemoryGraph::new();
        let mut tx = graph.begin();
        let mut ctx = WriteContext::new(&mut tx, &schema);

        let id = ctx
            .create("Project", &input(json!({"code": "P1", "taskNames": ["a", "b"]})))
            .unwrap();
        let reader = ctx.reader();
        let project = reader.graph.get(&id).unwrap();
        assert_eq!(
            reader.read(project, "taskNames").unwrap(),
            Value::List(vec![Value::from("a"), Value::from("b")])
        );
        let Value::List(tasks) = reader.read(project, "tasks").unwrap() else {
            panic!("tasks should be a collection");
        };
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn test_singular_side_moves_to_the_new_project() {
        let schema = project_schema();
        let graph = MemoryGraph::new();
        let mut tx = graph.begin();
        let mut ctx = WriteContext::new(&mut tx, &schema);

        let first = ctx.create("Project", &input(json!({"code": "A"}))).unwrap();
        let second = ctx.create("Project", &input(json!({"code": "B"}))).unwrap();
        let task = ctx.create("Task", &input(json!({"name": "t"}))).unwrap();

        ctx.set(&first, "tasks", Value::List(vec![Value::from(task.as_str())])).unwrap();
        ctx.set(&second, "tasks", Value::List(vec![Value::from(task.as_str())])).unwrap();

        let reader = ctx.reader();
        let first_tasks = reader.read(reader.graph.get(&first).unwrap(), "tasks").unwrap();
        assert_eq!(first_tasks, Value::List(Vec::new()));
        let owner = reader.read(reader.graph.get(&task).unwrap(), "project").unwrap();
        assert_eq!(owner.member("id"), Value::from(second.as_str()));
    }

    #[test]
    fn test_repeated_ids_link_once() {
        let schema = project_schema();
        let graph = MemoryGraph::new();
        let mut tx = graph.begin();
        let mut ctx = WriteContext::new(&mut tx, &schema);

        let project = ctx.create("Project", &input(json!({"code": "P"}))).unwrap();
        let l1 = ctx.create("Label", &input(json!({"name": "l1"}))).unwrap();
        let l2 = ctx.create("Label", &input(json!({"name": "l2"}))).unwrap();
        let ids = [&l1, &l2, &l1].iter().map(|id| Value::from(id.as_str())).collect();
        ctx.set(&project, "labels", Value::List(ids)).unwrap();

        let reader = ctx.reader();
        let Value::List(labels) = reader.read(reader.graph.get(&project).unwrap(), "labels").unwrap() else {
            panic!("labels should be a collection");
        };
        assert_eq!(labels.len(), 2);
    }

    #[test]
    fn test_delete_cascades_from_source_to_target() {
        let schema = project_schema();
        let graph = MemoryGraph::new();
        let mut tx = graph.begin();
        let mut ctx = WriteContext::new(&mut tx, &schema);

        let project = ctx
            .create("Project", &input(json!({"code": "P", "taskNames": ["x"]})))
            .unwrap();
        let deleted = ctx.delete(&project).unwrap();
        // project, task and the relationship between them
        assert_eq!(deleted.len(), 3);
        assert!(ctx.graph.get(&project).is_none());
    }

    #[test]
    fn test_render_follows_view_order() {
        let schema = project_schema();
        let graph = MemoryGraph::new();
        let mut tx = graph.begin();
        let mut ctx = WriteContext::new(&mut tx, &schema);

        let id = ctx.create("Project", &input(json!({"code": "P", "name": "n"}))).unwrap();
        let reader = ctx.reader();
        let rendered = reader.render(reader.graph.get(&id).unwrap(), "ui").unwrap();
        let keys: Vec<&str> = rendered.keys().map(String::as_str).collect();
        assert_eq!(keys, ["id", "name", "code", "tasks"]);
        assert_eq!(rendered["tasks"], json!([]));
    }
}
