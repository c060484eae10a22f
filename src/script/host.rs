//! Graph access for running scripts
//!
//! A `ScriptHost` exposes the caller's transaction to a script. Every read
//! and write goes through the compiled property descriptors, so function
//! properties, relationship accessors and notions resolve the same way they
//! do for REST callers. Constraint failures surface as application errors
//! and the caller decides whether to commit.

use crate::error::FrameworkError;
use crate::graph::{Entity, GraphTransaction};
use crate::property::{PropertyError, ReadContext, WriteContext};
use crate::schema::CompiledSchema;
use crate::script::context::ActionContext;
use crate::script::error::EvaluationError;
use crate::script::scripting::{ScriptFunctions, Scripting};
use crate::value::Value;
use serde_json::{Map, Value as JsonValue};
use std::cell::RefCell;

/// Graph operations a script may call
pub trait ScriptHost {
    fn get(&self, id: &str) -> Result<Option<Entity>, EvaluationError>;

    /// Property `key` of `entity`, resolved through its descriptor
    fn read(&self, ctx: &mut ActionContext, entity: &Entity, key: &str) -> Result<Value, EvaluationError>;

    /// Nodes of `type_name` or a subtype whose `key` equals `value`
    fn find(&self, type_name: &str, key: &str, value: &Value) -> Result<Vec<Entity>, EvaluationError>;

    fn create(
        &self,
        ctx: &mut ActionContext,
        type_name: &str,
        input: &Map<String, JsonValue>,
    ) -> Result<Entity, EvaluationError>;

    fn set(&self, ctx: &mut ActionContext, id: &str, key: &str, value: Value) -> Result<(), EvaluationError>;

    /// Returns every deleted id, cascades included
    fn delete(&self, ctx: &mut ActionContext, id: &str) -> Result<Vec<String>, EvaluationError>;
}

enum Access<'t> {
    Read(&'t dyn GraphTransaction),
    Write(RefCell<&'t mut dyn GraphTransaction>),
}

/// `ScriptHost` over one graph transaction
pub struct TransactionHost<'t> {
    scripting: &'t Scripting,
    schema: &'t CompiledSchema,
    access: Access<'t>,
}

impl<'t> TransactionHost<'t> {
    /// Reads only; write calls fail with a script error
    pub fn reading(scripting: &'t Scripting, graph: &'t dyn GraphTransaction, schema: &'t CompiledSchema) -> Self {
        Self {
            scripting,
            schema,
            access: Access::Read(graph),
        }
    }

    pub fn writing(scripting: &'t Scripting, graph: &'t mut dyn GraphTransaction, schema: &'t CompiledSchema) -> Self {
        Self {
            scripting,
            schema,
            access: Access::Write(RefCell::new(graph)),
        }
    }

    fn with_reader<R>(
        &self,
        f: impl FnOnce(&dyn GraphTransaction) -> Result<R, EvaluationError>,
    ) -> Result<R, EvaluationError> {
        match &self.access {
            Access::Read(graph) => f(*graph),
            Access::Write(graph) => {
                let graph = graph.try_borrow().map_err(|_| busy())?;
                f(&**graph)
            }
        }
    }

    fn with_writer<R>(
        &self,
        f: impl FnOnce(&mut dyn GraphTransaction) -> Result<R, EvaluationError>,
    ) -> Result<R, EvaluationError> {
        match &self.access {
            Access::Read(_) => Err(EvaluationError::Host(
                "Graph writes are not allowed while reading a property".to_string(),
            )),
            Access::Write(graph) => {
                let mut graph = graph.try_borrow_mut().map_err(|_| busy())?;
                f(&mut **graph)
            }
        }
    }
}

fn busy() -> EvaluationError {
    EvaluationError::Host("The transaction is in use by an enclosing graph call".to_string())
}

/// Evaluation errors pass through; everything else becomes the
/// application error a REST caller would get
fn property_failure(err: PropertyError) -> EvaluationError {
    match err {
        PropertyError::Evaluation(inner) => inner,
        other => EvaluationError::Application(other.to_framework_error()),
    }
}

impl ScriptHost for TransactionHost<'_> {
    fn get(&self, id: &str) -> Result<Option<Entity>, EvaluationError> {
        self.with_reader(|graph| Ok(graph.get(id).cloned()))
    }

    fn read(&self, ctx: &mut ActionContext, entity: &Entity, key: &str) -> Result<Value, EvaluationError> {
        let functions = ScriptFunctions::new(self.scripting, ctx);
        self.with_reader(|graph| {
            ReadContext::new(graph, self.schema)
                .with_functions(&functions)
                .read(entity, key)
                .map_err(property_failure)
        })
    }

    fn find(&self, type_name: &str, key: &str, value: &Value) -> Result<Vec<Entity>, EvaluationError> {
        let types = self.schema.subtypes_of(type_name);
        if types.is_empty() {
            return Err(property_failure(PropertyError::UnknownType(type_name.to_string())));
        }
        let stored = match self.schema.property(type_name, key) {
            Some(descriptor) if descriptor.info().stored => descriptor.to_storage_form(value).map_err(property_failure)?,
            _ => Some(value.to_json()),
        };
        let stored = stored.unwrap_or(JsonValue::Null);
        self.with_reader(|graph| Ok(graph.find(types, key, &stored).into_iter().cloned().collect()))
    }

    fn create(
        &self,
        ctx: &mut ActionContext,
        type_name: &str,
        input: &Map<String, JsonValue>,
    ) -> Result<Entity, EvaluationError> {
        let functions = ScriptFunctions::new(self.scripting, ctx);
        self.with_writer(|graph| {
            let mut writer = WriteContext::new(graph, self.schema).with_functions(&functions);
            let id = writer.create(type_name, input).map_err(property_failure)?;
            writer
                .graph
                .get(&id)
                .cloned()
                .ok_or_else(|| EvaluationError::Application(FrameworkError::new(404, format!("Entity not found: {}", id))))
        })
    }

    fn set(&self, ctx: &mut ActionContext, id: &str, key: &str, value: Value) -> Result<(), EvaluationError> {
        let functions = ScriptFunctions::new(self.scripting, ctx);
        self.with_writer(|graph| {
            WriteContext::new(graph, self.schema)
                .with_functions(&functions)
                .set(id, key, value)
                .map_err(property_failure)
        })
    }

    fn delete(&self, ctx: &mut ActionContext, id: &str) -> Result<Vec<String>, EvaluationError> {
        let functions = ScriptFunctions::new(self.scripting, ctx);
        self.with_writer(|graph| {
            WriteContext::new(graph, self.schema)
                .with_functions(&functions)
                .delete(id)
                .map_err(property_failure)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::graph::MemoryGraph;
    use crate::schema::{compile, Cardinality, CompileEnv, PropertyKind, SchemaModel};
    use serde_json::json;

    fn schema() -> CompiledSchema {
        let mut model = SchemaModel::builtin();
        {
            let project = model.add_type("Project");
            project.extends = Some("AbstractNode".to_string());
            project.add_property("code", PropertyKind::String).required().unique();
        }
        {
            let task = model.add_type("Task");
            task.extends = Some("AbstractNode".to_string());
            task.add_property(
                "label",
                PropertyKind::Function {
                    read_function: Some("concat(this.name, '!')".to_string()),
                    write_function: None,
                },
            );
        }
        model
            .relate("Project", "has", "Task", Cardinality::OneToMany)
            .named("project", "tasks");
        compile(&model, &CompileEnv::default()).unwrap()
    }

    #[test]
    fn test_reads_resolve_function_properties_and_accessors() {
        let scripting = Scripting::new(&Config::default()).unwrap();
        let schema = schema();
        let graph = MemoryGraph::new();
        let mut tx = graph.begin();
        let mut ctx = ActionContext::default();

        let host = TransactionHost::writing(&scripting, &mut tx, &schema);
        let project = host.create(&mut ctx, "Project", &json!({ "code": "P1" }).as_object().cloned().unwrap()).unwrap();
        let task = host.create(&mut ctx, "Task", &json!({ "name": "Docs" }).as_object().cloned().unwrap()).unwrap();
        host.set(&mut ctx, &task.id, "project", Value::from(project.id.as_str())).unwrap();

        assert_eq!(host.read(&mut ctx, &task, "label").unwrap(), Value::from("Docs!"));
        let Value::Entity(owner) = host.read(&mut ctx, &task, "project").unwrap() else {
            panic!("expected the owning project");
        };
        assert_eq!(owner.id, project.id);

        let found = host.find("AbstractNode", "code", &Value::from("P1")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, project.id);
    }

    #[test]
    fn test_constraint_failures_are_application_errors() {
        let scripting = Scripting::new(&Config::default()).unwrap();
        let schema = schema();
        let graph = MemoryGraph::new();
        let mut tx = graph.begin();
        let mut ctx = ActionContext::default();
        let host = TransactionHost::writing(&scripting, &mut tx, &schema);

        let err = host.create(&mut ctx, "Project", &Map::new()).unwrap_err();
        assert!(matches!(err, EvaluationError::Application(ref app) if app.status == 422));
        let err = host.find("Nope", "code", &Value::Null).unwrap_err();
        assert!(matches!(err, EvaluationError::Application(ref app) if app.status == 404));
    }

    #[test]
    fn test_reading_host_refuses_writes() {
        let scripting = Scripting::new(&Config::default()).unwrap();
        let schema = schema();
        let graph = MemoryGraph::new();
        let tx = graph.begin();
        let mut ctx = ActionContext::default();
        let host = TransactionHost::reading(&scripting, &tx, &schema);

        let err = host.create(&mut ctx, "Project", &Map::new()).unwrap_err();
        assert!(matches!(err, EvaluationError::Host(_)));
        assert_eq!(host.get("missing").unwrap(), None);
    }
}
