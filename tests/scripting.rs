//! End-to-end template substitution and script evaluation against a schema

use serde_json::json;
use std::sync::Arc;
use strata::graph::Entity;
use strata::schema::{PropertyKind, SchemaModel, SchemaRegistry};
use strata::script::{
    ActionContext, CollectingBroadcaster, EvaluationError, LuaEngine, Scripting, SecurityContext,
};
use strata::{Config, Value};

struct Fixture {
    scripting: Scripting,
    events: Arc<CollectingBroadcaster>,
}

fn fixture() -> Fixture {
    let config = Config::default();
    let registry = Arc::new(SchemaRegistry::new(&config).unwrap());

    let mut model = SchemaModel::new();
    let task = model.add_type("Task");
    task.extending("AbstractNode");
    task.add_property("estimate", PropertyKind::Integer);
    task.add_method("describe", "return this.name .. ' takes ' .. this.estimate");
    task.add_method("broken", "local x = 1\nerror('nope')");
    registry.replace(model).unwrap();

    let events = Arc::new(CollectingBroadcaster::default());
    let scripting = Scripting::new(&config)
        .unwrap()
        .with_schema(Arc::clone(&registry))
        .with_broadcaster(events.clone());
    Fixture { scripting, events }
}

fn task() -> Entity {
    let mut entity = Entity::node("t1", "Task");
    entity.properties.insert("name".to_string(), json!("Docs"));
    entity.properties.insert("estimate".to_string(), json!(3));
    entity
}

#[test]
fn test_template_mixes_languages() {
    let f = fixture();
    let mut ctx = ActionContext::default().with_constant("who", Value::from("Ada"));
    let task = task();

    let out = f
        .scripting
        .replace_variables(
            &mut ctx,
            Some(&task),
            Some("${who}: ${this.name} is ${if(this.estimate > 2, 'big', 'small')} (${{ return this:describe() }})"),
            false,
            "template",
        )
        .unwrap();
    assert_eq!(out.as_deref(), Some("Ada: Docs is big (Docs takes 3)"));
    assert!(f.events.messages().is_empty());
}

#[test]
fn test_schema_methods_report_their_code_source() {
    let f = fixture();
    let mut ctx = ActionContext::new(SecurityContext::for_principal("admin").with_session("s9"));
    let task = task();

    let value = f.scripting.invoke_method(&mut ctx, &task, "describe").unwrap();
    assert_eq!(value, Value::from("Docs takes 3"));

    let err = f.scripting.invoke_method(&mut ctx, &task, "broken").unwrap_err();
    assert_eq!(err, EvaluationError::script_failure());

    let messages = f.events.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].session_id.as_deref(), Some("s9"));
    let event = &messages[0].event;
    assert_eq!(event.node_type.as_deref(), Some("SchemaMethod"));
    assert_eq!(event.node_id.as_deref(), Some("Task.broken"));
    assert_eq!(event.entity_id.as_deref(), Some("t1"));
    assert_eq!(event.name.as_deref(), Some("broken"));
    assert_eq!(event.row, 2);

    let logged = f.scripting.event_log().entries();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].entity.as_deref(), Some("\"broken\":Task.broken"));
    assert!(ctx.security.do_transaction_notifications);
}

#[test]
fn test_unknown_method_is_not_found() {
    let f = fixture();
    let mut ctx = ActionContext::default();
    let err = f.scripting.invoke_method(&mut ctx, &task(), "missing").unwrap_err();
    assert_eq!(err.to_framework_error().status, 404);
}

#[test]
fn test_application_errors_abort_substitution() {
    let f = fixture();
    let mut ctx = ActionContext::default();
    let err = f
        .scripting
        .replace_variables(&mut ctx, None, Some("a ${ assert(false, 409, 'Conflict') } b"), false, "t")
        .unwrap_err();
    match err {
        EvaluationError::Application(app) => {
            assert_eq!(app.status, 409);
            assert_eq!(app.message, "Conflict");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(f.events.messages().is_empty());
}

#[test]
fn test_default_language_output_replaces_empty_result() {
    let f = fixture();
    let mut ctx = ActionContext::default();
    let out = f
        .scripting
        .replace_variables(&mut ctx, None, Some("[${ print('x', 1) }]"), false, "t")
        .unwrap();
    assert_eq!(out.as_deref(), Some("[x1]"));
}

#[test]
fn test_imports_resolve_registered_modules() {
    let config = Config::default();
    let lua = LuaEngine::new()
        .unwrap()
        .with_module("util", "return { double = function(x) return x * 2 end }");
    let scripting = Scripting::new(&config).unwrap().with_general_engine(Arc::new(lua));

    let mut ctx = ActionContext::default();
    let value = scripting
        .evaluate(
            &mut ctx,
            None,
            "${{import { double } from 'util'\nreturn double(21)}}",
            "t",
            0,
            None,
        )
        .unwrap();
    assert_eq!(value, Value::Int(42));
}

#[test]
fn test_cached_compilation_sees_current_bindings() {
    let f = fixture();
    let mut ctx = ActionContext::default();
    for n in 0..3 {
        ctx.set_constant("n", Value::Int(n));
        let value = f.scripting.evaluate(&mut ctx, None, "${ n * 10 }", "t", 0, None).unwrap();
        assert_eq!(value, Value::Int(n * 10));
    }
}
