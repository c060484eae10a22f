//! The script evaluator
//!
//! `evaluate` dispatches one expression to an engine:
//! - `${{ ... }}` runs on the general-purpose engine inside a `main` wrapper
//! - `${Name{ ... }}` runs unwrapped on the engine registered as `Name`
//!   (`JavaScript` means the general-purpose engine)
//! - anything else is the default expression language
//!
//! Script errors are reported as structured events. The default language
//! recovers from them with `null`; the other paths raise a 422 failure.
//! Application errors raised inside a script are re-raised unchanged.
//!
//! The `_in` variants hand the script a `ScriptHost`: `this` then resolves
//! lazily through the property descriptors and the graph functions work.
//! Without a host `this` is a snapshot of the stored properties.

use crate::config::Config;
use crate::error::ErrorToken;
use crate::graph::Entity;
use crate::property::{FunctionEvaluator, ReadContext, WriteContext};
use crate::schema::SchemaRegistry;
use crate::script::cache::SourceCache;
use crate::script::context::{ActionContext, SecurityContext};
use crate::script::engine::{Bindings, EngineError, MethodBinding, ScriptEngine};
use crate::script::error::{ErrorLocation, EvaluationError, ScriptingErrorEvent};
use crate::script::events::{BroadcastMessage, Broadcaster, ChannelBroadcaster, RuntimeEventLog};
use crate::script::expression::ExpressionEngine;
use crate::script::extractor::extract;
use crate::script::format::for_substitution;
use crate::script::host::{ScriptHost, TransactionHost};
use crate::script::lua::LuaEngine;
use crate::script::snippet::{ImportPattern, Snippet};
use crate::value::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Engine name that selects the general-purpose engine
pub const DEFAULT_LANGUAGE_NAME: &str = "JavaScript";

const EVENT_LOG_CAPACITY: usize = 1000;

/// Function properties evaluated inside function properties, deepest first
const MAX_FUNCTION_NESTING: usize = 16;

pub struct Scripting {
    general: Arc<dyn ScriptEngine>,
    expression: Arc<dyn ScriptEngine>,
    /// Alternate engines selectable with `${Name{...}}`
    engines: BTreeMap<String, Arc<dyn ScriptEngine>>,
    cache: SourceCache,
    imports: ImportPattern,
    broadcaster: Arc<dyn Broadcaster>,
    event_log: Arc<RuntimeEventLog>,
    schema: Option<Arc<SchemaRegistry>>,
    date_format: String,
}

impl std::fmt::Debug for Scripting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scripting")
            .field("general", &self.general.name())
            .field("engines", &self.engines.keys().collect::<Vec<_>>())
            .field("cache", &self.cache)
            .finish()
    }
}

impl Scripting {
    /// Lua as the general-purpose engine, also selectable as `${Lua{...}}`
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let lua: Arc<dyn ScriptEngine> = Arc::new(
            LuaEngine::new().map_err(|e| anyhow::anyhow!("Failed to create Lua engine: {}", e))?,
        );
        let imports = ImportPattern::new().map_err(|e| anyhow::anyhow!("Invalid import pattern: {}", e))?;

        let mut engines = BTreeMap::new();
        engines.insert(lua.name().to_string(), Arc::clone(&lua));

        Ok(Self {
            general: lua,
            expression: Arc::new(ExpressionEngine),
            engines,
            cache: SourceCache::new(config.scripting.source_cache_capacity),
            imports,
            broadcaster: Arc::new(ChannelBroadcaster::new(64)),
            event_log: Arc::new(RuntimeEventLog::new(EVENT_LOG_CAPACITY)),
            schema: None,
            date_format: config.scripting.default_date_format.clone(),
        })
    }

    pub fn with_schema(mut self, schema: Arc<SchemaRegistry>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    /// Register an alternate engine under its own name
    pub fn with_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.engines.insert(engine.name().to_string(), engine);
        self
    }

    /// Replace the general-purpose engine
    pub fn with_general_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.engines.insert(engine.name().to_string(), Arc::clone(&engine));
        self.general = engine;
        self
    }

    pub fn event_log(&self) -> &RuntimeEventLog {
        &self.event_log
    }

    pub fn date_format(&self) -> &str {
        &self.date_format
    }

    /// Evaluate one expression. Commit notifications are off while it runs
    /// and restored afterwards, whatever the outcome.
    pub fn evaluate(
        &self,
        ctx: &mut ActionContext,
        entity: Option<&Entity>,
        expression: &str,
        method_name: &str,
        start_row: usize,
        code_source: Option<&str>,
    ) -> Result<Value, EvaluationError> {
        self.evaluate_with(None, ctx, entity, expression, method_name, start_row, code_source)
    }

    /// `evaluate` with graph access through `host`
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate_in(
        &self,
        host: &dyn ScriptHost,
        ctx: &mut ActionContext,
        entity: Option<&Entity>,
        expression: &str,
        method_name: &str,
        start_row: usize,
        code_source: Option<&str>,
    ) -> Result<Value, EvaluationError> {
        self.evaluate_with(Some(host), ctx, entity, expression, method_name, start_row, code_source)
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_with(
        &self,
        host: Option<&dyn ScriptHost>,
        ctx: &mut ActionContext,
        entity: Option<&Entity>,
        expression: &str,
        method_name: &str,
        start_row: usize,
        code_source: Option<&str>,
    ) -> Result<Value, EvaluationError> {
        let notify = ctx.security.do_transaction_notifications;
        ctx.security.do_transaction_notifications = false;

        let target = Target { host, entity };
        let result = self.dispatch(ctx, target, expression.trim(), method_name, start_row, code_source);

        ctx.security.do_transaction_notifications = notify;
        result
    }

    fn dispatch(
        &self,
        ctx: &mut ActionContext,
        target: Target<'_>,
        expression: &str,
        method_name: &str,
        start_row: usize,
        code_source: Option<&str>,
    ) -> Result<Value, EvaluationError> {
        let entity = target.entity;
        if expression.len() >= 5 && expression.starts_with("${{") && expression.ends_with("}}") {
            let source = &expression[3..expression.len() - 2];
            if source.is_empty() {
                return Ok(Value::Null);
            }
            let snippet = Snippet::new(method_name, source, &self.imports)
                .with_code_source(code_source)
                .with_start_row(start_row);
            let general = Arc::clone(&self.general);
            return self.run_script(ctx, target, general.as_ref(), &snippet);
        }

        if let Some((name, source)) = named_engine(expression) {
            let snippet = Snippet::new(method_name, source, &self.imports)
                .with_code_source(code_source)
                .with_start_row(start_row);

            if name == DEFAULT_LANGUAGE_NAME {
                let general = Arc::clone(&self.general);
                return self.run_script(ctx, target, general.as_ref(), &snippet);
            }
            let Some(engine) = self.engines.get(name).cloned() else {
                ctx.output.clear();
                let message = format!("Unknown script engine {}", name);
                self.report(ctx, entity, &snippet, &message, ErrorLocation::default());
                return Err(EvaluationError::script_failure());
            };
            return self.run_script(ctx, target, engine.as_ref(), &snippet.unwrapped());
        }

        let source = expression
            .strip_prefix("${")
            .and_then(|inner| inner.strip_suffix('}'))
            .unwrap_or(expression);
        let snippet = Snippet::new(method_name, source, &self.imports)
            .with_code_source(code_source)
            .with_start_row(start_row)
            .unwrapped();
        self.run_expression(ctx, target, &snippet)
    }

    /// General-purpose and alternate engines: printed output wins over the
    /// returned value, and failures are raised
    fn run_script(
        &self,
        ctx: &mut ActionContext,
        target: Target<'_>,
        engine: &dyn ScriptEngine,
        snippet: &Snippet,
    ) -> Result<Value, EvaluationError> {
        let entity = target.entity;
        ctx.output.clear();
        ctx.errors.clear();

        let result = self
            .cache
            .get_or_compile(engine, &engine.wrap(snippet))
            .and_then(|compiled| {
                let mut bindings = self.bindings(ctx, target);
                engine.evaluate(&compiled, &mut bindings)
            });

        match result {
            Ok(_) if !ctx.output.is_empty() => Ok(Value::String(ctx.output.clone())),
            Ok(Value::Null) => Ok(Value::String(String::new())),
            Ok(value) => Ok(value),
            Err(EngineError::Application(err)) => Err(EvaluationError::Application(err)),
            Err(EngineError::Script { message, location }) => {
                self.report(ctx, entity, snippet, &message, location);
                Err(EvaluationError::script_failure())
            }
        }
    }

    /// Default expression language: failures are reported and yield null
    fn run_expression(
        &self,
        ctx: &mut ActionContext,
        target: Target<'_>,
        snippet: &Snippet,
    ) -> Result<Value, EvaluationError> {
        let entity = target.entity;
        ctx.output.clear();
        ctx.errors.clear();

        let engine = Arc::clone(&self.expression);
        let result = self
            .cache
            .get_or_compile(engine.as_ref(), &engine.wrap(snippet))
            .and_then(|compiled| {
                let mut bindings = self.bindings(ctx, target);
                engine.evaluate(&compiled, &mut bindings)
            });

        match result {
            Ok(value) if value.is_empty() && !ctx.output.is_empty() => Ok(Value::String(ctx.output.clone())),
            Ok(value) => Ok(value),
            Err(EngineError::Application(err)) => Err(EvaluationError::Application(err)),
            Err(EngineError::Script { message, location }) => {
                self.report(ctx, entity, snippet, &message, location);
                Ok(Value::Null)
            }
        }
    }

    /// Replace every `${...}` in `value` with its formatted result.
    ///
    /// Spans are replaced once each, in source order. A failing script
    /// contributes an empty string; application errors are raised.
    pub fn replace_variables(
        &self,
        ctx: &mut ActionContext,
        entity: Option<&Entity>,
        value: Option<&str>,
        return_null_for_empty: bool,
        method_name: &str,
    ) -> Result<Option<String>, EvaluationError> {
        self.replace_with(None, ctx, entity, value, return_null_for_empty, method_name)
    }

    /// `replace_variables` with graph access through `host`
    pub fn replace_variables_in(
        &self,
        host: &dyn ScriptHost,
        ctx: &mut ActionContext,
        entity: Option<&Entity>,
        value: Option<&str>,
        return_null_for_empty: bool,
        method_name: &str,
    ) -> Result<Option<String>, EvaluationError> {
        self.replace_with(Some(host), ctx, entity, value, return_null_for_empty, method_name)
    }

    fn replace_with(
        &self,
        host: Option<&dyn ScriptHost>,
        ctx: &mut ActionContext,
        entity: Option<&Entity>,
        value: Option<&str>,
        return_null_for_empty: bool,
        method_name: &str,
    ) -> Result<Option<String>, EvaluationError> {
        let Some(raw) = value else {
            return Ok(None);
        };
        if raw.is_empty() {
            return Ok(Some(String::new()));
        }
        if ctx.returns_raw_value() {
            return Ok(Some(raw.to_string()));
        }

        let code_source = entity.map(|e| e.id.as_str());
        let mut value_was_null = true;
        let mut out = String::with_capacity(raw.len());
        let mut cursor = 0;

        for span in extract(raw) {
            let result = match self.evaluate_with(host, ctx, entity, &span.text, method_name, span.start_row, code_source) {
                Ok(result) => result,
                Err(EvaluationError::ScriptFailure(_)) => Value::Null,
                Err(other) => return Err(other),
            };
            value_was_null &= result.is_null();
            out.push_str(&raw[cursor..span.start]);
            out.push_str(&for_substitution(&result, &self.date_format));
            cursor = span.end;
        }
        out.push_str(&raw[cursor..]);

        if return_null_for_empty && value_was_null && out.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(out))
    }

    /// Run the schema method `method` with `entity` bound as `this`
    pub fn invoke_method(
        &self,
        ctx: &mut ActionContext,
        entity: &Entity,
        method: &str,
    ) -> Result<Value, EvaluationError> {
        self.invoke_with(None, ctx, entity, method)
    }

    /// `invoke_method` with graph access through `host`
    pub fn invoke_method_in(
        &self,
        host: &dyn ScriptHost,
        ctx: &mut ActionContext,
        entity: &Entity,
        method: &str,
    ) -> Result<Value, EvaluationError> {
        self.invoke_with(Some(host), ctx, entity, method)
    }

    fn invoke_with(
        &self,
        host: Option<&dyn ScriptHost>,
        ctx: &mut ActionContext,
        entity: &Entity,
        method: &str,
    ) -> Result<Value, EvaluationError> {
        let schema = self.schema.as_ref().map(|registry| registry.load());
        let Some(descriptor) = schema
            .as_ref()
            .and_then(|schema| schema.method(&entity.type_name, method))
            .cloned()
        else {
            return Err(EvaluationError::Application(crate::error::FrameworkError::new(
                404,
                format!("No method {} on type {}", method, entity.type_name),
            )));
        };
        let expression = format!("${{{{{}}}}}", descriptor.source);
        self.evaluate_with(host, ctx, Some(entity), &expression, method, 0, Some(&descriptor.id))
    }

    fn bindings<'a>(&'a self, ctx: &'a mut ActionContext, target: Target<'a>) -> Bindings<'a> {
        let mut bindings = Bindings::new(ctx, &self.date_format);
        let Some(entity) = target.entity else {
            bindings.host = target.host;
            return bindings;
        };
        bindings.entity = Some(entity);
        bindings.host = target.host;

        let schema = self.schema.as_ref().map(|registry| registry.load());
        if target.host.is_none() {
            let mut snapshot = BTreeMap::new();
            snapshot.insert("id".to_string(), Value::String(entity.id.clone()));
            snapshot.insert("type".to_string(), Value::String(entity.type_name.clone()));
            for (key, stored) in &entity.properties {
                let value = match schema.as_ref().and_then(|s| s.property(&entity.type_name, key)) {
                    Some(descriptor) => descriptor.from_storage_form(Some(stored)),
                    None => Value::from_json(stored),
                };
                snapshot.insert(key.clone(), value);
            }
            bindings.this = Some(Value::Map(snapshot));
        }

        if let Some(descriptor) = schema.as_ref().and_then(|s| s.type_descriptor(&entity.type_name)) {
            bindings.methods = descriptor
                .methods
                .values()
                .filter(|method| !method.is_static)
                .map(|method| MethodBinding {
                    name: method.name.clone(),
                    source: method.source.clone(),
                })
                .collect();
        }
        bindings
    }

    fn report(
        &self,
        ctx: &mut ActionContext,
        entity: Option<&Entity>,
        snippet: &Snippet,
        message: &str,
        location: ErrorLocation,
    ) {
        let mut event = ScriptingErrorEvent::new(Some(message.to_string()), location, snippet.start_row);
        let mut prefix = String::new();

        if let Some(code_source) = &snippet.code_source {
            if let Some(entity) = entity {
                event.entity_type = Some(entity.type_name.clone());
                event.entity_id = Some(entity.id.clone());
                prefix.push_str(&format!("{}[{}]:", entity.type_name, entity.id));
            }

            let schema = self.schema.as_ref().map(|registry| registry.load());
            let method = schema.as_ref().and_then(|s| s.code_source(code_source).cloned());

            match method {
                Some(method) => {
                    event.node_type = Some("SchemaMethod".to_string());
                    event.node_id = Some(method.id.clone());
                    if method.is_static {
                        event.static_type = Some(method.declaring_type.clone());
                        event.is_static_method = Some(true);
                        prefix.push_str(&format!("{}[static]:", method.declaring_type));
                    } else if entity.is_none() {
                        prefix.push_str(&format!("SchemaMethod[{}]:", method.id));
                    }
                }
                None => {
                    if let Some(entity) = entity.filter(|e| &e.id == code_source) {
                        event.node_type = Some(entity.type_name.clone());
                        event.node_id = Some(entity.id.clone());
                    }
                }
            }
        }

        if !snippet.name.is_empty() {
            event.name = Some(snippet.name.clone());
        }

        tracing::warn!(
            "⚠️ {}{}:{}:{}: {}",
            prefix,
            snippet.name,
            location.row,
            location.column,
            message
        );

        let description = match &snippet.code_source {
            Some(code_source) if !snippet.name.is_empty() => format!("\"{}\":{}", snippet.name, code_source),
            Some(code_source) => code_source.clone(),
            None => format!("\"{}\"", snippet.name),
        };
        self.event_log.scripting(Some(description), event.clone());
        self.broadcaster.broadcast(BroadcastMessage {
            session_id: ctx.security.session_id.clone(),
            event: event.clone(),
        });

        let token_type = entity.map_or("Script", |e| e.type_name.as_str());
        ctx.errors.add(ErrorToken::new(token_type, "script_error").with_detail(message));
        ctx.events.push(event);
    }
}

/// What an evaluation is bound to
#[derive(Clone, Copy)]
struct Target<'a> {
    host: Option<&'a dyn ScriptHost>,
    entity: Option<&'a Entity>,
}

/// `${Name{ source }}` with a bare identifier as the engine name
fn named_engine(expression: &str) -> Option<(&str, &str)> {
    let inner = expression.strip_prefix("${")?.strip_suffix('}')?.trim_end();
    let inner = inner.strip_suffix('}')?;
    let open = inner.find('{')?;
    let name = inner[..open].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    Some((name, &inner[open + 1..]))
}

/// Function-property evaluation on top of an action context
///
/// Each call runs on a fork of the context with the written value bound as
/// `value`, and with graph access to the transaction of the read or write
/// that triggered it. The fork is merged back afterwards.
pub struct ScriptFunctions<'a> {
    scripting: &'a Scripting,
    security: SecurityContext,
    ctx: RefCell<&'a mut ActionContext>,
}

impl<'a> ScriptFunctions<'a> {
    pub fn new(scripting: &'a Scripting, ctx: &'a mut ActionContext) -> Self {
        Self {
            scripting,
            security: ctx.security.clone(),
            ctx: RefCell::new(ctx),
        }
    }

    fn run(
        &self,
        host: &dyn ScriptHost,
        entity: &Entity,
        property: &str,
        source: &str,
        value: Option<&Value>,
    ) -> Result<Value, EvaluationError> {
        let snippet = || Snippet::new(property, source, &self.scripting.imports).with_code_source(Some(&entity.id));

        let Ok(mut ctx) = self.ctx.try_borrow_mut() else {
            // the context is held further up this call chain
            let mut detached = ActionContext::new(self.security.clone());
            let message = format!("Function property {} evaluated while its context is in use", property);
            self.scripting
                .report(&mut detached, Some(entity), &snippet(), &message, ErrorLocation::default());
            return Err(EvaluationError::script_failure());
        };
        if ctx.nesting() >= MAX_FUNCTION_NESTING {
            let message = format!("Function property {} nested too deeply", property);
            self.scripting
                .report(&mut **ctx, Some(entity), &snippet(), &message, ErrorLocation::default());
            return Err(EvaluationError::script_failure());
        }

        let mut child = ctx.fork();
        if let Some(value) = value {
            child.set_constant("value", value.clone());
        }
        let expression = if source.trim_start().starts_with("${") {
            source.to_string()
        } else {
            format!("${{{}}}", source)
        };

        let result = self
            .scripting
            .evaluate_in(host, &mut child, Some(entity), &expression, property, 0, Some(&entity.id));
        ctx.merge(child);
        result
    }
}

impl FunctionEvaluator for ScriptFunctions<'_> {
    fn evaluate_read(
        &self,
        ctx: &ReadContext<'_>,
        entity: &Entity,
        property: &str,
        source: &str,
    ) -> Result<Value, EvaluationError> {
        let host = TransactionHost::reading(self.scripting, ctx.graph, ctx.schema);
        self.run(&host, entity, property, source, None)
    }

    fn evaluate_write(
        &self,
        ctx: &mut WriteContext<'_>,
        entity: &Entity,
        property: &str,
        source: &str,
        value: &Value,
    ) -> Result<(), EvaluationError> {
        let schema = ctx.schema;
        let host = TransactionHost::writing(self.scripting, &mut *ctx.graph, schema);
        self.run(&host, entity, property, source, Some(value)).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameworkError;
    use crate::graph::{GraphTransaction, MemoryGraph};
    use crate::property::PropertyError;
    use crate::schema::{compile, Cardinality, CompileEnv, CompiledSchema, PropertyKind, SchemaModel};
    use crate::script::events::CollectingBroadcaster;
    use serde_json::json;

    struct Fixture {
        scripting: Scripting,
        events: Arc<CollectingBroadcaster>,
    }

    fn fixture() -> Fixture {
        let events = Arc::new(CollectingBroadcaster::default());
        let scripting = Scripting::new(&Config::default())
            .unwrap()
            .with_broadcaster(Arc::clone(&events) as Arc<dyn Broadcaster>);
        Fixture { scripting, events }
    }

    fn task() -> Entity {
        let mut entity = Entity::node("t1", "Task");
        entity.properties.insert("name".into(), serde_json::json!("Write docs"));
        entity.properties.insert("estimate".into(), serde_json::json!(3));
        entity
    }

    #[test]
    fn test_dispatch_to_each_path() {
        let f = fixture();
        let mut ctx = ActionContext::default();
        let task = task();

        let value = f.scripting.evaluate(&mut ctx, Some(&task), "${ this.estimate * 2 }", "t", 0, None).unwrap();
        assert_eq!(value, Value::Int(6));

        let value = f.scripting.evaluate(&mut ctx, Some(&task), "${{ return this.name }}", "t", 0, None).unwrap();
        assert_eq!(value, Value::from("Write docs"));

        let value = f.scripting.evaluate(&mut ctx, None, "${Lua{return 40 + 2}}", "t", 0, None).unwrap();
        assert_eq!(value, Value::Int(42));

        let value = f.scripting.evaluate(&mut ctx, None, "${JavaScript{ return 'main' }}", "t", 0, None).unwrap();
        assert_eq!(value, Value::from("main"));
    }

    #[test]
    fn test_printed_output_wins_over_return_value() {
        let f = fixture();
        let mut ctx = ActionContext::default();
        let value = f
            .scripting
            .evaluate(&mut ctx, None, "${{ print('printed'); return 'returned' }}", "t", 0, None)
            .unwrap();
        assert_eq!(value, Value::from("printed"));
    }

    #[test]
    fn test_general_script_null_becomes_empty_string() {
        let f = fixture();
        let mut ctx = ActionContext::default();
        let value = f.scripting.evaluate(&mut ctx, None, "${{ local x = 1 }}", "t", 0, None).unwrap();
        assert_eq!(value, Value::from(""));
        assert_eq!(f.scripting.evaluate(&mut ctx, None, "${{}}", "t", 0, None).unwrap(), Value::Null);
    }

    #[test]
    fn test_script_errors_are_reported_and_raised() {
        let f = fixture();
        let mut ctx = ActionContext::new(SecurityContext::anonymous().with_session("s1"));
        let task = task();

        let err = f
            .scripting
            .evaluate(&mut ctx, Some(&task), "${{\nerror('boom')\n}}", "onSave", 10, Some("t1"))
            .unwrap_err();
        assert_eq!(err, EvaluationError::script_failure());

        let messages = f.events.messages();
        assert_eq!(messages.len(), 1);
        let event = &messages[0].event;
        assert_eq!(messages[0].session_id.as_deref(), Some("s1"));
        assert_eq!(event.entity_type.as_deref(), Some("Task"));
        assert_eq!(event.node_id.as_deref(), Some("t1"));
        assert_eq!(event.name.as_deref(), Some("onSave"));
        assert_eq!(event.row, 12);
        assert!(event.message.as_deref().unwrap_or_default().contains("boom"));
        assert_eq!(f.scripting.event_log().entries().len(), 1);
    }

    #[test]
    fn test_application_errors_pass_through() {
        let f = fixture();
        let mut ctx = ActionContext::default();
        let err = f
            .scripting
            .evaluate(&mut ctx, None, "${{ fail(409, 'conflict') }}", "t", 0, None)
            .unwrap_err();
        assert_eq!(err, EvaluationError::Application(FrameworkError::new(409, "conflict")));
        assert!(f.events.messages().is_empty());
    }

    #[test]
    fn test_unknown_engine_is_a_reported_failure() {
        let f = fixture();
        let mut ctx = ActionContext::default();
        let err = f.scripting.evaluate(&mut ctx, None, "${Python{ 1 }}", "t", 0, None).unwrap_err();
        assert_eq!(err, EvaluationError::script_failure());
        assert_eq!(f.events.messages().len(), 1);
    }

    #[test]
    fn test_notification_flag_is_restored() {
        let f = fixture();
        let mut ctx = ActionContext::default();
        assert!(ctx.security.do_transaction_notifications);
        let _ = f.scripting.evaluate(&mut ctx, None, "${{ error('x') }}", "t", 0, None);
        assert!(ctx.security.do_transaction_notifications);

        ctx.security.do_transaction_notifications = false;
        f.scripting.evaluate(&mut ctx, None, "${ 1 }", "t", 0, None).unwrap();
        assert!(!ctx.security.do_transaction_notifications);
    }

    #[test]
    fn test_replace_variables_recovers_from_bad_expressions() {
        let f = fixture();
        let mut ctx = ActionContext::default();
        let out = f
            .scripting
            .replace_variables(&mut ctx, None, Some("a${ 1/0 }b"), false, "t")
            .unwrap();
        assert_eq!(out.as_deref(), Some("ab"));
        assert_eq!(f.events.messages().len(), 1);
        assert_eq!(ctx.events.len(), 1);
    }

    #[test]
    fn test_replace_variables_substitutes_in_order() {
        let f = fixture();
        let mut ctx = ActionContext::default().with_constant("n", Value::Int(2));
        let task = task();
        let out = f
            .scripting
            .replace_variables(&mut ctx, Some(&task), Some("${n}+${n} = ${ n + n } for ${this.name}${missing}"), false, "t")
            .unwrap();
        assert_eq!(out.as_deref(), Some("2+2 = 4 for Write docs"));
    }

    #[test]
    fn test_replace_variables_edge_cases() {
        let f = fixture();
        let mut ctx = ActionContext::default();
        let s = &f.scripting;
        assert_eq!(s.replace_variables(&mut ctx, None, None, false, "t").unwrap(), None);
        assert_eq!(s.replace_variables(&mut ctx, None, Some(""), false, "t").unwrap().as_deref(), Some(""));
        assert_eq!(
            s.replace_variables(&mut ctx, None, Some("plain {text} $"), false, "t").unwrap().as_deref(),
            Some("plain {text} $")
        );
        assert_eq!(s.replace_variables(&mut ctx, None, Some(" ${missing} "), true, "t").unwrap(), None);

        let mut raw = ActionContext::default().raw();
        assert_eq!(
            s.replace_variables(&mut raw, None, Some("${ 1 + 1 }"), false, "t").unwrap().as_deref(),
            Some("${ 1 + 1 }")
        );
    }

    fn task_schema() -> CompiledSchema {
        let function = |read: Option<&str>, write: Option<&str>| PropertyKind::Function {
            read_function: read.map(str::to_string),
            write_function: write.map(str::to_string),
        };
        let mut model = SchemaModel::builtin();
        {
            let project = model.add_type("Project");
            project.extends = Some("AbstractNode".to_string());
            project.add_property("code", PropertyKind::String);
        }
        {
            let task = model.add_type("Task");
            task.extends = Some("AbstractNode".to_string());
            task.add_property("label", function(Some("concat(this.name, '!')"), None));
            task.add_property(
                "title",
                function(Some("${{ return this.name }}"), Some("${{ set(this, 'name', string.upper(value)) }}")),
            );
            task.add_property("echo", function(None, Some("${{ print(value) }}")));
            task.add_property("recursive", function(Some("concat('x', this.recursive)"), None));
            task.add_property("sneaky", function(Some("${{ set(this, 'name', 'changed') }}"), None));
        }
        model
            .relate("Project", "has", "Task", Cardinality::OneToMany)
            .named("project", "tasks");
        compile(&model, &CompileEnv::default()).unwrap()
    }

    /// A committed "Docs" task owned by project "P1"; returns the task id
    fn seed(graph: &MemoryGraph, schema: &CompiledSchema) -> String {
        let mut tx = graph.begin();
        let mut writer = WriteContext::new(&mut tx, schema);
        let project = writer
            .create("Project", json!({ "code": "P1" }).as_object().unwrap())
            .unwrap();
        let task = writer
            .create("Task", json!({ "name": "Docs" }).as_object().unwrap())
            .unwrap();
        writer.set(&task, "project", Value::from(project.as_str())).unwrap();
        tx.commit().unwrap();
        task
    }

    #[test]
    fn test_this_resolves_through_property_descriptors() {
        let f = fixture();
        let schema = task_schema();
        let graph = MemoryGraph::new();
        let task_id = seed(&graph, &schema);

        let mut tx = graph.begin();
        let task = tx.get(&task_id).cloned().unwrap();
        let mut ctx = ActionContext::default();
        let host = TransactionHost::writing(&f.scripting, &mut tx, &schema);
        let out = f
            .scripting
            .replace_variables_in(
                &host,
                &mut ctx,
                Some(&task),
                Some("${ this.label } of ${ this.project.code } / ${{ return this.label .. this.project.code }}"),
                false,
                "t",
            )
            .unwrap();
        assert_eq!(out.as_deref(), Some("Docs! of P1 / Docs!P1"));
        assert!(ctx.events.is_empty());
    }

    #[test]
    fn test_expression_graph_functions() {
        let f = fixture();
        let schema = task_schema();
        let graph = MemoryGraph::new();
        let task_id = seed(&graph, &schema);

        let mut tx = graph.begin();
        let task = tx.get(&task_id).cloned().unwrap();
        let mut ctx = ActionContext::default();
        {
            let host = TransactionHost::writing(&f.scripting, &mut tx, &schema);
            let out = f
                .scripting
                .replace_variables_in(
                    &host,
                    &mut ctx,
                    Some(&task),
                    Some("${ size(find('Task', 'name', 'Docs')) } ${ get(this.id).label } ${ create('Project', { code: 'P2' }).code }"),
                    false,
                    "t",
                )
                .unwrap();
            assert_eq!(out.as_deref(), Some("1 Docs! P2"));
        }
        tx.commit().unwrap();
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn test_write_function_persists_through_the_transaction() {
        let f = fixture();
        let schema = task_schema();
        let graph = MemoryGraph::new();
        let task_id = seed(&graph, &schema);

        let mut tx = graph.begin();
        let mut ctx = ActionContext::default();
        {
            let functions = ScriptFunctions::new(&f.scripting, &mut ctx);
            let mut writer = WriteContext::new(&mut tx, &schema).with_functions(&functions);
            writer.set(&task_id, "title", Value::from("docs")).unwrap();
            writer.set(&task_id, "echo", Value::from("x")).unwrap();
        }
        tx.commit().unwrap();

        assert_eq!(graph.get(&task_id).unwrap().name(), Some("DOCS"));
        assert_eq!(ctx.output, "x");
        assert!(ctx.events.is_empty());
    }

    #[test]
    fn test_read_functions_cannot_write() {
        let f = fixture();
        let schema = task_schema();
        let graph = MemoryGraph::new();
        let task_id = seed(&graph, &schema);

        let tx = graph.begin();
        let task = tx.get(&task_id).unwrap();
        let mut ctx = ActionContext::default();
        {
            let functions = ScriptFunctions::new(&f.scripting, &mut ctx);
            let err = ReadContext::new(&tx, &schema)
                .with_functions(&functions)
                .read(task, "sneaky")
                .unwrap_err();
            assert_eq!(err, PropertyError::Evaluation(EvaluationError::script_failure()));
        }
        assert_eq!(ctx.events.len(), 1);
        assert!(ctx.events[0].message.as_deref().unwrap_or_default().contains("not allowed"));
        assert_eq!(task.name(), Some("Docs"));
    }

    #[test]
    fn test_self_referencing_function_property_stops() {
        let f = fixture();
        let schema = task_schema();
        let graph = MemoryGraph::new();
        let task_id = seed(&graph, &schema);

        let tx = graph.begin();
        let task = tx.get(&task_id).unwrap();
        let mut ctx = ActionContext::default();
        let value = {
            let functions = ScriptFunctions::new(&f.scripting, &mut ctx);
            ReadContext::new(&tx, &schema)
                .with_functions(&functions)
                .read(task, "recursive")
                .unwrap()
        };
        assert_eq!(value, Value::from("x".repeat(MAX_FUNCTION_NESTING)));
        assert_eq!(ctx.events.len(), 2);
        assert!(ctx.events[0].message.as_deref().unwrap_or_default().contains("nested too deeply"));
    }

    #[test]
    fn test_function_property_on_a_busy_context_is_reported() {
        let f = fixture();
        let schema = task_schema();
        let graph = MemoryGraph::new();
        let task_id = seed(&graph, &schema);

        let tx = graph.begin();
        let task = tx.get(&task_id).unwrap();
        let mut ctx = ActionContext::new(SecurityContext::anonymous().with_session("s2"));
        let functions = ScriptFunctions::new(&f.scripting, &mut ctx);
        let reader = ReadContext::new(&tx, &schema);

        let held = functions.ctx.borrow_mut();
        let err = functions
            .evaluate_read(&reader, task, "label", "concat(this.name, '!')")
            .unwrap_err();
        drop(held);
        assert_eq!(err, EvaluationError::script_failure());

        let messages = f.events.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].session_id.as_deref(), Some("s2"));
        assert_eq!(messages[0].event.entity_id.as_deref(), Some(task_id.as_str()));
        assert_eq!(f.scripting.event_log().entries().len(), 1);
    }

    #[test]
    fn test_self_referencing_lua_result_is_reported() {
        let f = fixture();
        let mut ctx = ActionContext::default();
        let out = f
            .scripting
            .replace_variables(&mut ctx, None, Some("a${{ local t = {} t.me = t return t }}b"), false, "t")
            .unwrap();
        assert_eq!(out.as_deref(), Some("ab"));
        assert_eq!(ctx.events.len(), 1);
        assert!(ctx.events[0].message.as_deref().unwrap_or_default().contains("contains itself"));
    }

    #[test]
    fn test_deeply_nested_expression_is_reported() {
        let f = fixture();
        let mut ctx = ActionContext::default();
        let source = format!("a${{ {}1{} }}b", "(".repeat(200_000), ")".repeat(200_000));
        let out = f
            .scripting
            .replace_variables(&mut ctx, None, Some(&source), false, "t")
            .unwrap();
        assert_eq!(out.as_deref(), Some("ab"));
        assert_eq!(ctx.events.len(), 1);
    }

    #[test]
    fn test_named_engine_parsing() {
        assert_eq!(named_engine("${Lua{ return 1 }}"), Some(("Lua", " return 1 ")));
        assert_eq!(named_engine("${ Lua{ return 1 } }"), Some(("Lua", " return 1 ")));
        assert_eq!(named_engine("${ { x: 1 } }"), None);
        assert_eq!(named_engine("${ upper('x') }"), None);
        assert_eq!(named_engine("${ this.a{1} }"), None);
    }
}
