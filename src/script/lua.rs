//! General-purpose script engine backed by embedded Lua
//!
//! Each evaluation gets a fresh sandboxed `Lua` state: `os`, `io`, `debug`
//! and `package` are removed and replaced by a small host API (`print`,
//! `log`, `now`, `date`, `time`, `fail`, `require`).
//!
//! With a script host bound, `find`, `get`, `create`, `set` and `delete`
//! reach the caller's transaction, and entity tables (`this` included)
//! resolve missing fields through the property descriptors.

use crate::error::FrameworkError;
use crate::graph::Entity;
use crate::script::context::ActionContext;
use crate::script::engine::{Bindings, CompiledForm, CompiledScript, EngineError, MethodBinding, ScriptEngine};
use crate::script::error::{ErrorLocation, EvaluationError};
use crate::script::format::{for_substitution, format_date};
use crate::script::host::ScriptHost;
use crate::script::snippet::Snippet;
use crate::value::{EntityRef, Value};
use regex::Regex;
use serde_json::Map;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::sync::{Arc, Mutex};

pub const ENGINE_NAME: &str = "Lua";

const CHUNK_NAME: &str = "script";
const ERROR_LINE: &str = r":(\d+):";

/// Metatable field marking host-backed entity tables
const ENTITY_MARKER: &str = "__entity";

/// Deepest table nesting converted back from Lua
const MAX_TABLE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct LuaEngine {
    name: String,
    /// Importable modules by name; each source returns the module value
    modules: Arc<BTreeMap<String, String>>,
    error_line: Regex,
}

impl LuaEngine {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            name: ENGINE_NAME.to_string(),
            modules: Arc::new(BTreeMap::new()),
            error_line: Regex::new(ERROR_LINE)?,
        })
    }

    /// Same engine registered under another name
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_module(mut self, name: &str, source: &str) -> Self {
        Arc::make_mut(&mut self.modules).insert(name.to_string(), source.to_string());
        self
    }

    fn location(&self, message: &str) -> ErrorLocation {
        self.error_line
            .captures(message)
            .and_then(|c| c[1].parse().ok())
            .map_or_else(ErrorLocation::default, |row| ErrorLocation::at(row, 1))
    }

    fn script_error(&self, message: &str) -> EngineError {
        let message = message.split("\nstack traceback:").next().unwrap_or(message).trim();
        EngineError::script(message, self.location(message))
    }

    /// Unwrap callback and context layers down to the error that caused them
    fn map_error(&self, err: &mlua::Error) -> EngineError {
        match err {
            mlua::Error::CallbackError { cause, .. } => self.map_error(cause),
            mlua::Error::WithContext { cause, .. } => self.map_error(cause),
            mlua::Error::ExternalError(inner) => match inner.downcast_ref::<FrameworkError>() {
                Some(app) => EngineError::Application(app.clone()),
                None => self.script_error(&inner.to_string()),
            },
            mlua::Error::SyntaxError { message, .. } => self.script_error(message),
            mlua::Error::RuntimeError(message) => self.script_error(message),
            other => self.script_error(&other.to_string()),
        }
    }

    fn sandbox(&self, date_format: &str, output: Arc<Mutex<String>>) -> mlua::Result<mlua::Lua> {
        let lua = mlua::Lua::new();
        let globals = lua.globals();

        for name in ["os", "io", "debug", "package", "dofile", "loadfile"] {
            globals.set(name, mlua::Nil)?;
        }

        let pattern = date_format.to_string();
        globals.set(
            "date",
            lua.create_function(move |_, format: Option<String>| {
                Ok(format_date(&chrono::Utc::now(), format.as_deref().unwrap_or(&pattern)))
            })?,
        )?;
        globals.set("time", lua.create_function(|_, ()| Ok(chrono::Utc::now().timestamp()))?)?;
        globals.set("now", lua.create_function(|_, ()| Ok(chrono::Utc::now().to_rfc3339()))?)?;

        let pattern = date_format.to_string();
        globals.set(
            "print",
            lua.create_function(move |_, args: mlua::Variadic<mlua::Value>| {
                let mut buffer = output.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                for arg in args {
                    buffer.push_str(&for_substitution(&lua_to_value(arg)?, &pattern));
                }
                Ok(())
            })?,
        )?;

        let pattern = date_format.to_string();
        globals.set(
            "log",
            lua.create_function(move |_, args: mlua::Variadic<mlua::Value>| {
                let parts = args
                    .into_iter()
                    .map(|arg| lua_to_value(arg).map(|v| crate::script::format::for_logging(&v, &pattern)))
                    .collect::<mlua::Result<Vec<_>>>()?;
                tracing::info!("📜 {}", parts.join(" "));
                Ok(())
            })?,
        )?;

        globals.set(
            "fail",
            lua.create_function(|_, (status, message): (u16, String)| {
                Err::<(), _>(mlua::Error::external(FrameworkError::new(status, message)))
            })?,
        )?;

        let modules = Arc::clone(&self.modules);
        globals.set(
            "require",
            lua.create_function(move |lua, name: String| match modules.get(&name) {
                Some(source) => lua.load(source.as_str()).set_name(name.as_str()).eval::<mlua::Value>(),
                None => Err(mlua::Error::RuntimeError(format!("module '{}' not found", name))),
            })?,
        )?;

        Ok(lua)
    }

    fn bind(&self, lua: &mlua::Lua, bindings: &Bindings<'_>) -> mlua::Result<()> {
        let globals = lua.globals();

        for (key, value) in bindings.ctx.constants() {
            globals.set(key.as_str(), value_to_lua(lua, value, None)?)?;
        }

        let parameters = lua.create_table()?;
        for (key, value) in bindings.ctx.parameters() {
            parameters.set(key.as_str(), value_to_lua(lua, value, None)?)?;
        }
        globals.set("parameters", parameters)?;

        // with a host, `this` is bound lazily inside the evaluation scope
        if bindings.host.is_some() {
            return Ok(());
        }
        if let Some(this) = &bindings.this {
            let this = value_to_lua(lua, this, None)?;
            if let mlua::Value::Table(table) = &this {
                attach_methods(lua, table, &bindings.methods)?;
            }
            globals.set("this", this)?;
        }
        Ok(())
    }

    fn run(&self, source: &str, bindings: &mut Bindings<'_>) -> Result<Value, EngineError> {
        let output = Arc::new(Mutex::new(String::new()));
        let lua = self
            .sandbox(bindings.date_format, Arc::clone(&output))
            .map_err(|e| self.map_error(&e))?;
        self.bind(&lua, bindings).map_err(|e| self.map_error(&e))?;

        let host = bindings.host;
        let bound = bindings.entity;
        let methods = &bindings.methods;
        let ctx = RefCell::new(&mut *bindings.ctx);
        let result = lua.scope(|scope| {
            if let Some(host) = host {
                let entities = install_host(&lua, scope, host, bound, &ctx)?;
                if let Some(entity) = bound {
                    let this = entity_table(&lua, &entity.to_ref(), &entities)?;
                    attach_methods(&lua, &this, methods)?;
                    lua.globals().set("this", this)?;
                }
            }
            lua.load(source)
                .set_name(CHUNK_NAME)
                .eval::<mlua::Value>()
                .and_then(lua_to_value)
        });
        drop(ctx);

        let printed = std::mem::take(&mut *output.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        bindings.ctx.output.push_str(&printed);

        result.map_err(|e| self.map_error(&e))
    }
}

fn attach_methods(lua: &mlua::Lua, table: &mlua::Table, methods: &[MethodBinding]) -> mlua::Result<()> {
    for MethodBinding { name, source } in methods {
        let method = lua.load(source.as_str()).set_name(name.as_str()).into_function()?;
        table.raw_set(name.as_str(), method)?;
    }
    Ok(())
}

fn host_error(err: EvaluationError) -> mlua::Error {
    match err {
        EvaluationError::Application(app) => mlua::Error::external(app),
        other => mlua::Error::RuntimeError(other.to_string()),
    }
}

/// Id of an entity table or an id string
fn target_id(target: &mlua::Value) -> mlua::Result<String> {
    let id = match target {
        mlua::Value::String(id) => Some(id.to_str()?.to_string()),
        mlua::Value::Table(table) => table.raw_get::<Option<String>>("id")?,
        _ => None,
    };
    id.ok_or_else(|| mlua::Error::RuntimeError("expected an entity or an entity id".to_string()))
}

fn entity_table(lua: &mlua::Lua, entity: &EntityRef, entities: &mlua::Table) -> mlua::Result<mlua::Table> {
    let table = lua.create_table()?;
    table.raw_set("id", entity.id.as_str())?;
    table.raw_set("type", entity.type_name.as_str())?;
    table.set_metatable(Some(entities.clone()))?;
    Ok(table)
}

/// Register the graph functions and return the metatable shared by every
/// entity table
fn install_host<'scope>(
    lua: &mlua::Lua,
    scope: &'scope mlua::Scope<'scope, '_>,
    host: &'scope dyn ScriptHost,
    bound: Option<&'scope Entity>,
    ctx: &'scope RefCell<&mut ActionContext>,
) -> mlua::Result<mlua::Table> {
    let busy = || mlua::Error::RuntimeError("graph functions cannot be nested".to_string());
    let globals = lua.globals();
    let entities = lua.create_table()?;
    entities.raw_set(ENTITY_MARKER, true)?;

    let index = scope.create_function(move |lua, (table, key): (mlua::Table, mlua::Value)| {
        let mlua::Value::String(key) = key else {
            return Ok(mlua::Value::Nil);
        };
        let key = key.to_str()?.to_string();
        let id: String = table.raw_get("id")?;
        let mut ctx = ctx.try_borrow_mut().map_err(|_| busy())?;
        let value = match host.get(&id).map_err(host_error)? {
            Some(entity) => host.read(&mut **ctx, &entity, &key),
            None => match bound.filter(|entity| entity.id == id) {
                Some(entity) => host.read(&mut **ctx, entity, &key),
                None => Ok(Value::Null),
            },
        }
        .map_err(host_error)?;
        value_to_lua(lua, &value, table.metatable().as_ref())
    })?;
    entities.raw_set("__index", index)?;

    let shared = entities.clone();
    globals.set(
        "get",
        scope.create_function(move |lua, target: mlua::Value| {
            let id = target_id(&target)?;
            match host.get(&id).map_err(host_error)? {
                Some(entity) => entity_table(lua, &entity.to_ref(), &shared).map(mlua::Value::Table),
                None => Ok(mlua::Value::Nil),
            }
        })?,
    )?;

    let shared = entities.clone();
    globals.set(
        "find",
        scope.create_function(move |lua, (type_name, key, value): (String, String, mlua::Value)| {
            let value = lua_to_value(value)?;
            let found = host.find(&type_name, &key, &value).map_err(host_error)?;
            let list = lua.create_table()?;
            for (i, entity) in found.iter().enumerate() {
                list.raw_set(i + 1, entity_table(lua, &entity.to_ref(), &shared)?)?;
            }
            Ok(list)
        })?,
    )?;

    let shared = entities.clone();
    globals.set(
        "create",
        scope.create_function(move |lua, (type_name, input): (String, Option<mlua::Value>)| {
            let input = match input.map(lua_to_value).transpose()? {
                Some(Value::Map(map)) => map.iter().map(|(key, value)| (key.clone(), value.to_json())).collect(),
                None | Some(Value::Null) => Map::new(),
                Some(_) => {
                    return Err(mlua::Error::RuntimeError(
                        "create(type, properties) expects a table of properties".to_string(),
                    ))
                }
            };
            let mut ctx = ctx.try_borrow_mut().map_err(|_| busy())?;
            let entity = host.create(&mut **ctx, &type_name, &input).map_err(host_error)?;
            entity_table(lua, &entity.to_ref(), &shared)
        })?,
    )?;

    globals.set(
        "set",
        scope.create_function(move |_, (target, key, value): (mlua::Value, String, mlua::Value)| {
            let id = target_id(&target)?;
            let value = lua_to_value(value)?;
            let mut ctx = ctx.try_borrow_mut().map_err(|_| busy())?;
            host.set(&mut **ctx, &id, &key, value).map_err(host_error)
        })?,
    )?;

    globals.set(
        "delete",
        scope.create_function(move |_, target: mlua::Value| {
            let id = target_id(&target)?;
            let mut ctx = ctx.try_borrow_mut().map_err(|_| busy())?;
            let deleted = host.delete(&mut **ctx, &id).map_err(host_error)?;
            Ok(deleted.len())
        })?,
    )?;

    Ok(entities)
}

impl ScriptEngine for LuaEngine {
    fn name(&self) -> &str {
        &self.name
    }

    /// `main` wrapper in Lua syntax; imports become `require` calls
    fn wrap(&self, snippet: &Snippet) -> String {
        if !snippet.embed {
            return snippet.source.clone();
        }
        if !snippet.is_module() {
            return format!("local function main() {}\nend\n\nreturn main()", snippet.source);
        }

        let mut requires = Vec::new();
        for (n, import) in snippet.imports.iter().enumerate() {
            let module = format!("__import_{}", n + 1);
            let mut statement = format!("local {} = require({:?})", module, import.module);
            if let Some(binding) = &import.default_binding {
                statement.push_str(&format!("; local {} = {}", binding, module));
            }
            if !import.named.is_empty() {
                let locals: Vec<&str> = import.named.iter().map(|(_, local)| local.as_str()).collect();
                let fields: Vec<String> = import
                    .named
                    .iter()
                    .map(|(exported, _)| format!("{}.{}", module, exported))
                    .collect();
                statement.push_str(&format!("; local {} = {}", locals.join(", "), fields.join(", ")));
            }
            requires.push(statement);
        }

        format!(
            "{}\nlocal function main()\n{}\nend\n\nreturn main()",
            requires.join("\n"),
            snippet.body
        )
    }

    fn compile(&self, source: &str) -> Result<CompiledScript, EngineError> {
        let lua = mlua::Lua::new();
        lua.load(source)
            .set_name(CHUNK_NAME)
            .into_function()
            .map_err(|e| self.map_error(&e))?;
        Ok(CompiledScript {
            engine: self.name.clone(),
            form: CompiledForm::Source(source.to_string()),
        })
    }

    fn evaluate(&self, script: &CompiledScript, bindings: &mut Bindings<'_>) -> Result<Value, EngineError> {
        match &script.form {
            CompiledForm::Source(source) => self.run(source, bindings),
            CompiledForm::Expression(_) => Err(EngineError::script(
                format!("{} cannot run an expression", self.name),
                ErrorLocation::default(),
            )),
        }
    }
}

/// Convert a value for Lua; with `entities` set, entity references become
/// host-backed entity tables
fn value_to_lua(lua: &mlua::Lua, value: &Value, entities: Option<&mlua::Table>) -> mlua::Result<mlua::Value> {
    Ok(match value {
        Value::Null => mlua::Value::Nil,
        Value::Bool(b) => mlua::Value::Boolean(*b),
        Value::Int(i) => mlua::Value::Integer(*i),
        Value::Float(f) => mlua::Value::Number(*f),
        Value::String(s) => mlua::Value::String(lua.create_string(s)?),
        Value::Date(d) => mlua::Value::String(lua.create_string(d.to_rfc3339())?),
        Value::List(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.set(i + 1, value_to_lua(lua, item, entities)?)?;
            }
            mlua::Value::Table(table)
        }
        Value::Map(map) => {
            let table = lua.create_table()?;
            for (key, item) in map {
                table.set(key.as_str(), value_to_lua(lua, item, entities)?)?;
            }
            mlua::Value::Table(table)
        }
        Value::Entity(entity) => match entities {
            Some(entities) => mlua::Value::Table(entity_table(lua, entity, entities)?),
            None => {
                let table = lua.create_table()?;
                table.set("id", entity.id.as_str())?;
                table.set("type", entity.type_name.as_str())?;
                if let Some(name) = &entity.name {
                    table.set("name", name.as_str())?;
                }
                mlua::Value::Table(table)
            }
        },
    })
}

/// Convert a Lua value; tables with keys 1..n become lists and
/// host-backed entity tables become entity references
fn lua_to_value(lua_value: mlua::Value) -> mlua::Result<Value> {
    convert(lua_value, &mut Vec::new())
}

/// `path` holds the tables being converted, outermost first
fn convert(lua_value: mlua::Value, path: &mut Vec<*const c_void>) -> mlua::Result<Value> {
    match lua_value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::Int(i)),
        mlua::Value::Number(f) => Ok(Value::Float(f)),
        mlua::Value::String(s) => Ok(Value::String(s.to_str()?.to_string())),
        mlua::Value::Table(table) => {
            if let Some(entity) = entity_ref(&table)? {
                return Ok(Value::Entity(entity));
            }
            let pointer = table.to_pointer();
            if path.contains(&pointer) {
                return Err(mlua::Error::RuntimeError(
                    "Cannot convert a table that contains itself".to_string(),
                ));
            }
            if path.len() >= MAX_TABLE_DEPTH {
                return Err(mlua::Error::RuntimeError(format!(
                    "Cannot convert tables nested deeper than {} levels",
                    MAX_TABLE_DEPTH
                )));
            }
            path.push(pointer);
            let converted = convert_table(&table, path);
            path.pop();
            converted
        }
        _ => Ok(Value::Null),
    }
}

fn convert_table(table: &mlua::Table, path: &mut Vec<*const c_void>) -> mlua::Result<Value> {
    let mut is_array = true;
    let mut max_index = 0;
    let mut count = 0;

    for pair in table.pairs::<mlua::Value, mlua::Value>() {
        let (key, _) = pair?;
        count += 1;
        match key {
            mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
            _ => {
                is_array = false;
                break;
            }
        }
    }

    if is_array && count > 0 && count == max_index {
        let mut items = Vec::with_capacity(max_index);
        for i in 1..=max_index {
            items.push(convert(table.raw_get(i)?, path)?);
        }
        return Ok(Value::List(items));
    }

    let mut map = BTreeMap::new();
    for pair in table.pairs::<mlua::Value, mlua::Value>() {
        let (key, value) = pair?;
        let key = match key {
            mlua::Value::String(s) => s.to_str()?.to_string(),
            mlua::Value::Integer(i) => i.to_string(),
            mlua::Value::Number(f) => f.to_string(),
            _ => continue,
        };
        // methods attached to `this` are not data
        if matches!(value, mlua::Value::Function(_)) {
            continue;
        }
        map.insert(key, convert(value, path)?);
    }
    Ok(Value::Map(map))
}

fn entity_ref(table: &mlua::Table) -> mlua::Result<Option<EntityRef>> {
    let Some(meta) = table.metatable() else {
        return Ok(None);
    };
    if !meta.raw_get::<Option<bool>>(ENTITY_MARKER)?.unwrap_or(false) {
        return Ok(None);
    }
    Ok(Some(EntityRef {
        id: table.raw_get("id")?,
        type_name: table.raw_get("type")?,
        name: None,
    }))
}
