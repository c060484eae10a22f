//! Script engine capability interface
//!
//! Every language the evaluator can dispatch to (the default expression
//! language, the general-purpose engine and any named alternate engine)
//! implements `ScriptEngine`.

use crate::error::FrameworkError;
use crate::graph::Entity;
use crate::script::context::ActionContext;
use crate::script::error::{ErrorLocation, EvaluationError};
use crate::script::expression::Expr;
use crate::script::host::ScriptHost;
use crate::script::snippet::{embed_in_function, Snippet};
use crate::value::Value;
use thiserror::Error;

/// Engine-level failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Application error thrown by host code called from the script
    #[error(transparent)]
    Application(FrameworkError),

    /// Syntax or runtime error inside the script
    #[error("{message}")]
    Script { message: String, location: ErrorLocation },
}

impl EngineError {
    pub fn script(message: impl Into<String>, location: ErrorLocation) -> Self {
        EngineError::Script {
            message: message.into(),
            location,
        }
    }
}

/// Engine-specific compiled representation
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledForm {
    /// Parsed expression tree
    Expression(Expr),
    /// Validated source, re-loaded per evaluation
    Source(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledScript {
    pub engine: String,
    pub form: CompiledForm,
}

/// A schema method callable on the bound entity
#[derive(Debug, Clone, PartialEq)]
pub struct MethodBinding {
    pub name: String,
    pub source: String,
}

/// What a script can see while it runs
pub struct Bindings<'a> {
    /// Snapshot of the bound entity, used when there is no host
    pub this: Option<Value>,
    pub entity: Option<&'a Entity>,
    /// Graph access; with a host `this` resolves through the descriptors
    pub host: Option<&'a dyn ScriptHost>,
    pub methods: Vec<MethodBinding>,
    pub date_format: &'a str,
    pub ctx: &'a mut ActionContext,
}

impl std::fmt::Debug for Bindings<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bindings")
            .field("this", &self.this)
            .field("entity", &self.entity.map(|e| &e.id))
            .field("host", &self.host.is_some())
            .field("methods", &self.methods)
            .finish()
    }
}

impl<'a> Bindings<'a> {
    pub fn new(ctx: &'a mut ActionContext, date_format: &'a str) -> Self {
        Self {
            this: None,
            entity: None,
            host: None,
            methods: Vec::new(),
            date_format,
            ctx,
        }
    }

    /// Value of a top-level name: `this`, then constants, then parameters
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if name == "this" {
            return match (self.entity, self.host) {
                (Some(entity), Some(_)) => Some(Value::Entity(entity.to_ref())),
                _ => self.this.clone(),
            };
        }
        self.ctx
            .constant(name)
            .or_else(|| self.ctx.parameters().get(name))
            .cloned()
    }

    /// Member `key` of `target`. Entity references are read through the
    /// host, so computed properties and accessors resolve.
    pub fn member(&mut self, target: &Value, key: &str) -> Result<Value, EvaluationError> {
        let (Value::Entity(reference), Some(host)) = (target, self.host) else {
            return Ok(target.member(key));
        };
        // the transaction's copy reflects writes made by this script
        match host.get(&reference.id)? {
            Some(entity) => host.read(self.ctx, &entity, key),
            None => match self.entity.filter(|bound| bound.id == reference.id) {
                Some(bound) => host.read(self.ctx, bound, key),
                None => Ok(target.member(key)),
            },
        }
    }
}

pub trait ScriptEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Source handed to `compile` for a snippet
    fn wrap(&self, snippet: &Snippet) -> String {
        embed_in_function(snippet)
    }

    fn compile(&self, source: &str) -> Result<CompiledScript, EngineError>;

    fn evaluate(&self, script: &CompiledScript, bindings: &mut Bindings<'_>) -> Result<Value, EngineError>;
}
