//! Per-evaluation execution state
//!
//! Every request gets its own `ActionContext`. Nested evaluations (function
//! properties, schema methods) run on a `fork()` and fold their results back
//! with `merge()`. Forking copies each bucket shallowly and shares the store.

use crate::error::ErrorToken;
use crate::script::error::ScriptingErrorEvent;
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Who is evaluating and whether commits should notify live sessions
#[derive(Debug, Clone)]
pub struct SecurityContext {
    pub principal: Option<String>,
    pub session_id: Option<String>,
    pub do_transaction_notifications: bool,
}

impl SecurityContext {
    pub fn anonymous() -> Self {
        Self {
            principal: None,
            session_id: None,
            do_transaction_notifications: true,
        }
    }

    pub fn for_principal(principal: impl Into<String>) -> Self {
        Self {
            principal: Some(principal.into()),
            ..Self::anonymous()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self::anonymous()
    }
}

/// Accumulated validation tokens of one evaluation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorBuffer {
    tokens: Vec<ErrorToken>,
}

impl ErrorBuffer {
    pub fn add(&mut self, token: ErrorToken) {
        self.tokens.push(token);
    }

    pub fn has_error(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[ErrorToken] {
        &self.tokens
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }
}

/// Store shared between a context and all of its forks
pub type SharedStore = Arc<Mutex<BTreeMap<String, Value>>>;

#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub security: SecurityContext,
    /// Text written by `print`
    pub output: String,
    pub errors: ErrorBuffer,
    /// Error events reported while evaluating with this context
    pub events: Vec<ScriptingErrorEvent>,
    constants: BTreeMap<String, Value>,
    parameters: BTreeMap<String, Value>,
    data: BTreeMap<String, Value>,
    store: SharedStore,
    /// Return template values unmodified
    raw: bool,
    /// Forks between this context and the request's root context
    nesting: usize,
}

impl ActionContext {
    pub fn new(security: SecurityContext) -> Self {
        Self {
            security,
            ..Self::default()
        }
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    pub fn returns_raw_value(&self) -> bool {
        self.raw
    }

    pub fn set_raw(&mut self, raw: bool) {
        self.raw = raw;
    }

    pub fn with_constant(mut self, key: impl Into<String>, value: Value) -> Self {
        self.constants.insert(key.into(), value);
        self
    }

    pub fn set_constant(&mut self, key: impl Into<String>, value: Value) {
        self.constants.insert(key.into(), value);
    }

    pub fn constant(&self, key: &str) -> Option<&Value> {
        self.constants.get(key)
    }

    pub fn constants(&self) -> &BTreeMap<String, Value> {
        &self.constants
    }

    pub fn set_parameter(&mut self, key: impl Into<String>, value: Value) {
        self.parameters.insert(key.into(), value);
    }

    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn data(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn store_put(&self, key: impl Into<String>, value: Value) {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.into(), value);
    }

    pub fn store_get(&self, key: &str) -> Option<Value> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    pub fn nesting(&self) -> usize {
        self.nesting
    }

    /// Child context: buckets copied, store shared, output and errors empty
    pub fn fork(&self) -> Self {
        Self {
            security: self.security.clone(),
            output: String::new(),
            errors: ErrorBuffer::default(),
            events: Vec::new(),
            constants: self.constants.clone(),
            parameters: self.parameters.clone(),
            data: self.data.clone(),
            store: Arc::clone(&self.store),
            raw: self.raw,
            nesting: self.nesting + 1,
        }
    }

    /// Fold a forked child back into this context
    pub fn merge(&mut self, child: ActionContext) {
        self.data.extend(child.data);
        self.parameters.extend(child.parameters);
        self.output.push_str(&child.output);
        for token in child.errors.tokens {
            self.errors.add(token);
        }
        self.events.extend(child.events);
    }
}
