//! Property system
//!
//! Typed property descriptors compiled from the schema model. Each descriptor
//! owns its converters and enforces its constraints at write time, inside the
//! caller's transaction.

use crate::error::{ErrorToken, FrameworkError};
use crate::graph::{Entity, GraphError};
use crate::script::EvaluationError;
use crate::value::Value;
use serde_json::Value as JsonValue;
use std::fmt;
use thiserror::Error;

// Kind converters (storage and input forms)
pub mod converter;

// Stored primitive properties
pub mod primitive;

// Script-computed properties
pub mod function;

// Relationship accessors and endpoint properties
pub mod relation;

// Notion projections over relationship accessors
pub mod notion;

// Read/write contexts and entity operations
pub mod context;

pub use context::{ReadContext, WriteContext};
pub use converter::{ConversionError, Converter};
pub use function::FunctionProperty;
pub use notion::NotionProperty;
pub use primitive::ValueProperty;
pub use relation::{Endpoint, EndpointProperty, RelatedNodeProperty, RelationLink};

/// Sort classification used by query layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SortType {
    Default,
    Integer,
    Long,
    Double,
}

/// Static facts about a compiled property
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyInfo {
    pub name: String,
    pub declaring_type: String,
    /// Value type name, e.g. `String`, `Integer[]`, `Task`
    pub kind_name: String,
    pub sort_type: SortType,
    pub is_collection: bool,
    /// Declared by the built-in schema
    pub is_builtin: bool,
    pub required: bool,
    pub unique: bool,
    pub indexed: bool,
    /// Persisted in the entity's property map
    pub stored: bool,
}

impl PropertyInfo {
    pub fn new(name: &str, declaring_type: &str, kind_name: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            declaring_type: declaring_type.to_string(),
            kind_name: kind_name.into(),
            sort_type: SortType::Default,
            is_collection: false,
            is_builtin: false,
            required: false,
            unique: false,
            indexed: false,
            stored: false,
        }
    }

    /// User-defined rather than built-in
    pub fn is_dynamic(&self) -> bool {
        !self.is_builtin
    }

    pub fn token(&self, token: &str, detail: impl Into<String>) -> ErrorToken {
        ErrorToken::new(&self.declaring_type, token)
            .with_property(&self.name)
            .with_detail(detail)
    }
}

/// Property failures
#[derive(Error, Debug, PartialEq)]
pub enum PropertyError {
    /// Constraint or conversion failure; maps to a 422 response
    #[error("Validation failed: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    Validation(Vec<ErrorToken>),

    #[error("Property {0} is read-only")]
    ReadOnly(String),

    #[error("Unknown entity type: {0}")]
    UnknownType(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}

impl PropertyError {
    pub fn invalid(token: ErrorToken) -> Self {
        PropertyError::Validation(vec![token])
    }

    /// Structured application error for callers that report HTTP-style statuses
    pub fn to_framework_error(&self) -> FrameworkError {
        match self {
            PropertyError::Validation(tokens) => FrameworkError::unprocessable(tokens.clone()),
            PropertyError::ReadOnly(_) => FrameworkError::new(422, self.to_string()),
            PropertyError::UnknownType(_) => FrameworkError::new(404, self.to_string()),
            PropertyError::Graph(GraphError::NotFound(_)) => FrameworkError::new(404, self.to_string()),
            PropertyError::Graph(GraphError::Conflict(_)) => FrameworkError::new(409, self.to_string()),
            PropertyError::Graph(_) => FrameworkError::new(422, self.to_string()),
            PropertyError::Evaluation(err) => err.to_framework_error(),
        }
    }
}

/// Evaluates script sources on behalf of computed properties
///
/// Both calls bind `entity` as `this` and hand the script the caller's
/// transaction, read-only for `evaluate_read`.
pub trait FunctionEvaluator {
    fn evaluate_read(
        &self,
        ctx: &ReadContext<'_>,
        entity: &Entity,
        property: &str,
        source: &str,
    ) -> Result<Value, EvaluationError>;

    /// Runs with the written value bound as `value`
    fn evaluate_write(
        &self,
        ctx: &mut WriteContext<'_>,
        entity: &Entity,
        property: &str,
        source: &str,
        value: &Value,
    ) -> Result<(), EvaluationError>;
}

/// A compiled property
pub trait PropertyDescriptor: Send + Sync + fmt::Debug {
    fn info(&self) -> &PropertyInfo;

    fn name(&self) -> &str {
        &self.info().name
    }

    /// Current domain value of the property on `entity`
    fn read(&self, ctx: &ReadContext<'_>, entity: &Entity) -> Result<Value, PropertyError>;

    /// Validate and persist `value` on the entity with id `entity_id`
    fn write(&self, ctx: &mut WriteContext<'_>, entity_id: &str, value: Value) -> Result<(), PropertyError>;

    /// Domain value to persisted representation; `None` removes the value
    fn to_storage_form(&self, value: &Value) -> Result<Option<JsonValue>, PropertyError> {
        let _ = value;
        Ok(None)
    }

    /// Persisted representation to domain value
    fn from_storage_form(&self, stored: Option<&JsonValue>) -> Value {
        let _ = stored;
        Value::Null
    }

    /// External (API) representation to domain value
    fn from_input_form(&self, external: &JsonValue) -> Result<Value, PropertyError> {
        Ok(Value::from_json(external))
    }

    /// Default value in input form, applied when an entity is created
    fn default_value(&self) -> Option<&str> {
        None
    }

    /// Relationship wiring for accessor properties
    fn relation(&self) -> Option<&RelationLink> {
        None
    }
}
