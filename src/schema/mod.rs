//! Schema layer
//!
//! Model, canonical serialization, compilation into live type descriptors,
//! migration repair, persistence and the atomically swapped registry.

use crate::error::ErrorToken;
use thiserror::Error;

// Authoritative schema model
pub mod types;

// Canonical JSON document (export/import)
pub mod export;

// Model to compiled descriptors
pub mod compiler;

// Compiled schema and entity operations on it
pub mod compiled;

// Migration handler chain and repair loop
pub mod migration;

// SQLite persistence of schema documents
pub mod storage;

// Hot-swappable registry of the compiled schema
pub mod registry;

pub use compiled::{CompiledSchema, MethodDescriptor, PropertyListing, RelationshipDescriptor, TypeDescriptor};
pub use compiler::{compile, fqcn, CompileEnv};
pub use migration::{compile_with_repair, default_handlers, MigrationHandler, RemoveMethodsWithUnusedSignature};
pub use registry::SchemaRegistry;
pub use storage::SchemaStorage;
pub use types::{
    Cardinality, Cascade, Constraints, ElementKind, EnumSource, NotionSpec, PropertyKind, SchemaMethod,
    SchemaModel, SchemaProperty, SchemaRelationship, SchemaType, PUBLIC_VIEW,
};

/// Schema failures
#[derive(Error, Debug)]
pub enum SchemaError {
    /// Malformed schema; blocks compilation and is not retried
    #[error("Schema configuration error in {type_name}: {message}")]
    Configuration { type_name: String, message: String },

    /// Inconsistency found while compiling; fed to the migration handlers
    #[error("Schema compilation failed: {}", format_tokens(.0))]
    Compilation(Vec<ErrorToken>),

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Built-in type {0} cannot be removed or redefined")]
    BuiltinType(String),

    #[error("Invalid schema document: {0}")]
    Format(String),

    #[error("Schema JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Schema storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl SchemaError {
    pub fn configuration(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        SchemaError::Configuration {
            type_name: type_name.into(),
            message: message.into(),
        }
    }
}

fn format_tokens(tokens: &[ErrorToken]) -> String {
    tokens
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
