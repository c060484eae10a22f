//! Strata: schema-driven graph persistence and server-side scripting
//!
//! A runtime schema compiled into typed property descriptors over a graph
//! store, and a template/script evaluator that runs `${...}` expressions
//! against the entities that schema describes.

// Core configuration and setup
pub mod config;

// Structured application errors shared by every layer
pub mod error;

// Domain values passed between properties and scripts
pub mod value;

// Graph storage collaborators - entities, transactions, file content
pub mod graph;

// Schema model, compiler, migration repair and hot-swapped registry
pub mod schema;

// Typed property descriptors and entity operations
pub mod property;

// Template extraction and script evaluation
pub mod script;

// HTTP API layer - schema, node, render and file endpoints
pub mod api;

// Server setup and initialization
pub mod server;

pub use config::Config;
pub use error::{ErrorToken, FrameworkError};
pub use graph::{Entity, MemoryGraph};
pub use property::{ReadContext, WriteContext};
pub use schema::{CompiledSchema, SchemaModel, SchemaRegistry};
pub use script::{ActionContext, EvaluationError, Scripting, SecurityContext};
pub use server::start_server;
pub use value::Value;
