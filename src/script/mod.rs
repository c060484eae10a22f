//! Server-side scripting
//!
//! Expression extraction, per-evaluation action contexts, the default
//! expression language, the embedded Lua engine, graph access for scripts and the evaluator that
//! dispatches between them and reports script errors.

// Evaluation errors and structured scripting error events
pub mod error;

// `${...}` span extraction
pub mod extractor;

// Value formatting for substitution and logging
pub mod format;

// Per-evaluation state: security, buffers, variable buckets
pub mod context;

// Script snippets and import hoisting
pub mod snippet;

// Engine trait and bindings
pub mod engine;

// LRU cache of compiled sources
pub mod cache;

// Error broadcast and runtime event log
pub mod events;

// Default expression language
pub mod expression;

// Sandboxed Lua engine
pub mod lua;

// Graph access for running scripts
pub mod host;

// Dispatch, substitution and error reporting
pub mod scripting;

pub use context::{ActionContext, ErrorBuffer, SecurityContext};
pub use engine::{Bindings, CompiledScript, EngineError, ScriptEngine};
pub use error::{ErrorLocation, EvaluationError, ScriptingErrorEvent, SCRIPTING_ERROR};
pub use events::{BroadcastMessage, Broadcaster, ChannelBroadcaster, CollectingBroadcaster, RuntimeEvent, RuntimeEventLog};
pub use expression::ExpressionEngine;
pub use host::{ScriptHost, TransactionHost};
pub use extractor::{extract, extract_scripts, ExpressionSpan};
pub use lua::LuaEngine;
pub use scripting::{ScriptFunctions, Scripting};
pub use snippet::{ImportPattern, Snippet};
