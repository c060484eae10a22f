//! Scripting errors and the structured error event

use crate::error::FrameworkError;
use serde::Serialize;
use thiserror::Error;

/// Message used for every generic script failure
pub const SCRIPTING_ERROR: &str = "Server-side scripting error";

/// Failures surfaced by the scripting layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// Application error raised from inside a script, re-raised unchanged
    #[error(transparent)]
    Application(FrameworkError),

    /// Script failed; already reported as an error event
    #[error("{0}")]
    ScriptFailure(FrameworkError),

    /// A builtin was called with the wrong arguments
    #[error("Usage: {usage}")]
    Usage { function: String, usage: String },

    /// Graph access the running script is not allowed, e.g. a write from a
    /// read function
    #[error("{0}")]
    Host(String),
}

impl EvaluationError {
    pub fn script_failure() -> Self {
        EvaluationError::ScriptFailure(FrameworkError::new(422, SCRIPTING_ERROR))
    }

    pub fn usage(function: &str, usage: &str) -> Self {
        EvaluationError::Usage {
            function: function.to_string(),
            usage: usage.to_string(),
        }
    }

    pub fn to_framework_error(&self) -> FrameworkError {
        match self {
            EvaluationError::Application(err) | EvaluationError::ScriptFailure(err) => err.clone(),
            EvaluationError::Usage { .. } | EvaluationError::Host(_) => FrameworkError::new(422, self.to_string()),
        }
    }
}

/// Location of a script error, 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorLocation {
    pub row: usize,
    pub column: usize,
    pub end_row: usize,
    pub end_column: usize,
}

impl ErrorLocation {
    pub fn at(row: usize, column: usize) -> Self {
        Self {
            row,
            column,
            end_row: row,
            end_column: column,
        }
    }
}

impl Default for ErrorLocation {
    fn default() -> Self {
        Self::at(1, 1)
    }
}

/// Error event published to live sessions when a script fails
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptingErrorEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub row: usize,
    pub column: usize,
    pub end_row: usize,
    pub end_column: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_static_method: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ScriptingErrorEvent {
    /// Event for `message` at `location`, rows shifted by `start_row`
    pub fn new(message: Option<String>, location: ErrorLocation, start_row: usize) -> Self {
        Self {
            event_type: "SCRIPTING_ERROR".to_string(),
            row: location.row + start_row,
            column: location.column,
            end_row: location.end_row + start_row,
            end_column: location.end_column,
            message,
            entity_type: None,
            entity_id: None,
            static_type: None,
            is_static_method: None,
            node_type: None,
            node_id: None,
            name: None,
        }
    }
}
