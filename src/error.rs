//! Shared error vocabulary
//!
//! `ErrorToken` is the structured unit every layer reports with: schema
//! compilation, property validation and script evaluation all describe what
//! went wrong as a list of tokens. `FrameworkError` is the application error
//! that crosses script runtime boundaries untouched.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A single structured error: which type (and optionally which property)
/// failed, a machine-readable token and a human readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorToken {
    /// Type the error belongs to (schema type, relationship or entity type)
    #[serde(rename = "type")]
    pub type_name: String,
    /// Property involved, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    /// Machine-readable token, e.g. `must_not_be_empty` or `compiler_error`
    pub token: String,
    /// Free-form detail message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorToken {
    pub fn new(type_name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            property: None,
            token: token.into(),
            detail: None,
        }
    }

    pub fn with_property(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for ErrorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name)?;
        if let Some(property) = &self.property {
            write!(f, ".{}", property)?;
        }
        write!(f, " {}", self.token)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

/// Structured application error with an HTTP-style status code.
///
/// Raised by the persistence layer (validation), by builtins such as `fail`
/// or `assert`, and by the scripting layer itself (422 for generic script
/// failures). When one of these is thrown from inside a script it is
/// re-raised unchanged so the caller's transaction can roll back.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{status} {message}")]
pub struct FrameworkError {
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tokens: Vec<ErrorToken>,
}

impl FrameworkError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            tokens: Vec::new(),
        }
    }

    /// 422 with the given validation tokens
    pub fn unprocessable(tokens: Vec<ErrorToken>) -> Self {
        let message = tokens
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            status: 422,
            message,
            tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_display_includes_property_and_detail() {
        let token = ErrorToken::new("Project", "must_not_be_empty")
            .with_property("name")
            .with_detail("required");
        assert_eq!(token.to_string(), "Project.name must_not_be_empty: required");
    }

    #[test]
    fn test_unprocessable_joins_tokens() {
        let err = FrameworkError::unprocessable(vec![
            ErrorToken::new("Task", "already_taken").with_property("code"),
        ]);
        assert_eq!(err.status, 422);
        assert_eq!(err.message, "Task.code already_taken");
    }
}
