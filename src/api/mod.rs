//! HTTP API layer
//!
//! Thin REST consumers of the core:
//! - schema export, import and property listing
//! - node create/read/delete through the compiled property descriptors
//! - template rendering through the script evaluator
//! - file content upload through the storage providers

use crate::error::FrameworkError;
use crate::graph::{GraphError, MemoryGraph, StorageProviders};
use crate::property::PropertyError;
use crate::schema::{SchemaError, SchemaRegistry};
use crate::script::{EvaluationError, Scripting, SecurityContext};
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use std::sync::Arc;

// Schema export/import and property listings
pub mod schema;

// Node CRUD
pub mod nodes;

// Template rendering
pub mod render;

// Binary content upload
pub mod files;

/// Header carrying the caller's session, used to address error broadcasts
pub const SESSION_HEADER: &str = "x-session-id";

/// Shared resources of every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SchemaRegistry>,
    pub graph: Arc<MemoryGraph>,
    pub scripting: Arc<Scripting>,
    pub files: Arc<StorageProviders>,
}

/// Error response carrying the structured application error
#[derive(Debug)]
pub struct ApiError(pub FrameworkError);

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError(FrameworkError::new(404, message))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("❌ {}", self.0);
        } else {
            tracing::debug!("↩️ {}", self.0);
        }
        let body = Json(serde_json::json!({
            "code": self.0.status,
            "message": self.0.message,
            "errors": self.0.tokens,
        }));
        (status, body).into_response()
    }
}

impl From<FrameworkError> for ApiError {
    fn from(err: FrameworkError) -> Self {
        ApiError(err)
    }
}

impl From<PropertyError> for ApiError {
    fn from(err: PropertyError) -> Self {
        ApiError(err.to_framework_error())
    }
}

impl From<GraphError> for ApiError {
    fn from(err: GraphError) -> Self {
        ApiError(PropertyError::Graph(err).to_framework_error())
    }
}

impl From<EvaluationError> for ApiError {
    fn from(err: EvaluationError) -> Self {
        ApiError(err.to_framework_error())
    }
}

impl From<SchemaError> for ApiError {
    fn from(err: SchemaError) -> Self {
        let framework = match &err {
            SchemaError::Compilation(tokens) => FrameworkError::unprocessable(tokens.clone()),
            SchemaError::UnknownType(_) => FrameworkError::new(404, err.to_string()),
            SchemaError::Configuration { .. }
            | SchemaError::BuiltinType(_)
            | SchemaError::Format(_)
            | SchemaError::Json(_) => FrameworkError::new(422, err.to_string()),
            SchemaError::Storage(_) | SchemaError::Pattern(_) => FrameworkError::new(500, err.to_string()),
        };
        ApiError(framework)
    }
}

/// Security context of a request: anonymous, addressed by its session header
pub fn security_from(headers: &HeaderMap) -> SecurityContext {
    let security = SecurityContext::anonymous();
    match headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        Some(session) if !session.is_empty() => security.with_session(session),
        _ => security,
    }
}

/// Every API route
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(health_check))
        .merge(schema::create_schema_routes())
        .merge(nodes::create_node_routes())
        .merge(render::create_render_routes())
        .merge(files::create_file_routes())
}

async fn health_check() -> &'static str {
    "ok"
}

#[cfg(test)]
pub(crate) fn test_state(model: crate::schema::SchemaModel, data_dir: &std::path::Path) -> AppState {
    let config = crate::config::Config::default();
    let registry = Arc::new(SchemaRegistry::new(&config).unwrap());
    registry.replace(model).unwrap();
    let scripting = Scripting::new(&config).unwrap().with_schema(Arc::clone(&registry));
    AppState {
        registry,
        graph: Arc::new(MemoryGraph::new()),
        scripting: Arc::new(scripting),
        files: Arc::new(StorageProviders::new(Box::new(crate::graph::LocalStorageProvider::new(
            data_dir,
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorToken;

    #[test]
    fn test_schema_errors_map_to_statuses() {
        let missing = ApiError::from(SchemaError::UnknownType("Ghost".into()));
        assert_eq!(missing.0.status, 404);

        let broken = ApiError::from(SchemaError::Compilation(vec![ErrorToken::new("Task", "compiler_error")]));
        assert_eq!(broken.0.status, 422);
        assert_eq!(broken.0.tokens.len(), 1);
    }

    #[test]
    fn test_session_header_addresses_the_caller() {
        let mut headers = HeaderMap::new();
        assert_eq!(security_from(&headers).session_id, None);

        headers.insert(SESSION_HEADER, "abc".parse().unwrap());
        let security = security_from(&headers);
        assert_eq!(security.session_id.as_deref(), Some("abc"));
        assert!(security.do_transaction_notifications);
    }
}
