//! Schema REST endpoints
//!
//! Export and import of the canonical schema document. An import is
//! compiled with migration repair and swapped in atomically; readers keep
//! the schema they started with.

use crate::api::{ApiError, AppState};
use crate::schema::{export, PropertyListing};
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

/// `?view=` selector
#[derive(Debug, Deserialize)]
pub struct ViewQuery {
    pub view: Option<String>,
}

pub fn create_schema_routes() -> Router<AppState> {
    Router::new()
        .route("/api/schema", get(get_schema).put(put_schema))
        .route("/api/schema/{type_name}/properties", get(list_properties))
}

/// Current schema as its canonical document
///
/// GET /api/schema
async fn get_schema(State(state): State<AppState>) -> Json<Value> {
    Json(export::to_json(state.registry.load().model()))
}

/// Replace the schema
///
/// PUT /api/schema
/// Body: { "definitions": { ... } }
async fn put_schema(
    State(state): State<AppState>,
    Json(document): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let model = export::from_json(&document)?;
    let compiled = state.registry.replace(model)?;

    let version = state.registry.persist().await.map_err(|e| {
        tracing::error!("❌ Failed to persist schema: {}", e);
        ApiError::from(e)
    })?;

    Ok(Json(json!({
        "types": compiled.model().types.len(),
        "relationships": compiled.model().relationships.len(),
        "version": version,
    })))
}

/// Property listing of one type, with view membership
///
/// GET /api/schema/{type}/properties?view=public
async fn list_properties(
    State(state): State<AppState>,
    Path(type_name): Path<String>,
    Query(query): Query<ViewQuery>,
) -> Result<Json<Vec<PropertyListing>>, ApiError> {
    let schema = state.registry.load();
    let listing = schema.list_properties(&type_name, query.view.as_deref())?;
    Ok(Json(listing))
}
