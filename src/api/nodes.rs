//! Node REST endpoints
//!
//! Every request runs in its own graph transaction with a fresh action
//! context. Writes commit only when every property write succeeded.

use crate::api::{security_from, ApiError, AppState};
use crate::graph::{Entity, GraphTransaction, MemoryTransaction};
use crate::property::{ReadContext, WriteContext};
use crate::schema::{CompiledSchema, PUBLIC_VIEW};
use crate::script::{ActionContext, ScriptFunctions};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Map, Value};

pub fn create_node_routes() -> Router<AppState> {
    Router::new()
        .route("/api/nodes/{type_name}", post(create_node))
        .route("/api/nodes/{type_name}/{id}", get(get_node).delete(delete_node))
}

/// Entity `id` if it is a `type_name` (or a subtype)
fn find_typed<'t>(
    tx: &'t MemoryTransaction<'_>,
    schema: &CompiledSchema,
    type_name: &str,
    id: &str,
) -> Result<&'t Entity, ApiError> {
    tx.get(id)
        .filter(|entity| {
            schema
                .type_descriptor(&entity.type_name)
                .map_or(false, |descriptor| descriptor.is_a(type_name))
        })
        .ok_or_else(|| ApiError::not_found(format!("No {} with id {}", type_name, id)))
}

/// Create a node from its external representation
///
/// POST /api/nodes/{type}
/// Body: { "name": "...", ... }
async fn create_node(
    State(state): State<AppState>,
    Path(type_name): Path<String>,
    headers: HeaderMap,
    Json(input): Json<Map<String, Value>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let schema = state.registry.load();
    let mut ctx = ActionContext::new(security_from(&headers));
    let mut tx = state.graph.begin();

    let (id, rendered) = {
        let functions = ScriptFunctions::new(&state.scripting, &mut ctx);
        let id = WriteContext::new(&mut tx, &schema)
            .with_functions(&functions)
            .create(&type_name, &input)?;
        let entity = find_typed(&tx, &schema, &type_name, &id)?;
        let rendered = ReadContext::new(&tx, &schema)
            .with_functions(&functions)
            .render(entity, PUBLIC_VIEW)?;
        (id, rendered)
    };

    tx.commit_notifying(ctx.security.do_transaction_notifications)?;
    tracing::info!("✨ Created {} {}", type_name, id);

    Ok((StatusCode::CREATED, Json(json!({ "id": id, "result": rendered }))))
}

/// Read a node through a view
///
/// GET /api/nodes/{type}/{id}?view=public
async fn get_node(
    State(state): State<AppState>,
    Path((type_name, id)): Path<(String, String)>,
    Query(query): Query<super::schema::ViewQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let schema = state.registry.load();
    let mut ctx = ActionContext::new(security_from(&headers));
    let tx = state.graph.begin();

    let entity = find_typed(&tx, &schema, &type_name, &id)?;
    let view = query.view.as_deref().unwrap_or(PUBLIC_VIEW);
    let functions = ScriptFunctions::new(&state.scripting, &mut ctx);
    let rendered = ReadContext::new(&tx, &schema)
        .with_functions(&functions)
        .render(entity, view)?;

    Ok(Json(json!({ "result": rendered })))
}

/// Delete a node and whatever its cascading policies take along
///
/// DELETE /api/nodes/{type}/{id}
async fn delete_node(
    State(state): State<AppState>,
    Path((type_name, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let schema = state.registry.load();
    let mut ctx = ActionContext::new(security_from(&headers));
    let mut tx = state.graph.begin();

    find_typed(&tx, &schema, &type_name, &id)?;
    let deleted = {
        let functions = ScriptFunctions::new(&state.scripting, &mut ctx);
        WriteContext::new(&mut tx, &schema)
            .with_functions(&functions)
            .delete(&id)?
    };

    tx.commit_notifying(ctx.security.do_transaction_notifications)?;
    tracing::info!("🗑️ Deleted {} {} ({} entities)", type_name, id, deleted.len());

    Ok(Json(json!({ "deleted": deleted })))
}
