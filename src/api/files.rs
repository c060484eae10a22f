//! File content upload

use crate::api::{ApiError, AppState};
use crate::error::FrameworkError;
use crate::graph::GraphTransaction;
use axum::{
    body::Bytes,
    extract::{Path, State},
    response::Json,
    routing::put,
    Router,
};
use serde_json::{json, Value};
use std::io::Write;

pub fn create_file_routes() -> Router<AppState> {
    Router::new().route("/api/files/{id}/content", put(put_content))
}

/// Replace the binary content of a file entity
///
/// PUT /api/files/{id}/content
async fn put_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let tx = state.graph.begin();
    let file = tx
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("No file with id {}", id)))?;

    let provider = state.files.provider_for(file);
    let written = provider
        .output_stream(file)
        .and_then(|mut out| {
            out.write_all(&body)?;
            out.flush()
        });
    if let Err(e) = written {
        tracing::error!("❌ Failed to write content of {} via {}: {}", id, provider.name(), e);
        return Err(FrameworkError::new(500, format!("Failed to write file content: {}", e)).into());
    }

    tracing::info!("📦 Stored {} bytes for {} via {}", body.len(), id, provider.name());
    Ok(Json(json!({ "id": id, "size": body.len(), "provider": provider.name() })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_state;
    use crate::schema::SchemaModel;

    #[tokio::test]
    async fn test_content_is_written_through_the_provider() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(SchemaModel::new(), dir.path());

        let mut tx = state.graph.begin();
        let id = tx.create_node("AbstractNode");
        tx.commit().unwrap();

        let Json(response) = put_content(State(state.clone()), Path(id.clone()), Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert_eq!(response["provider"], "local");
        assert_eq!(std::fs::read(dir.path().join("files").join(&id)).unwrap(), b"payload");

        let err = put_content(State(state), Path("missing".to_string()), Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.0.status, 404);
    }
}
