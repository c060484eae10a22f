//! Template rendering endpoint

use crate::api::{security_from, ApiError, AppState};
use crate::graph::GraphTransaction;
use crate::script::{ActionContext, ScriptingErrorEvent, TransactionHost};
use crate::value::Value;
use axum::{extract::State, http::HeaderMap, response::Json, routing::post, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Deserialize)]
pub struct RenderRequest {
    pub template: String,
    /// Id of the entity bound as `this`
    #[serde(default)]
    pub entity: Option<String>,
    /// Constants visible to every expression
    #[serde(default)]
    pub constants: Map<String, JsonValue>,
}

#[derive(Debug, Serialize)]
pub struct RenderResponse {
    pub result: Option<String>,
    pub events: Vec<ScriptingErrorEvent>,
}

pub fn create_render_routes() -> Router<AppState> {
    Router::new().route("/api/render", post(render))
}

/// Substitute every `${...}` in a template
///
/// Expressions see the graph through the request's transaction, which is
/// committed once the template is rendered.
///
/// POST /api/render
/// Body: { "template": "Hello ${this.name}", "entity": "...", "constants": {} }
async fn render(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RenderRequest>,
) -> Result<Json<RenderResponse>, ApiError> {
    let schema = state.registry.load();
    let mut tx = state.graph.begin();

    let entity = match &request.entity {
        Some(id) => Some(
            tx.get(id)
                .cloned()
                .ok_or_else(|| ApiError::not_found(format!("No entity with id {}", id)))?,
        ),
        None => None,
    };

    let mut ctx = ActionContext::new(security_from(&headers));
    for (key, value) in &request.constants {
        ctx.set_constant(key.clone(), Value::from_json(value));
    }

    let result = {
        let host = TransactionHost::writing(&state.scripting, &mut tx, &schema);
        state.scripting.replace_variables_in(
            &host,
            &mut ctx,
            entity.as_ref(),
            Some(&request.template),
            false,
            "render",
        )?
    };
    tx.commit_notifying(ctx.security.do_transaction_notifications)?;

    Ok(Json(RenderResponse {
        result,
        events: ctx.events,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_state;
    use crate::property::WriteContext;
    use crate::schema::{Cardinality, PropertyKind, SchemaModel};
    use serde_json::json;

    fn model() -> SchemaModel {
        let mut model = SchemaModel::new();
        let project = model.add_type("Project");
        project.extending("AbstractNode");
        project.add_property("code", PropertyKind::String);
        let task = model.add_type("Task");
        task.extending("AbstractNode");
        task.add_property(
            "label",
            PropertyKind::Function {
                read_function: Some("concat(this.name, '!')".to_string()),
                write_function: None,
            },
        );
        model
            .relate("Project", "has", "Task", Cardinality::OneToMany)
            .named("project", "tasks");
        model
    }

    fn request(template: &str, entity: &str) -> RenderRequest {
        RenderRequest {
            template: template.to_string(),
            entity: Some(entity.to_string()),
            constants: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_render_binds_entity_and_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(SchemaModel::new(), dir.path());

        let mut tx = state.graph.begin();
        let id = tx.create_node("AbstractNode");
        tx.set_property(&id, "name", Some(json!("Docs"))).unwrap();
        tx.commit().unwrap();

        let mut constants = Map::new();
        constants.insert("greeting".to_string(), json!("Hi"));
        let request = RenderRequest {
            template: "${greeting} ${this.name}${ 1/0 }!".to_string(),
            entity: Some(id),
            constants,
        };

        let Json(response) = render(State(state), HeaderMap::new(), Json(request)).await.unwrap();
        assert_eq!(response.result.as_deref(), Some("Hi Docs!"));
        assert_eq!(response.events.len(), 1);
    }

    #[tokio::test]
    async fn test_render_unknown_entity_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(SchemaModel::new(), dir.path());
        let request = RenderRequest {
            template: "${this.name}".to_string(),
            entity: Some("missing".to_string()),
            constants: Map::new(),
        };
        let err = render(State(state), HeaderMap::new(), Json(request)).await.unwrap_err();
        assert_eq!(err.0.status, 404);
    }

    #[tokio::test]
    async fn test_render_reads_function_properties_and_relations() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(model(), dir.path());

        let schema = state.registry.load();
        let mut tx = state.graph.begin();
        let mut writer = WriteContext::new(&mut tx, &schema);
        let project = writer.create("Project", json!({ "code": "P1" }).as_object().unwrap()).unwrap();
        let task = writer.create("Task", json!({ "name": "Docs" }).as_object().unwrap()).unwrap();
        writer.set(&task, "project", Value::from(project.as_str())).unwrap();
        tx.commit().unwrap();

        let Json(response) = render(
            State(state),
            HeaderMap::new(),
            Json(request("${ this.label } in ${ this.project.code }", &task)),
        )
        .await
        .unwrap();
        assert_eq!(response.result.as_deref(), Some("Docs! in P1"));
        assert!(response.events.is_empty());
    }

    #[tokio::test]
    async fn test_render_commits_graph_writes() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(model(), dir.path());

        let mut tx = state.graph.begin();
        let task = tx.create_node("Task");
        tx.set_property(&task, "name", Some(json!("Docs"))).unwrap();
        tx.commit().unwrap();

        let Json(response) = render(
            State(state.clone()),
            HeaderMap::new(),
            Json(request("${ set(this, 'name', 'Renamed') }${ this.label }", &task)),
        )
        .await
        .unwrap();
        assert_eq!(response.result.as_deref(), Some("Renamed!"));
        assert_eq!(state.graph.get(&task).unwrap().name(), Some("Renamed"));
    }
}
