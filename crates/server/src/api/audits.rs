//! # Audit API
//!
//! Submit, inspect, stream and cancel audits.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;

use sitescope_core::agents::RegistryStats;
use sitescope_core::error::{OrchestratorError, PipelineError, ProgressError, RegistryError};
use sitescope_core::models::{audit_request_schema, progress_update_schema};
use sitescope_core::{AuditExecution, AuditRequest, AuditResults, RunContext};

use crate::AppState;

pub fn audit_routes() -> Router<AppState> {
    Router::new()
        .route("/audits", post(start_audit).get(list_audits))
        .route("/audits/:id", get(get_audit))
        .route("/audits/:id/events", get(audit_events))
        .route("/audits/:id/cancel", post(cancel_audit))
        .route("/audits/:id/results", get(get_results))
        .route("/agents", get(list_agents))
        .route("/schema/request", get(request_schema))
        .route("/schema/progress", get(progress_schema))
}

/// Orchestrator error rendered as a JSON body with a matching status code
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            OrchestratorError::InvalidRequest(_)
            | OrchestratorError::Pipeline(PipelineError::InvalidRequest(_))
            | OrchestratorError::Registry(RegistryError::EmptyName)
            | OrchestratorError::Registry(RegistryError::MissingAgent(_)) => StatusCode::BAD_REQUEST,
            OrchestratorError::NotFound(_)
            | OrchestratorError::Pipeline(PipelineError::NotRunning(_))
            | OrchestratorError::Progress(ProgressError::NotTracked(_))
            | OrchestratorError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            OrchestratorError::AlreadyActive(_)
            | OrchestratorError::NotActive(_)
            | OrchestratorError::NotCompleted { .. }
            | OrchestratorError::Pipeline(PipelineError::AlreadyRunning(_))
            | OrchestratorError::Progress(ProgressError::AlreadyTracked(_))
            | OrchestratorError::Registry(RegistryError::AlreadyRegistered(_)) => StatusCode::CONFLICT,
            OrchestratorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {:#}", self.0);
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    include_history: bool,
}

#[derive(Debug, Serialize)]
struct AuditList {
    active: Vec<AuditExecution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    history: Option<Vec<AuditExecution>>,
}

/// Submit an audit; progress is read from the events endpoint
async fn start_audit(
    State(state): State<AppState>,
    Json(request): Json<AuditRequest>,
) -> Result<(StatusCode, Json<AuditExecution>), ApiError> {
    let audit_id = request.audit_id.clone();
    // Audits outlive the request, so they get a fresh context
    let _progress = state
        .orchestrator
        .start_audit(&RunContext::new(), request)
        .await?;
    let execution = state.orchestrator.get_audit_status(&audit_id).await?;
    Ok((StatusCode::ACCEPTED, Json(execution)))
}

async fn list_audits(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<AuditList> {
    let active = state.orchestrator.list_active_audits().await;
    let history = if query.include_history {
        Some(state.orchestrator.history().await)
    } else {
        None
    };
    Json(AuditList { active, history })
}

async fn get_audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AuditExecution>, ApiError> {
    Ok(Json(state.orchestrator.get_audit_status(&id).await?))
}

/// SSE stream of progress updates, one event per update named after its step
async fn audit_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let rx = state.orchestrator.stream_progress(&id).await?;
    let stream = ReceiverStream::new(rx).map(|update| {
        let json = serde_json::to_string(&update).unwrap_or_default();
        Ok(Event::default().event(update.step.as_str()).data(json))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn cancel_audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.orchestrator.cancel_audit(&id).await?;
    Ok(Json(serde_json::json!({ "audit_id": id, "cancelled": true })))
}

async fn get_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AuditResults>, ApiError> {
    Ok(Json(state.orchestrator.get_results(&id).await?))
}

async fn list_agents(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.orchestrator.registry_stats().await)
}

async fn request_schema() -> impl IntoResponse {
    Json(audit_request_schema())
}

async fn progress_schema() -> impl IntoResponse {
    Json(progress_update_schema())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use sitescope_core::{HttpCrawler, Orchestrator, OrchestratorConfig};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let crawler = Arc::new(HttpCrawler::new("sitescope-test").unwrap());
        let orchestrator = Orchestrator::new(OrchestratorConfig::default(), crawler);
        crate::api::router(AppState {
            orchestrator: Arc::new(orchestrator),
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_audit_is_404() {
        for uri in [
            "/api/v1/audits/ghost",
            "/api/v1/audits/ghost/results",
            "/api/v1/audits/ghost/events",
        ] {
            let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let response = app().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        }

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/audits/ghost/cancel")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "audit 'ghost' not found");
    }

    #[tokio::test]
    async fn test_empty_audit_id_is_400() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/audits")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"audit_id":"","seed_url":"https://example.com","max_pages":5}"#,
            ))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_path_like_audit_id_is_400() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/audits")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"audit_id":"../../../tmp/x","seed_url":"https://example.com","max_pages":5}"#,
            ))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("not a plain name"));
    }

    #[tokio::test]
    async fn test_submitted_audit_is_visible() {
        let app = app();
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/audits")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"audit_id":"a1","seed_url":"not a url","max_pages":5}"#,
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["audit_id"], "a1");

        let request = Request::builder()
            .uri("/api/v1/audits/a1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_schemas_and_agents() {
        let request = Request::builder()
            .uri("/api/v1/schema/progress")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let schema = body_json(response).await;
        assert!(schema["properties"]["progress"].is_object());

        let request = Request::builder()
            .uri("/api/v1/agents")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        let stats = body_json(response).await;
        assert_eq!(stats["total"], 0);
    }

    #[test]
    fn test_error_status_mapping() {
        let conflict = ApiError(OrchestratorError::AlreadyActive("a1".into()));
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        let missing = ApiError(OrchestratorError::NotFound("a1".into()));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let closed = ApiError(OrchestratorError::ShuttingDown);
        assert_eq!(closed.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
