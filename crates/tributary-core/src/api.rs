// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API.
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | `GET` | `/health` | Liveness probe, unauthenticated |
//! | `POST` | `/v1/events` | Ingest one event or an array of events |
//! | `PUT` | `/v1/functions` | Register (or replace) a function definition |
//! | `GET` | `/v1/runs/{id}` | Run status and output |
//! | `DELETE` | `/v1/runs/{id}` | Cancel a run |
//!
//! Every `/v1` route requires `Authorization: Bearer <event key>` when an
//! event key is configured.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::error::CoreError;
use crate::event::Event;
use crate::function::FunctionDefinition;
use crate::ids::{FunctionId, RunId, TenantId};
use crate::runner::Runner;
use crate::state::{RunStatus, StateStore};

/// Shared state of the API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub runner: Arc<Runner>,
    pub state: Arc<dyn StateStore>,
    /// Bearer key; `None` disables authentication.
    pub event_key: Option<String>,
    /// Tenant all requests act on.
    pub tenant: TenantId,
}

impl std::fmt::Debug for ApiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiState")
            .field("state", &"...")
            .field("event_key", &self.event_key.as_ref().map(|_| "***"))
            .field("tenant", &self.tenant)
            .finish()
    }
}

/// API errors, rendered as `{"error": {"code", "message"}}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing or invalid event key")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::RunNotFound { .. } | CoreError::FunctionNotFound { .. } => {
                Self::NotFound(err.to_string())
            }
            CoreError::InvalidFunction { .. } | CoreError::ValidationError { .. } => {
                Self::BadRequest(err.to_string())
            }
            e if e.is_transient() => Self::Unavailable(e.to_string()),
            e => Self::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": { "code": self.code(), "message": self.to_string() } });
        (self.status(), Json(body)).into_response()
    }
}

/// Build the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/events", post(send_events))
        .route("/v1/functions", put(register_function))
        .route("/v1/runs/{id}", get(get_run).delete(cancel_run))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.event_key else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match provided {
        Some(key) if key == expected => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

fn parse_run_id(id: &str) -> Result<RunId, ApiError> {
    id.parse()
        .map_err(|_| ApiError::BadRequest(format!("'{}' is not a run ID", id)))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// A single event or a batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EventsBody {
    Many(Vec<Event>),
    One(Event),
}

#[derive(Debug, Serialize)]
struct EventsResponse {
    ids: Vec<String>,
    runs: Vec<RunId>,
    status: u16,
}

#[instrument(skip_all)]
async fn send_events(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<EventsBody>,
) -> Result<Json<EventsResponse>, ApiError> {
    authorize(&state, &headers)?;
    let events = match body {
        EventsBody::Many(events) => events,
        EventsBody::One(event) => vec![event],
    };
    if let Some(i) = events.iter().position(|e| e.name.trim().is_empty()) {
        return Err(ApiError::BadRequest(format!("event {} has no name", i)));
    }
    if let Some(e) = events.iter().find(|e| e.is_internal()) {
        return Err(ApiError::BadRequest(format!(
            "'{}' is reserved for engine events",
            e.name
        )));
    }

    let now = Utc::now();
    let mut ids = Vec::with_capacity(events.len());
    let mut runs = Vec::new();
    for mut event in events {
        event.stamp(now);
        ids.push(event.id.clone().unwrap_or_default());
        let outcome = state.runner.handle_event(state.tenant, event).await?;
        runs.extend(outcome.scheduled);
    }
    info!(events = ids.len(), runs = runs.len(), "Events ingested");
    Ok(Json(EventsResponse {
        ids,
        runs,
        status: 200,
    }))
}

#[derive(Debug, Serialize)]
struct FunctionResponse {
    id: FunctionId,
    slug: String,
}

async fn register_function(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(definition): Json<FunctionDefinition>,
) -> Result<Json<FunctionResponse>, ApiError> {
    authorize(&state, &headers)?;
    let registered = state
        .runner
        .registry()
        .register(state.tenant, definition)?;
    Ok(Json(FunctionResponse {
        id: registered.id,
        slug: registered.definition.slug.clone(),
    }))
}

#[derive(Debug, Serialize)]
struct RunResponse {
    run_id: RunId,
    function_id: FunctionId,
    status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<Value>,
    stack: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

async fn get_run(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    authorize(&state, &headers)?;
    let run_id = parse_run_id(&id)?;
    let run = state
        .state
        .load(&run_id)
        .await?
        .filter(|run| run.meta.tenant == state.tenant)
        .ok_or_else(|| ApiError::NotFound(format!("Run '{}' not found", run_id)))?;
    Ok(Json(RunResponse {
        run_id: run.meta.run_id,
        function_id: run.meta.function_id,
        status: run.meta.status,
        output: run.meta.output,
        cause: run.meta.cause,
        stack: run.stack,
        created_at: run.meta.created_at,
        updated_at: run.meta.updated_at,
    }))
}

#[instrument(skip(state, headers))]
async fn cancel_run(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers)?;
    let run_id = parse_run_id(&id)?;
    match state.state.load_metadata(&run_id).await? {
        Some(meta) if meta.tenant == state.tenant => {}
        _ => return Err(ApiError::NotFound(format!("Run '{}' not found", run_id))),
    }
    let meta = state.runner.cancel(&run_id).await?;
    if meta.status != RunStatus::Cancelled {
        warn!(run_id = %run_id, status = %meta.status, "Run had already finished");
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RecordingSink;
    use crate::expressions::ExpressionCache;
    use crate::function::FunctionRegistry;
    use crate::lifecycle::Lifecycle;
    use crate::pauses::PauseManager;
    use crate::queue::MemoryQueue;
    use crate::state::MemoryStateStore;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(event_key: Option<&str>) -> (Router, Arc<MemoryStateStore>) {
        let state = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let lifecycle = Arc::new(Lifecycle::new(
            state.clone(),
            Arc::new(RecordingSink::default()),
        ));
        let pauses = Arc::new(PauseManager::new(
            state.clone(),
            queue.clone(),
            lifecycle.clone(),
            ExpressionCache::global(),
        ));
        let runner = Arc::new(Runner::new(
            Arc::new(FunctionRegistry::new()),
            state.clone(),
            queue,
            pauses,
            lifecycle,
        ));
        let api = ApiState {
            runner,
            state: state.clone(),
            event_key: event_key.map(str::to_string),
            tenant: TenantId::default(),
        };
        (router(api), state)
    }

    fn request(method: &str, uri: &str, key: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn function() -> Value {
        json!({
            "slug": "api-test",
            "name": "api test",
            "triggers": [{"event": "tests/api.test"}],
            "steps": {"step": {"id": "step", "uri": "http://localhost:3000/api/inngest"}}
        })
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (app, _) = app(Some("secret"));
        let response = app
            .oneshot(request("GET", "/health", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_event_key_is_enforced() {
        let (app, _) = app(Some("secret"));
        let response = app
            .clone()
            .oneshot(request("POST", "/v1/events", None, Some(json!({"name": "a/b"}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(request(
                "POST",
                "/v1/events",
                Some("wrong"),
                Some(json!({"name": "a/b"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_register_send_get_and_cancel() {
        let (app, _) = app(Some("secret"));
        let response = app
            .clone()
            .oneshot(request("PUT", "/v1/functions", Some("secret"), Some(function())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["slug"], "api-test");

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/v1/events",
                Some("secret"),
                Some(json!([{"name": "tests/api.test", "data": {"test": true}}, {"name": "other"}])),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["ids"].as_array().unwrap().len(), 2);
        let run_id = body["runs"][0].as_str().unwrap().to_string();

        let uri = format!("/v1/runs/{}", run_id);
        let response = app
            .clone()
            .oneshot(request("GET", &uri, Some("secret"), None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["status"], "scheduled");

        let response = app
            .clone()
            .oneshot(request("DELETE", &uri, Some("secret"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(request("GET", &uri, Some("secret"), None))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["status"], "cancelled");
        assert_eq!(body["cause"]["name"], "FunctionCancelledError");
    }

    #[tokio::test]
    async fn test_cancel_unknown_run_is_404() {
        let (app, _) = app(None);
        let uri = format!("/v1/runs/{}", RunId::new());
        let response = app
            .clone()
            .oneshot(request("DELETE", &uri, None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(request("DELETE", "/v1/runs/not-a-ulid", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_function_is_rejected() {
        let (app, _) = app(None);
        let mut def = function();
        def["triggers"] = json!([]);
        let response = app
            .oneshot(request("PUT", "/v1/functions", None, Some(def)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_reserved_event_names_are_rejected() {
        let (app, _) = app(None);
        let response = app
            .oneshot(request(
                "POST",
                "/v1/events",
                None,
                Some(json!({"name": "inngest/function.finished"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
