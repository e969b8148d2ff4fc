use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chatline_core::credentials::validate_session_id;
use chatline_core::{SendError, SessionStatus, SessionSupervisor};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::send_window::SendWindow;

pub struct AppState {
    pub supervisor: SessionSupervisor,
    pub send_window: SendWindow,
    pub metrics: PrometheusHandle,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:session_id", get(get_session))
        .route("/sessions/:session_id/connect", post(connect_session))
        .route("/sessions/:session_id/messages", post(send_message))
        .route("/metrics", get(metrics_summary))
        .route("/metrics/prometheus", get(prometheus_handler))
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    RateLimited(String),
    Unavailable(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.as_str()),
            ApiError::RateLimited(msg) => (StatusCode::TOO_MANY_REQUESTS, "rate_limited", msg.as_str()),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg.as_str()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = self.parts();
        let body = ApiErrorBody {
            error,
            message: message.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<SendError> for ApiError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::RateLimitExceeded => ApiError::RateLimited(err.to_string()),
            other => ApiError::Conflict(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

fn checked_session_id(session_id: &str) -> Result<(), ApiError> {
    validate_session_id(session_id).map_err(|err| ApiError::BadRequest(err.to_string()))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectResponse {
    session_id: String,
    status: &'static str,
}

async fn connect_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<ConnectResponse> {
    checked_session_id(&session_id)?;
    state.supervisor.ensure_session(&session_id);
    Ok(Json(ConnectResponse {
        session_id,
        status: "connecting",
    }))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionStatus>> {
    Json(state.supervisor.list_sessions())
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionStatus> {
    state
        .supervisor
        .session(&session_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("session {session_id} not found")))
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    #[serde(default)]
    jid: Option<String>,
    #[serde(default)]
    message: Option<Value>,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult<Value> {
    checked_session_id(&session_id)?;
    let Json(request) = body.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let jid = request.jid.filter(|jid| !jid.trim().is_empty());
    let message = request.message.filter(|message| !message.is_null());
    let (Some(jid), Some(message)) = (jid, message) else {
        return Err(ApiError::BadRequest("jid and message are required".into()));
    };

    state
        .supervisor
        .send_message(&session_id, &jid, message)
        .await?;
    state.send_window.record();
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub send_rate_per_minute: usize,
    pub queue_depth: u64,
}

async fn metrics_summary(State(state): State<Arc<AppState>>) -> ApiResult<MetricsSummary> {
    let queue_depth = state.supervisor.relay().depth().await.map_err(|err| {
        warn!(error = %err, "failed to read inbound queue depth");
        ApiError::Unavailable(err.to_string())
    })?;
    Ok(Json(MetricsSummary {
        send_rate_per_minute: state.send_window.per_minute(),
        queue_depth,
    }))
}

async fn prometheus_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
