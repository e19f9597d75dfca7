//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use crate::detect::{DetectError, ResolutionStatus};
use crate::storage::StoreError;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/anomalies", get(list_anomalies))
        .route("/anomalies/{id}", get(get_anomaly))
        .route("/anomalies/{id}/acknowledge", post(acknowledge))
        .route("/anomalies/{id}/resolve", post(resolve))
        .route("/baselines", get(baselines))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

enum ApiError {
    BadRequest(String),
    Store(StoreError),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Store(e @ StoreError::NotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()),
            ApiError::Store(e @ StoreError::Transition(DetectError::InvalidTransition { .. })) => {
                (StatusCode::CONFLICT, e.to_string())
            }
            ApiError::Store(e) => {
                tracing::error!(error = %e, "anomaly store request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "request task failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        error_response(status, message)
    }
}

pub(super) fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": { "message": message }, "meta": meta() }))).into_response()
}

async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "tracked_metrics": state.engine.tracker().tracked_metrics()
        },
        "meta": meta()
    }))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_anomalies(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<ResolutionStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let store = state.store.clone();
    let anomalies = blocking(move || store.list(status, limit)).await?;
    Ok(Json(json!({
        "data": anomalies,
        "meta": { "total": anomalies.len(), "limit": limit, "timestamp": chrono::Utc::now().to_rfc3339() }
    })))
}

async fn get_anomaly(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store.clone();
    let (anomaly, transitions) = blocking(move || {
        let anomaly = store.get(&id)?;
        let transitions = store.transitions(&id)?;
        Ok((anomaly, transitions))
    })
    .await?;
    Ok(Json(json!({
        "data": { "anomaly": anomaly, "transitions": transitions },
        "meta": meta()
    })))
}

async fn transition(
    state: AppState,
    id: String,
    to: ResolutionStatus,
) -> Result<Json<Value>, ApiError> {
    let store = state.store.clone();
    let anomaly = blocking(move || store.transition(&id, to)).await?;
    Ok(Json(json!({ "data": anomaly, "meta": meta() })))
}

async fn acknowledge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    transition(state, id, ResolutionStatus::Acknowledged).await
}

async fn resolve(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    transition(state, id, ResolutionStatus::Resolved).await
}

async fn baselines(State(state): State<AppState>) -> Json<Value> {
    let baselines = state.engine.baselines();
    Json(json!({
        "data": baselines,
        "meta": { "total": baselines.len(), "timestamp": chrono::Utc::now().to_rfc3339() }
    }))
}
