//! HTTP surface for operators: stored anomalies with their acknowledge and
//! resolve lifecycle, plus a read-only view of the live baselines.
//!
//! Every response, including errors and unknown paths, uses the
//! `{ "data" | "error", "meta" }` envelope.

mod routes;
pub mod state;

use axum::http::{StatusCode, Uri};
use axum::response::Response;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use self::state::AppState;

/// Routes under `/api/v1`, request tracing, and a JSON 404 for anything else.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(unknown_route)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn unknown_route(uri: Uri) -> Response {
    routes::error_response(
        StatusCode::NOT_FOUND,
        format!("no anomaly API route for {}", uri.path()),
    )
}
