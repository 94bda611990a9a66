use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod admission;
pub mod capture;
pub mod error;
pub mod health;
pub mod metrics;
pub mod stats;

const MAX_BODY_BYTES: usize = 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// API routes with the standard middleware stack. `/health` skips rate limiting.
pub fn router(state: AppState) -> Router {
    let limited = Router::new()
        .route("/capture", post(capture::submit_capture))
        .route("/download/{id}", get(capture::download_capture))
        .route("/stats", get(stats::stats))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admission::admission,
        ));

    Router::new()
        .route("/health", get(health::health_check))
        .merge(limited)
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
}

async fn not_found() -> Response {
    error::envelope(StatusCode::NOT_FOUND, "not found")
}
