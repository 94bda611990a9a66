use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Extensions, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;

use crate::app_state::AppState;
use crate::routes::error::ApiError;

/// Per-client rate limiting in front of the capture API.
pub async fn admission(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let client = client_identifier(request.headers(), request.extensions());

    if !state.limiter.allow(&client) {
        metrics::counter!("capture_jobs_rejected").increment(1);
        tracing::warn!(client = %client, path = %request.uri().path(), "Rate limit exceeded");
        return ApiError::AdmissionDenied.into_response();
    }

    next.run(request).await
}

/// Client address: `X-Real-IP`, then the first `X-Forwarded-For` hop, then the peer address.
pub fn client_identifier(headers: &HeaderMap, extensions: &Extensions) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(ip) = header("x-real-ip") {
        return ip.to_string();
    }
    if let Some(first) = header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
