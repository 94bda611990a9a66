use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::db::StoreError;
use crate::services::capture::CaptureError;

/// JSON envelope used by every non-image response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub status: u16,
    pub payload: T,
}

/// Wrap `payload` in an [`Envelope`] with a matching HTTP status.
pub fn envelope<T: Serialize>(status: StatusCode, payload: T) -> Response {
    (
        status,
        Json(Envelope {
            status: status.as_u16(),
            payload,
        }),
    )
        .into_response()
}

/// Errors surfaced to HTTP callers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("screenshot not yet captured")]
    NotCaptured,

    /// The render failed; carries the message stored on the job.
    #[error("{0}")]
    CaptureFailed(String),

    #[error("invalid id")]
    InvalidId,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("slow down")]
    AdmissionDenied,

    #[error("render queue is full, try again later")]
    Saturated,

    #[error("service is shutting down")]
    ShuttingDown,

    /// Detail is logged, never sent to the client.
    #[error("internal error")]
    Store(StoreError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NotCaptured => StatusCode::ACCEPTED,
            Self::CaptureFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidId | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::AdmissionDenied => StatusCode::TOO_MANY_REQUESTS,
            Self::Saturated | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            Self::Store(e) => tracing::error!(error = %e, "Storage error"),
            Self::InvalidRequest(msg) => tracing::warn!(error = %msg, "Rejected request"),
            _ => {}
        }
        envelope(status, self.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            other => Self::Store(other),
        }
    }
}

impl From<CaptureError> for ApiError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::Saturated => Self::Saturated,
            CaptureError::ShuttingDown => Self::ShuttingDown,
            CaptureError::Store(e) => Self::Store(e),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        Self::InvalidRequest(report.to_string())
    }
}
