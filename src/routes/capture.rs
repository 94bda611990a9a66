use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::capture::{CaptureRequest, CaptureResponse};
use crate::models::job::JobState;
use crate::routes::error::{envelope, ApiError};

/// POST /capture: queue a screenshot and return its job id.
pub async fn submit_capture(
    State(state): State<AppState>,
    body: Result<Json<CaptureRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    request.validate()?;

    let id = state.capture.submit(request).await?;

    Ok(envelope(StatusCode::OK, CaptureResponse { id }))
}

/// GET /download/{id}: the captured image, or why it is not available.
pub async fn download_capture(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = Uuid::parse_str(id.trim()).map_err(|_| ApiError::InvalidId)?;

    let record = state.capture.find(id).await?;

    match record.state {
        JobState::Pending => Err(ApiError::NotCaptured),
        JobState::Failed { message } => Err(ApiError::CaptureFailed(message)),
        JobState::Success { payload } => {
            let content_type = image::guess_format(&payload)
                .map(|format| format.to_mime_type())
                .unwrap_or("image/png");
            Ok(([(header::CONTENT_TYPE, content_type)], payload).into_response())
        }
    }
}
