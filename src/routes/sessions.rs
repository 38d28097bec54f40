use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::game_result::GameResult;
use crate::services::memorial_card::CardOutcome;
use crate::services::orchestrator::OrchestratorError;
use crate::services::transform::TransformServiceError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Error returned by the session endpoints.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::InvalidSession(_)
            | OrchestratorError::InvalidResult(_)
            | OrchestratorError::InvalidPhoto(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::Transform(TransformServiceError::Duplicate(_)) => StatusCode::CONFLICT,
            OrchestratorError::Transform(TransformServiceError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            OrchestratorError::Transform(_) | OrchestratorError::CardsDisabled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            OrchestratorError::Workflow(_) | OrchestratorError::Io(_) | OrchestratorError::Json(_) => {
                tracing::error!(error = %err, "Session request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct CaptureRequest {
    pub image_base64: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CaptureResponse {
    pub job_id: Uuid,
    pub datetime: String,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultResponse {
    pub datetime: String,
    pub path: PathBuf,
}

/// POST /api/v1/sessions/{datetime}/capture: store the photo and queue stylization.
pub async fn submit_capture(
    State(state): State<AppState>,
    Path(datetime): Path<String>,
    Json(request): Json<CaptureRequest>,
) -> Result<(StatusCode, Json<CaptureResponse>), ApiError> {
    let job_id = state
        .orchestrator
        .submit_capture(&datetime, request.image_base64)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CaptureResponse {
            job_id,
            datetime,
            status: "queued".to_string(),
        }),
    ))
}

/// POST /api/v1/sessions/{datetime}/result: write the session's `result.json`.
pub async fn record_result(
    State(state): State<AppState>,
    Path(datetime): Path<String>,
    Json(result): Json<GameResult>,
) -> Result<(StatusCode, Json<ResultResponse>), ApiError> {
    let path = state.orchestrator.record_result(&datetime, &result).await?;
    Ok((StatusCode::CREATED, Json(ResultResponse { datetime, path })))
}

/// POST /api/v1/sessions/{datetime}/dummy: compose the card from the dummy photo.
pub async fn generate_with_dummy_photo(
    State(state): State<AppState>,
    Path(datetime): Path<String>,
) -> Result<(StatusCode, Json<CardOutcome>), ApiError> {
    match state.orchestrator.generate_with_dummy_photo(&datetime).await? {
        Some(outcome) if outcome.success => Ok((StatusCode::OK, Json(outcome))),
        Some(outcome) => Ok((StatusCode::UNPROCESSABLE_ENTITY, Json(outcome))),
        None => Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("Memorial card for {datetime} already generated or in progress"),
        )),
    }
}
