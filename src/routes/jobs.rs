use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::job::{JobSummary, WorkerStatus};

#[derive(Serialize)]
pub struct JobsResponse {
    pub active: Vec<JobSummary>,
    /// `None` when the worker is not running.
    pub worker: Option<WorkerStatus>,
}

/// GET /api/v1/jobs: mirrored job statuses plus the worker's own view.
pub async fn list_jobs(State(state): State<AppState>) -> Json<JobsResponse> {
    Json(JobsResponse {
        active: state.transform.get_active_jobs(),
        worker: state.transform.get_status().await.ok(),
    })
}

/// DELETE /api/v1/jobs/{datetime}: cancel a session's job.
///
/// Local state is dropped at once; the image server may still finish the
/// prompt on its side.
pub async fn cancel_job(State(state): State<AppState>, Path(datetime): Path<String>) -> StatusCode {
    if state.transform.cancel_job(&datetime) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
