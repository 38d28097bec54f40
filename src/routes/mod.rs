pub mod events;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod sessions;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::app_state::AppState;

/// Kiosk API routes (everything except `/metrics`).
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/api/v1/sessions/{datetime}/capture",
            post(sessions::submit_capture),
        )
        .route(
            "/api/v1/sessions/{datetime}/result",
            post(sessions::record_result),
        )
        .route(
            "/api/v1/sessions/{datetime}/dummy",
            post(sessions::generate_with_dummy_photo),
        )
        .route("/api/v1/jobs", get(jobs::list_jobs))
        .route("/api/v1/jobs/{datetime}", delete(jobs::cancel_job))
        .route("/api/v1/events", get(events::event_stream))
        .with_state(state)
}
