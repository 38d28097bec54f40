use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub image_server: ComponentHealth,
    pub worker: WorkerHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct WorkerHealth {
    pub status: String,
    pub queue_length: usize,
    pub active_jobs: usize,
}

/// GET /health: image server reachability and worker status.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();
    let image_server = if state.transform.health_check().await {
        ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        }
    } else {
        ComponentHealth {
            status: "error".to_string(),
            latency_ms: None,
        }
    };

    let worker = match state.transform.get_status().await {
        Ok(status) => WorkerHealth {
            status: "ok".to_string(),
            queue_length: status.queue_length,
            active_jobs: status.active.len(),
        },
        Err(_) => WorkerHealth {
            status: "error".to_string(),
            queue_length: 0,
            active_jobs: 0,
        },
    };

    // The kiosk keeps running without the image server; only a dead worker is fatal.
    let status_code = if worker.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let status = if image_server.status == "ok" && worker.status == "ok" {
        "ok"
    } else {
        "degraded"
    };

    let response = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks { image_server, worker },
    };

    (status_code, Json(response))
}
