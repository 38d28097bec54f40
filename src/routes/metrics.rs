use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Register descriptions for the pipeline's metrics.
pub fn describe_metrics() {
    metrics::describe_counter!("transform_jobs_total", "Stylization jobs accepted by the worker");
    metrics::describe_counter!("transform_jobs_completed", "Stylization jobs with a saved output image");
    metrics::describe_counter!("transform_jobs_failed", "Stylization jobs that ended in an error");
    metrics::describe_counter!("transform_jobs_canceled", "Stylization cancel requests handled");
    metrics::describe_counter!("memorial_cards_generated", "Memorial cards written to disk");
    metrics::describe_counter!("memorial_cards_failed", "Memorial card generation failures");
    metrics::describe_histogram!(
        "memorial_card_duration_seconds",
        "Time to compose one memorial card"
    );
}

/// GET /metrics: Prometheus text exposition.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
