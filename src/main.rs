use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use arcade_memorial::app_state::AppState;
use arcade_memorial::config::AppConfig;
use arcade_memorial::routes;
use arcade_memorial::services::orchestrator::Orchestrator;
use arcade_memorial::services::transform::TransformationService;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing arcade-memorial server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    tokio::fs::create_dir_all(&config.results_dir)
        .await
        .expect("Failed to create results directory");

    tracing::info!(base_url = %config.comfy_base_url, "Starting transformation worker");
    let transform = TransformationService::start(config.transform())
        .await
        .expect("Failed to start transformation worker");
    let transform = Arc::new(transform);

    let orchestrator = Orchestrator::new(
        &config.results_dir,
        config.workflow(),
        config.memorial_card(),
        transform.clone(),
    );
    let state = AppState::new(orchestrator);

    let app = routes::api_router(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(20 * 1024 * 1024)); // base64 photos

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");

    transform.destroy().await;
}
