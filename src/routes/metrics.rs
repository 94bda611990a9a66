use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Install the global Prometheus recorder and describe the service's metrics.
pub fn install_recorder() -> Result<Arc<PrometheusHandle>, metrics_exporter_prometheus::BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    metrics::describe_counter!("capture_jobs_submitted", "Capture jobs accepted");
    metrics::describe_counter!("capture_jobs_completed", "Capture jobs rendered successfully");
    metrics::describe_counter!("capture_jobs_failed", "Capture jobs whose render failed");
    metrics::describe_counter!("capture_jobs_rejected", "Requests refused by the rate limiter");
    metrics::describe_counter!("capture_save_errors", "Render results that could not be saved");
    metrics::describe_counter!("store_evicted_records", "Job records removed by the sync loop");
    metrics::describe_counter!("limiter_evicted_clients", "Client buckets removed by the sync loop");
    metrics::describe_histogram!("capture_render_seconds", "Time spent rendering a page");
    metrics::describe_gauge!("capture_queue_depth", "Accepted jobs waiting for a render worker");

    Ok(Arc::new(handle))
}

/// GET /metrics: Prometheus text exposition.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}
