use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use serde::Serialize;

use crate::app_state::AppState;
use crate::db::StoreStats;
use crate::routes::error::{envelope, ApiError};
use crate::services::rate_limit::LimiterStats;
use crate::util::bytes::format_bytes;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub store: StoreSummary,
    pub limiter: LimiterStats,
    pub process: ProcessStats,
}

#[derive(Debug, Serialize)]
pub struct StoreSummary {
    #[serde(flatten)]
    pub counts: StoreStats,
    /// `stored_bytes` in human-readable form.
    pub stored_size: String,
}

#[derive(Debug, Serialize)]
pub struct ProcessStats {
    pub cpus: usize,
    pub runtime_workers: usize,
    pub alive_tasks: usize,
    pub render_workers: usize,
    pub render_queue_depth: usize,
    pub render_queue_capacity: usize,
    pub render_in_flight: usize,
    pub uptime_secs: u64,
}

/// GET /stats: job counts, tracked clients and process resources.
pub async fn stats(State(state): State<AppState>) -> Result<Response, ApiError> {
    let counts = state.store.statistics().await?;

    let runtime = tokio::runtime::Handle::current().metrics();
    let pool = state.capture.settings();

    let response = StatsResponse {
        store: StoreSummary {
            counts,
            stored_size: format_bytes(counts.stored_bytes),
        },
        limiter: state.limiter.statistics(),
        process: ProcessStats {
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            runtime_workers: runtime.num_workers(),
            alive_tasks: runtime.num_alive_tasks(),
            render_workers: pool.workers,
            render_queue_depth: state.capture.queue_depth(),
            render_queue_capacity: pool.queue_capacity,
            render_in_flight: state.capture.in_flight(),
            uptime_secs: state.started_at.elapsed().as_secs(),
        },
    };

    Ok(envelope(StatusCode::OK, response))
}
