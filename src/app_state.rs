use std::sync::Arc;
use std::time::Instant;

use crate::db::JobStore;
use crate::services::capture::CaptureService;
use crate::services::rate_limit::AdmissionControl;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub limiter: Arc<dyn AdmissionControl>,
    pub capture: Arc<CaptureService>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<dyn JobStore>,
        limiter: Arc<dyn AdmissionControl>,
        capture: Arc<CaptureService>,
    ) -> Self {
        Self {
            store,
            limiter,
            capture,
            started_at: Instant::now(),
        }
    }
}
