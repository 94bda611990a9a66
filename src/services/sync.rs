use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::db::JobStore;
use crate::services::rate_limit::AdmissionControl;

/// Idle client buckets are kept for this many sync periods.
pub const CLIENT_RETENTION_PERIODS: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    /// Time between sweeps.
    pub interval: Duration,
    /// Age after which job records are evicted.
    pub image_retention: Duration,
}

impl SyncSettings {
    pub fn client_retention(&self) -> Duration {
        self.interval * CLIENT_RETENTION_PERIODS
    }
}

/// Periodic eviction of old job records and client buckets.
pub struct SyncProcess {
    store: Arc<dyn JobStore>,
    limiter: Arc<dyn AdmissionControl>,
    settings: SyncSettings,
}

/// Handle to a running [`SyncProcess`].
pub struct SyncHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncProcess {
    pub fn new(
        store: Arc<dyn JobStore>,
        limiter: Arc<dyn AdmissionControl>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            limiter,
            settings,
        }
    }

    /// Run one sweep: job records first, then client buckets.
    pub async fn sweep(&self) {
        match self.store.evict_older_than(self.settings.image_retention).await {
            Ok(removed) => {
                metrics::counter!("store_evicted_records").increment(removed);
                if removed > 0 {
                    tracing::info!(removed, "Evicted expired job records");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Job store eviction failed");
            }
        }

        let removed = self.limiter.evict_older_than(self.settings.client_retention());
        metrics::counter!("limiter_evicted_clients").increment(removed as u64);
        if removed > 0 {
            tracing::debug!(removed, "Evicted rate limiter clients");
        }
    }

    /// Start the loop. The first sweep happens one interval after start.
    pub fn spawn(self) -> SyncHandle {
        let token = CancellationToken::new();
        let child = token.clone();

        let task = tokio::spawn(async move {
            let period = self.settings.interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                interval_secs = period.as_secs_f64(),
                image_retention_secs = self.settings.image_retention.as_secs(),
                client_retention_secs = self.settings.client_retention().as_secs(),
                "Sync process started"
            );

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => self.sweep().await,
                }
            }

            tracing::info!("Sync process stopped");
        });

        SyncHandle { token, task }
    }
}

impl SyncHandle {
    /// Stop the loop and wait for it to exit. A sweep in progress completes first.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Sync task ended abnormally");
        }
    }
}
