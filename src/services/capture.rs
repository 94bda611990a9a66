use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::db::{JobStore, StoreError};
use crate::models::capture::{CaptureRequest, CaptureTarget};
use crate::models::job::JobRecord;
use crate::services::render::Renderer;

/// Failure message recorded when a render succeeds without producing bytes.
pub const EMPTY_RENDER_MESSAGE: &str = "renderer returned no image";

/// Sizing for the render worker pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// Concurrent renders.
    pub workers: usize,
    /// Accepted jobs waiting for a worker.
    pub queue_capacity: usize,
}

/// A job accepted into the backlog.
#[derive(Debug)]
struct RenderJob {
    record: JobRecord,
    target: CaptureTarget,
}

/// Creates capture jobs and drives them to a terminal state.
///
/// Renders run on a fixed pool of workers fed by a bounded backlog. `submit`
/// never waits for a render: when the backlog is full it rejects instead.
pub struct CaptureService {
    store: Arc<dyn JobStore>,
    sender: RwLock<Option<mpsc::Sender<RenderJob>>>,
    tracker: TaskTracker,
    in_flight: Arc<AtomicUsize>,
    settings: PoolSettings,
}

impl CaptureService {
    /// Build the service and start its workers on the current runtime.
    pub fn start(
        store: Arc<dyn JobStore>,
        renderer: Arc<dyn Renderer>,
        settings: PoolSettings,
    ) -> Self {
        let workers = settings.workers.max(1);
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let tracker = TaskTracker::new();
        let in_flight = Arc::new(AtomicUsize::new(0));

        for worker_id in 0..workers {
            let worker = Worker {
                id: worker_id,
                store: Arc::clone(&store),
                renderer: Arc::clone(&renderer),
                receiver: Arc::clone(&receiver),
                in_flight: Arc::clone(&in_flight),
            };
            tracker.spawn(worker.run());
        }

        tracing::info!(
            workers,
            queue_capacity = settings.queue_capacity,
            "Capture worker pool started"
        );

        Self {
            store,
            sender: RwLock::new(Some(sender)),
            tracker,
            in_flight,
            settings,
        }
    }

    /// Accept a capture request and return its job id without waiting for the render.
    pub async fn submit(&self, request: CaptureRequest) -> Result<Uuid, CaptureError> {
        let target = request.resolve();

        let sender = self
            .sender
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or(CaptureError::ShuttingDown)?;

        // Hold a backlog slot before persisting anything, so a full queue
        // never leaves an orphaned Pending record behind.
        let permit = sender.try_reserve_owned().map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CaptureError::Saturated,
            mpsc::error::TrySendError::Closed(_) => CaptureError::ShuttingDown,
        })?;

        // Persist and enqueue on a tracked task: once the record exists it is
        // always handed to a worker, even if the caller goes away.
        let store = Arc::clone(&self.store);
        let enqueue = self.tracker.spawn(async move {
            let record = JobRecord::pending();
            let id = record.id;
            store.create(&record).await?;
            permit.send(RenderJob { record, target });
            Ok::<_, CaptureError>(id)
        });

        let id = enqueue.await.map_err(StoreError::from)??;

        metrics::counter!("capture_jobs_submitted").increment(1);
        metrics::gauge!("capture_queue_depth").set(self.queue_depth() as f64);
        tracing::info!(job_id = %id, "Capture job accepted");

        Ok(id)
    }

    /// Look up a job.
    pub async fn find(&self, id: Uuid) -> Result<JobRecord, StoreError> {
        self.store.find(id).await
    }

    /// Jobs waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.sender
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0)
    }

    /// Renders currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> PoolSettings {
        self.settings
    }

    pub fn is_accepting(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }

    /// Stop accepting jobs, let workers finish every accepted job, then return.
    pub async fn shutdown(&self) {
        let sender = self
            .sender
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let pending = sender
            .as_ref()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0);
        drop(sender);

        tracing::info!(
            queued = pending,
            in_flight = self.in_flight(),
            "Draining capture workers"
        );

        self.tracker.close();
        self.tracker.wait().await;

        tracing::info!("Capture workers stopped");
    }
}

struct Worker {
    id: usize,
    store: Arc<dyn JobStore>,
    renderer: Arc<dyn Renderer>,
    receiver: Arc<Mutex<mpsc::Receiver<RenderJob>>>,
    in_flight: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(self) {
        loop {
            // The lock is only held while waiting for the next job.
            let job = self.receiver.lock().await.recv().await;
            let Some(job) = job else {
                break;
            };
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            self.process(job).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::debug!(worker = self.id, "Capture worker exiting");
    }

    async fn process(&self, job: RenderJob) {
        let RenderJob { mut record, target } = job;
        let id = record.id;

        tracing::info!(
            worker = self.id,
            job_id = %id,
            url = %target.url,
            width = target.width,
            height = target.height,
            "Rendering capture"
        );

        let start = Instant::now();
        let outcome = self
            .renderer
            .render(&target.url, target.width, target.height)
            .await;
        metrics::histogram!("capture_render_seconds").record(start.elapsed().as_secs_f64());

        let transition = match outcome {
            Ok(bytes) if bytes.is_empty() => {
                tracing::error!(job_id = %id, "Renderer returned no image");
                metrics::counter!("capture_jobs_failed").increment(1);
                record.fail(EMPTY_RENDER_MESSAGE)
            }
            Ok(bytes) => {
                tracing::info!(
                    job_id = %id,
                    bytes = bytes.len(),
                    render_ms = start.elapsed().as_millis() as u64,
                    "Capture succeeded"
                );
                metrics::counter!("capture_jobs_completed").increment(1);
                record.succeed(bytes)
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Capture failed");
                metrics::counter!("capture_jobs_failed").increment(1);
                record.fail(e.to_string())
            }
        };

        if let Err(e) = transition {
            tracing::error!(job_id = %id, error = %e, "Skipping save of terminal job");
            return;
        }

        // A failed save leaves the job Pending; it is only visible in the logs.
        if let Err(e) = self.store.save(&record).await {
            metrics::counter!("capture_save_errors").increment(1);
            tracing::error!(
                job_id = %id,
                status = %record.status(),
                error = %e,
                "Failed to save capture result"
            );
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("render queue is full")]
    Saturated,

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("failed to create job: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteJobStore;
    use crate::models::job::JobStatus;
    use crate::services::render::RenderError;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    const JPEG_HEADER: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE0];

    /// Records every call and returns a fixed result, optionally after a gate opens.
    struct StubRenderer {
        result: Result<Vec<u8>, String>,
        gate: Option<Arc<Semaphore>>,
        calls: StdMutex<Vec<(String, u32, u32)>>,
    }

    impl StubRenderer {
        fn ok(bytes: &[u8]) -> Self {
            Self {
                result: Ok(bytes.to_vec()),
                gate: None,
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                result: Err(message.to_string()),
                gate: None,
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn gated(bytes: &[u8], gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::ok(bytes)
            }
        }
    }

    #[async_trait]
    impl Renderer for StubRenderer {
        async fn render(&self, url: &str, width: u32, height: u32) -> Result<Vec<u8>, RenderError> {
            self.calls
                .lock()
                .unwrap()
                .push((url.to_string(), width, height));
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            self.result.clone().map_err(RenderError::Other)
        }
    }

    /// Store whose inserts take a while, so callers can give up mid-write.
    struct SlowCreateStore {
        inner: Arc<SqliteJobStore>,
        delay: Duration,
    }

    #[async_trait]
    impl JobStore for SlowCreateStore {
        async fn create(&self, record: &JobRecord) -> Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.create(record).await
        }

        async fn save(&self, record: &JobRecord) -> Result<(), StoreError> {
            self.inner.save(record).await
        }

        async fn find(&self, id: Uuid) -> Result<JobRecord, StoreError> {
            self.inner.find(id).await
        }

        async fn evict_created_before(
            &self,
            cutoff: chrono::DateTime<chrono::Utc>,
        ) -> Result<u64, StoreError> {
            self.inner.evict_created_before(cutoff).await
        }

        async fn statistics(&self) -> Result<crate::db::StoreStats, StoreError> {
            self.inner.statistics().await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }
    }

    fn temp_store() -> (TempDir, Arc<SqliteJobStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::open(dir.path().join("jobs.db")).unwrap();
        (dir, Arc::new(store))
    }

    fn pool(workers: usize, queue_capacity: usize) -> PoolSettings {
        PoolSettings {
            workers,
            queue_capacity,
        }
    }

    async fn wait_terminal(service: &CaptureService, id: Uuid) -> JobRecord {
        for _ in 0..200 {
            let record = service.find(id).await.unwrap();
            if record.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not reach a terminal state");
    }

    #[tokio::test]
    async fn test_successful_capture_with_default_viewport() {
        let (_dir, store) = temp_store();
        let renderer = Arc::new(StubRenderer::ok(&JPEG_HEADER));
        let service = CaptureService::start(store, renderer.clone(), pool(2, 8));

        let id = service
            .submit(CaptureRequest::new("https://example.com", 0, 0))
            .await
            .unwrap();

        let record = wait_terminal(&service, id).await;
        assert_eq!(record.status(), JobStatus::Success);
        assert_eq!(record.payload(), &JPEG_HEADER);
        assert_eq!(record.message(), "");

        let calls = renderer.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("https://example.com".to_string(), 1024, 800)]);
    }

    #[tokio::test]
    async fn test_failed_render_is_captured_in_record() {
        let (_dir, store) = temp_store();
        let renderer = Arc::new(StubRenderer::failing("net::ERR_CONNECTION_REFUSED"));
        let service = CaptureService::start(store, renderer, pool(1, 4));

        let id = service
            .submit(CaptureRequest::new("https://unreachable.test", 800, 600))
            .await
            .unwrap();

        let record = wait_terminal(&service, id).await;
        assert_eq!(record.status(), JobStatus::Failed);
        assert_eq!(record.message(), "net::ERR_CONNECTION_REFUSED");
        assert!(record.payload().is_empty());
    }

    #[tokio::test]
    async fn test_job_is_pending_until_render_finishes() {
        let (_dir, store) = temp_store();
        let gate = Arc::new(Semaphore::new(0));
        let renderer = Arc::new(StubRenderer::gated(&JPEG_HEADER, gate.clone()));
        let service = CaptureService::start(store, renderer, pool(1, 4));

        let id = service
            .submit(CaptureRequest::new("https://example.com", 0, 0))
            .await
            .unwrap();

        let record = service.find(id).await.unwrap();
        assert_eq!(record.status(), JobStatus::Pending);
        assert_eq!(record.message(), "");
        assert!(record.payload().is_empty());

        gate.add_permits(1);
        let record = wait_terminal(&service, id).await;
        assert_eq!(record.status(), JobStatus::Success);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (_dir, store) = temp_store();
        let renderer = Arc::new(StubRenderer::ok(&JPEG_HEADER));
        let service = CaptureService::start(store, renderer, pool(4, 256));

        let ids = futures::future::join_all(
            (0..100).map(|_| service.submit(CaptureRequest::new("https://example.com", 0, 0))),
        )
        .await;

        let unique: std::collections::HashSet<Uuid> =
            ids.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(unique.len(), 100);
    }

    #[tokio::test]
    async fn test_concurrent_readers_only_see_valid_records() {
        let (_dir, store) = temp_store();
        let renderer = Arc::new(StubRenderer::ok(&JPEG_HEADER));
        let service = Arc::new(CaptureService::start(store, renderer, pool(4, 64)));

        let mut ids = Vec::new();
        for _ in 0..20 {
            ids.push(
                service
                    .submit(CaptureRequest::new("https://example.com", 0, 0))
                    .await
                    .unwrap(),
            );
        }

        // Decoding rejects any invalid (status, message, payload) combination.
        for _ in 0..10 {
            for id in &ids {
                let record = service.find(*id).await.unwrap();
                match record.status() {
                    JobStatus::Pending => assert!(record.payload().is_empty()),
                    JobStatus::Success => assert_eq!(record.payload(), &JPEG_HEADER),
                    JobStatus::Failed => panic!("unexpected failure"),
                }
            }
        }

        for id in ids {
            assert_eq!(wait_terminal(&service, id).await.status(), JobStatus::Success);
        }
    }

    #[tokio::test]
    async fn test_full_backlog_rejects_without_persisting() {
        let (_dir, store) = temp_store();
        let gate = Arc::new(Semaphore::new(0));
        let renderer = Arc::new(StubRenderer::gated(&JPEG_HEADER, gate.clone()));
        let service = CaptureService::start(store.clone(), renderer, pool(1, 1));

        // First job occupies the worker, second fills the backlog.
        service
            .submit(CaptureRequest::new("https://a.test", 0, 0))
            .await
            .unwrap();
        let mut accepted = 1;
        let mut saturated = false;
        for _ in 0..5 {
            match service
                .submit(CaptureRequest::new("https://b.test", 0, 0))
                .await
            {
                Ok(_) => accepted += 1,
                Err(CaptureError::Saturated) => {
                    saturated = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(saturated);
        assert!(accepted <= 2);

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total(), accepted);

        gate.add_permits(accepted as usize);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_failure_is_returned_synchronously() {
        let (_dir, store) = temp_store();
        let renderer = Arc::new(StubRenderer::ok(&JPEG_HEADER));
        let service = CaptureService::start(store.clone(), renderer.clone(), pool(1, 4));

        store.close();
        let err = service
            .submit(CaptureRequest::new("https://example.com", 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Store(StoreError::Closed)));

        service.shutdown().await;
        assert!(renderer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_failure_leaves_job_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let store = Arc::new(SqliteJobStore::open(&path).unwrap());
        let gate = Arc::new(Semaphore::new(0));
        let renderer = Arc::new(StubRenderer::gated(&JPEG_HEADER, gate.clone()));
        let service = CaptureService::start(store.clone(), renderer, pool(1, 4));

        let id = service
            .submit(CaptureRequest::new("https://example.com", 0, 0))
            .await
            .unwrap();

        store.close();
        gate.add_permits(1);
        service.shutdown().await;

        let reopened = SqliteJobStore::open(&path).unwrap();
        assert_eq!(reopened.find(id).await.unwrap().status(), JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_shutdown_drains_accepted_jobs() {
        let (_dir, store) = temp_store();
        let gate = Arc::new(Semaphore::new(0));
        let renderer = Arc::new(StubRenderer::gated(&JPEG_HEADER, gate.clone()));
        let service = CaptureService::start(store.clone(), renderer, pool(2, 8));

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(
                service
                    .submit(CaptureRequest::new("https://example.com", 0, 0))
                    .await
                    .unwrap(),
            );
        }

        gate.add_permits(5);
        service.shutdown().await;

        for id in ids {
            assert_eq!(store.find(id).await.unwrap().status(), JobStatus::Success);
        }
        assert!(!service.is_accepting());
        assert_eq!(service.in_flight(), 0);

        let err = service
            .submit(CaptureRequest::new("https://example.com", 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_abandoned_submit_still_renders() {
        let (_dir, store) = temp_store();
        let slow = Arc::new(SlowCreateStore {
            inner: store.clone(),
            delay: Duration::from_millis(30),
        });
        let renderer = Arc::new(StubRenderer::ok(&JPEG_HEADER));
        let service = CaptureService::start(slow, renderer.clone(), pool(2, 64));

        let mut abandoned = 0;
        for _ in 0..10 {
            let submit = service.submit(CaptureRequest::new("https://example.com", 0, 0));
            if tokio::time::timeout(Duration::from_millis(5), submit)
                .await
                .is_err()
            {
                abandoned += 1;
            }
        }
        assert_eq!(abandoned, 10);

        service.shutdown().await;

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.success, 10);
        assert_eq!(renderer.calls.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_empty_render_is_recorded_as_failure() {
        let (_dir, store) = temp_store();
        let renderer = Arc::new(StubRenderer::ok(&[]));
        let service = CaptureService::start(store, renderer, pool(1, 4));

        let id = service
            .submit(CaptureRequest::new("https://example.com", 0, 0))
            .await
            .unwrap();

        let record = wait_terminal(&service, id).await;
        assert_eq!(record.status(), JobStatus::Failed);
        assert_eq!(record.message(), EMPTY_RENDER_MESSAGE);
        assert!(record.payload().is_empty());
    }
}
