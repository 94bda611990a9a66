//! Shared setup for router-level tests: a temporary store, a stub renderer
//! and helpers for driving the router without a socket.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tower::ServiceExt;

use url_capture::app_state::AppState;
use url_capture::db::SqliteJobStore;
use url_capture::routes;
use url_capture::services::capture::{CaptureService, PoolSettings};
use url_capture::services::rate_limit::RateRegistry;
use url_capture::services::render::{RenderError, Renderer};

/// Start of a JFIF image.
pub const JPEG_BYTES: [u8; 8] = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46];

/// Renderer stand-in that records calls and returns a fixed result,
/// optionally waiting for a permit first.
pub struct StubRenderer {
    result: Result<Vec<u8>, String>,
    gate: Option<Arc<Semaphore>>,
    pub calls: Mutex<Vec<(String, u32, u32)>>,
}

impl StubRenderer {
    pub fn ok(bytes: &[u8]) -> Self {
        Self {
            result: Ok(bytes.to_vec()),
            gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn gated(bytes: &[u8], gate: Arc<Semaphore>) -> Self {
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

pub struct TestApp {
    pub router: Router,
    pub store: Arc<SqliteJobStore>,
    pub limiter: Arc<RateRegistry>,
    pub capture: Arc<CaptureService>,
    pub renderer: Arc<StubRenderer>,
    _dir: TempDir,
}

pub struct TestOptions {
    pub rate: f64,
    pub burst: u32,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            rate: 100.0,
            burst: 100,
            workers: 2,
            queue_capacity: 16,
        }
    }
}

pub fn spawn_app(renderer: StubRenderer) -> TestApp {
    spawn_app_with(renderer, TestOptions::default())
}

pub fn spawn_app_with(renderer: StubRenderer, options: TestOptions) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteJobStore::open(dir.path().join("jobs.db")).unwrap());
    let limiter = Arc::new(RateRegistry::new(options.rate, options.burst));
    let renderer = Arc::new(renderer);
    let capture = Arc::new(CaptureService::start(
        store.clone(),
        renderer.clone(),
        PoolSettings {
            workers: options.workers,
            queue_capacity: options.queue_capacity,
        },
    ));

    let state = AppState::new(store.clone(), limiter.clone(), capture.clone());

    TestApp {
        router: routes::router(state),
        store,
        limiter,
        capture,
        renderer,
        _dir: dir,
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("response body is not JSON")
    }

    /// The `payload` field of the JSON envelope.
    pub fn payload(&self) -> Value {
        let json = self.json();
        assert_eq!(json["status"], self.status.as_u16(), "envelope status mismatch");
        json["payload"].clone()
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn post_capture(&self, body: Value, client: &str) -> TestResponse {
        let request = Request::post("/capture")
            .header("content-type", "application/json")
            .header("x-real-ip", client)
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    pub async fn get(&self, uri: &str, client: &str) -> TestResponse {
        let request = Request::get(uri)
            .header("x-real-ip", client)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    /// Submit a capture and return the job id from the response.
    pub async fn submit(&self, url: &str) -> String {
        let response = self
            .post_capture(serde_json::json!({ "url": url }), "198.51.100.10")
            .await;
        assert_eq!(response.status, StatusCode::OK, "submit failed: {:?}", response.json());
        response.payload()["id"].as_str().unwrap().to_string()
    }

    /// Poll `/download/{id}` until it stops reporting "not yet captured".
    pub async fn wait_for_download(&self, id: &str) -> TestResponse {
        for _ in 0..200 {
            let response = self.get(&format!("/download/{id}"), "198.51.100.99").await;
            if response.status != StatusCode::ACCEPTED {
                return response;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never finished");
    }
}
