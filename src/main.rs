use axum::routing::get;
use axum::Router;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

use url_capture::app_state::AppState;
use url_capture::config::AppConfig;
use url_capture::db::SqliteJobStore;
use url_capture::routes;
use url_capture::services::capture::CaptureService;
use url_capture::services::rate_limit::RateRegistry;
use url_capture::services::render::{ChromeRenderer, Renderer};
use url_capture::services::sync::SyncProcess;

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration from environment
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("url-capture: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_tracing(&config) {
        eprintln!("url-capture: failed to open log file: {e}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Server terminated with error");
            ExitCode::FAILURE
        }
    }
}

/// Structured JSON logging, to stdout or appended to `LOG_PATH`.
fn init_tracing(config: &AppConfig) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_log_filter()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).json();

    match &config.log_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

async fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Initializing url-capture server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = routes::metrics::install_recorder()?;

    tracing::info!(path = %config.store_path.display(), "Opening job store");
    let store = Arc::new(SqliteJobStore::open(&config.store_path)?);

    let limiter = Arc::new(RateRegistry::new(config.rate, config.bursts));

    let mut chrome = ChromeRenderer::new(
        &config.chrome_bin,
        &config.chrome_data_dir,
        config.render_timeout(),
    );
    if config.debug {
        chrome = chrome.headed();
    }
    let renderer: Arc<dyn Renderer> = Arc::new(chrome);

    let capture = Arc::new(CaptureService::start(
        store.clone(),
        renderer,
        config.pool_settings(),
    ));

    // Evict old records and idle clients in the background
    let sync = SyncProcess::new(store.clone(), limiter.clone(), config.sync_settings()).spawn();

    let state = AppState::new(store.clone(), limiter, capture.clone());

    let app = routes::router(state).merge(
        Router::new().route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        ),
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    tracing::info!("HTTP server stopped, shutting down background work");

    sync.stop().await;

    if tokio::time::timeout(config.shutdown_grace(), capture.shutdown())
        .await
        .is_err()
    {
        tracing::warn!(
            grace_secs = config.shutdown_grace().as_secs(),
            in_flight = capture.in_flight(),
            "Renders still running after grace period; their jobs stay pending"
        );
    }

    store.close();

    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
