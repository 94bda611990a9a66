use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Desktop user agent presented to captured sites.
pub const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/85.0.4183.102 Safari/537.36";

/// Turns a URL and viewport size into image bytes.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, url: &str, width: u32, height: u32) -> Result<Vec<u8>, RenderError>;
}

/// Renders pages with a headless Chrome/Chromium child process.
///
/// Each render gets its own profile directory under `data_dir`, so concurrent
/// renders never contend for the browser's profile lock.
pub struct ChromeRenderer {
    binary: PathBuf,
    data_dir: PathBuf,
    timeout: Duration,
    headless: bool,
}

impl ChromeRenderer {
    pub fn new(binary: impl Into<PathBuf>, data_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            data_dir: data_dir.into(),
            timeout,
            headless: true,
        }
    }

    /// Show the browser window (debugging only).
    pub fn headed(mut self) -> Self {
        self.headless = false;
        self
    }

    fn command(&self, url: &str, width: u32, height: u32, profile: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        if self.headless {
            cmd.arg("--headless=new").arg("--disable-gpu");
        }
        cmd.arg("--hide-scrollbars")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg(format!("--user-data-dir={}", profile.display()))
            .arg(format!("--user-agent={CHROME_USER_AGENT}"))
            .arg(format!("--window-size={width},{height}"))
            .arg(format!("--screenshot={}", output.display()))
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Renderer for ChromeRenderer {
    async fn render(&self, url: &str, width: u32, height: u32) -> Result<Vec<u8>, RenderError> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let workdir = tempfile::Builder::new()
            .prefix("render-")
            .tempdir_in(&self.data_dir)?;
        let profile = workdir.path().join("profile");
        let output = workdir.path().join("screenshot.png");

        let child = self
            .command(url, width, height, &profile, &output)
            .spawn()
            .map_err(RenderError::Spawn)?;

        // Dropping the future on timeout drops the child, which kills it.
        let result = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| RenderError::Timeout(self.timeout))??;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(RenderError::Exit {
                code: result.status.code(),
                stderr: stderr.trim().chars().take(512).collect(),
            });
        }

        let bytes = match tokio::fs::read(&output).await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => return Err(RenderError::MissingOutput),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RenderError::MissingOutput)
            }
            Err(e) => return Err(e.into()),
        };

        image::guess_format(&bytes).map_err(|_| RenderError::NotAnImage)?;

        tracing::debug!(url = %url, width, height, bytes = bytes.len(), "Render complete");
        Ok(bytes)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to launch browser: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("render timed out after {0:?}")]
    Timeout(Duration),

    #[error("browser exited with status {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("browser produced no screenshot")]
    MissingOutput,

    #[error("browser output is not a recognised image")]
    NotAnImage,

    #[error("render I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
