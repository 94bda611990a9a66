use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_WIDTH: u32 = 1024;
pub const DEFAULT_HEIGHT: u32 = 800;
pub const MAX_DIMENSION: u32 = 8192;

/// Body of `POST /capture`.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CaptureRequest {
    #[garde(length(min = 1, max = 2048), url, custom(http_scheme))]
    pub url: String,

    /// Viewport width; 0 or absent means [`DEFAULT_WIDTH`].
    #[garde(range(max = MAX_DIMENSION))]
    #[serde(default)]
    pub width: Option<u32>,

    /// Viewport height; 0 or absent means [`DEFAULT_HEIGHT`].
    #[garde(range(max = MAX_DIMENSION))]
    #[serde(default)]
    pub height: Option<u32>,
}

impl CaptureRequest {
    pub fn new(url: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            url: url.into(),
            width: Some(width),
            height: Some(height),
        }
    }

    /// Apply viewport defaults.
    pub fn resolve(self) -> CaptureTarget {
        CaptureTarget {
            url: self.url,
            width: self.width.filter(|w| *w > 0).unwrap_or(DEFAULT_WIDTH),
            height: self.height.filter(|h| *h > 0).unwrap_or(DEFAULT_HEIGHT),
        }
    }
}

fn http_scheme(value: &str, _ctx: &()) -> garde::Result {
    let lower = value.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Ok(())
    } else {
        Err(garde::Error::new("url must use http or https"))
    }
}

/// A capture request with defaults resolved, as handed to the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

/// Response after submitting a capture.
#[derive(Debug, Serialize, Deserialize)]
pub struct CaptureResponse {
    pub id: Uuid,
}
