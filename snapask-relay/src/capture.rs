use std::{
    io::Cursor,
    time::{SystemTime, UNIX_EPOCH},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use snapask_core::ArtifactInfo;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("screen capture failed: {0}")]
pub struct CaptureFault(pub String);

/// Source of desktop screenshots. Implementations block; the pipeline calls them off the runtime.
pub trait ScreenCapturer: Send + Sync {
    /// Returns the current desktop as PNG bytes.
    fn capture_png(&self) -> Result<Vec<u8>, CaptureFault>;

    fn device_id(&self) -> &str;
}

/// The latest screenshot. Only one is live at a time; a new capture supersedes it.
#[derive(Debug, Clone)]
pub struct CaptureArtifact {
    pub png: Bytes,
    pub captured_at_unix_ms: u64,
    pub device_id: String,
}

impl CaptureArtifact {
    pub fn new(png: Bytes, device_id: impl Into<String>) -> Self {
        Self {
            png,
            captured_at_unix_ms: now_unix_ms(),
            device_id: device_id.into(),
        }
    }

    pub fn info(&self, include_image: bool) -> ArtifactInfo {
        ArtifactInfo {
            captured_at_unix_ms: self.captured_at_unix_ms,
            device_id: self.device_id.clone(),
            byte_len: self.png.len(),
            image_png_base64: include_image.then(|| STANDARD.encode(&self.png)),
        }
    }
}

/// Captures the first monitor reported by the OS.
#[derive(Debug, Clone)]
pub struct XcapCapturer {
    device_id: String,
    max_width: Option<u32>,
}

impl XcapCapturer {
    pub fn new(device_id: impl Into<String>, max_width: Option<u32>) -> Self {
        Self {
            device_id: device_id.into(),
            max_width: max_width.filter(|w| *w > 0),
        }
    }
}

impl ScreenCapturer for XcapCapturer {
    fn capture_png(&self) -> Result<Vec<u8>, CaptureFault> {
        let monitors = xcap::Monitor::all()
            .map_err(|e| CaptureFault(format!("failed to list monitors: {e}")))?;
        let monitor = monitors
            .first()
            .ok_or_else(|| CaptureFault("no monitors found".to_owned()))?;
        let image = monitor
            .capture_image()
            .map_err(|e| CaptureFault(e.to_string()))?;

        let (width, height) = (image.width(), image.height());
        let image = match self.max_width {
            Some(max_width) if width > max_width => {
                let scale = f64::from(max_width) / f64::from(width);
                let new_height = ((f64::from(height) * scale) as u32).max(1);
                debug!(width, height, max_width, new_height, "downscaling capture");
                image::imageops::resize(
                    &image,
                    max_width,
                    new_height,
                    image::imageops::FilterType::Triangle,
                )
            }
            _ => image,
        };

        let mut buffer = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut buffer, image::ImageFormat::Png)
            .map_err(|e| CaptureFault(format!("failed to encode image: {e}")))?;
        Ok(buffer.into_inner())
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }
}

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
