//! Primary-monitor screen capture through xcap
//!
//! Capture is blocking, so every grab runs on the blocking pool. There is no
//! camera backend on the desktop; asking for one reports NotFound.

use async_trait::async_trait;
use tracing::{debug, info};
use xcap::Monitor;

use crate::error::{DeviceError, DeviceKind};
use crate::frames::{FrameSource, RasterFrame, SourceKind, SourceProvider};

fn screen_error(e: impl std::fmt::Display) -> DeviceError {
    DeviceError::other(DeviceKind::Screen, e.to_string())
}

fn primary_monitor() -> Result<Monitor, DeviceError> {
    let monitors = Monitor::all().map_err(screen_error)?;
    monitors
        .iter()
        .find(|m| m.is_primary().unwrap_or(false))
        .or_else(|| monitors.first())
        .cloned()
        .ok_or(DeviceError::NotFound(DeviceKind::Screen))
}

fn grab() -> Result<Option<RasterFrame>, DeviceError> {
    let image = primary_monitor()?.capture_image().map_err(screen_error)?;
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Ok(None);
    }
    Ok(Some(RasterFrame {
        width,
        height,
        rgba: image.into_raw(),
    }))
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, DeviceError> + Send + 'static,
) -> Result<T, DeviceError> {
    tokio::task::spawn_blocking(f).await.map_err(screen_error)?
}

pub struct ScreenSources;

#[async_trait]
impl SourceProvider for ScreenSources {
    async fn open(&self, kind: SourceKind) -> Result<Box<dyn FrameSource>, DeviceError> {
        match kind {
            SourceKind::Camera => Err(DeviceError::NotFound(DeviceKind::Camera)),
            SourceKind::Screen => {
                let name = blocking(|| {
                    let monitor = primary_monitor()?;
                    Ok(monitor.name().unwrap_or_else(|_| "unknown".to_string()))
                })
                .await?;
                info!("Sharing monitor {}", name);
                Ok(Box::new(ScreenSource))
            }
        }
    }
}

struct ScreenSource;

#[async_trait]
impl FrameSource for ScreenSource {
    async fn capture(&mut self) -> Result<Option<RasterFrame>, DeviceError> {
        let frame = blocking(grab).await?;
        if let Some(frame) = &frame {
            debug!("Grabbed {}x{} screen", frame.width, frame.height);
        }
        Ok(frame)
    }
}
