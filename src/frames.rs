//! Adaptive frame capture
//!
//! A capture task samples the active visual source, runs the quality check,
//! encodes to JPEG off the async threads and hands the result back to the
//! session. Cadence is re-read from the session snapshot before every
//! capture, so navigation urgency takes effect on the next frame.

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageError, RgbaImage};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Tuning;
use crate::error::{DeviceError, DeviceKind};
use crate::session::{SessionSnapshot, SessionState};
use crate::urgency::UrgencyLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Camera,
    Screen,
}

impl SourceKind {
    pub fn device_kind(self) -> DeviceKind {
        match self {
            SourceKind::Camera => DeviceKind::Camera,
            SourceKind::Screen => DeviceKind::Screen,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Camera => f.write_str("camera"),
            SourceKind::Screen => f.write_str("screen"),
        }
    }
}

/// Raw RGBA pixels from a source.
#[derive(Debug, Clone)]
pub struct RasterFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

#[async_trait]
pub trait FrameSource: Send {
    /// `Ok(None)` while the source has not produced usable dimensions yet.
    async fn capture(&mut self) -> Result<Option<RasterFrame>, DeviceError>;
}

#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn open(&self, kind: SourceKind) -> Result<Box<dyn FrameSource>, DeviceError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QualityReport {
    pub blurry: bool,
    pub dark: bool,
    /// Human-readable problem, if any.
    pub issue: Option<String>,
}

pub trait QualityCheck: Send + Sync {
    fn check(&self, frame: &RasterFrame) -> QualityReport;
}

/// Passes every frame.
pub struct AcceptAll;

impl QualityCheck for AcceptAll {
    fn check(&self, _frame: &RasterFrame) -> QualityReport {
        QualityReport::default()
    }
}

/// Capture cadence. Navigation follows urgency; default mode is fixed.
pub fn frame_interval(navigation: bool, urgency: UrgencyLevel, default_interval: Duration) -> Duration {
    if navigation {
        urgency.frame_interval()
    } else {
        default_interval
    }
}

/// Encode RGBA pixels as JPEG, shrinking so the longest edge is at most `max_edge`.
pub fn encode_jpeg(frame: &RasterFrame, quality: u8, max_edge: u32) -> Result<Vec<u8>, ImageError> {
    let image = RgbaImage::from_raw(frame.width, frame.height, frame.rgba.clone()).ok_or_else(|| {
        ImageError::Parameter(image::error::ParameterError::from_kind(
            image::error::ParameterErrorKind::DimensionMismatch,
        ))
    })?;

    let longest = frame.width.max(frame.height);
    let image = if max_edge > 0 && longest > max_edge {
        let scale = max_edge as f64 / longest as f64;
        let width = ((frame.width as f64 * scale).round() as u32).max(1);
        let height = ((frame.height as f64 * scale).round() as u32).max(1);
        image::imageops::resize(&image, width, height, FilterType::Triangle)
    } else {
        image
    };

    let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
    let mut jpeg = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
    rgb.write_with_encoder(encoder)?;
    Ok(jpeg.into_inner())
}

#[derive(Debug, Clone)]
pub struct FrameSettings {
    pub default_interval: Duration,
    pub jpeg_quality: u8,
    pub max_edge: u32,
}

impl From<&Tuning> for FrameSettings {
    fn from(tuning: &Tuning) -> Self {
        Self {
            default_interval: tuning.default_frame_interval,
            jpeg_quality: tuning.jpeg_quality,
            max_edge: tuning.max_frame_edge,
        }
    }
}

#[derive(Debug)]
pub enum FrameOutcome {
    Encoded {
        /// Base64 JPEG.
        data: String,
        report: QualityReport,
    },
    /// The source failed; the loop has stopped.
    Failed(DeviceError),
}

/// A running capture loop. Dropping it cancels the task and releases the source.
pub struct FrameLoop {
    kind: SourceKind,
    rx: mpsc::Receiver<FrameOutcome>,
    task: JoinHandle<()>,
}

impl FrameLoop {
    /// Open `kind` and start capturing. The open result is reported on `opened`.
    pub fn spawn(
        kind: SourceKind,
        provider: Arc<dyn SourceProvider>,
        quality: Arc<dyn QualityCheck>,
        snapshot: watch::Receiver<SessionSnapshot>,
        settings: FrameSettings,
        opened: Option<oneshot::Sender<Result<(), DeviceError>>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(async move {
            let source = match provider.open(kind).await {
                Ok(source) => {
                    info!("{} source opened", kind);
                    if let Some(opened) = opened {
                        let _ = opened.send(Ok(()));
                    }
                    source
                }
                Err(e) => {
                    warn!("Could not open {}: {}", kind, e);
                    if let Some(opened) = opened {
                        let _ = opened.send(Err(e.clone()));
                    }
                    let _ = tx.send(FrameOutcome::Failed(e)).await;
                    return;
                }
            };
            capture_loop(source, quality, snapshot, tx, settings).await;
        });
        Self { kind, rx, task }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub async fn next(&mut self) -> Option<FrameOutcome> {
        self.rx.recv().await
    }

    /// Cancel the task and wait until the source has been dropped.
    pub async fn shutdown(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        debug!("{} source released", self.kind);
    }
}

impl Drop for FrameLoop {
    fn drop(&mut self) {
        debug!("Stopping {} capture loop", self.kind);
        self.task.abort();
    }
}

async fn capture_loop(
    mut source: Box<dyn FrameSource>,
    quality: Arc<dyn QualityCheck>,
    snapshot: watch::Receiver<SessionSnapshot>,
    tx: mpsc::Sender<FrameOutcome>,
    settings: FrameSettings,
) {
    loop {
        let (ready, interval) = {
            let snap = snapshot.borrow();
            (
                snap.state == SessionState::Ready,
                frame_interval(snap.navigation, snap.urgency, settings.default_interval),
            )
        };

        if ready {
            match source.capture().await {
                Ok(Some(frame)) => {
                    let report = quality.check(&frame);
                    let (q, max_edge) = (settings.jpeg_quality, settings.max_edge);
                    let encoded =
                        tokio::task::spawn_blocking(move || encode_jpeg(&frame, q, max_edge)).await;
                    match encoded {
                        Ok(Ok(jpeg)) => {
                            debug!("Captured frame: {} KB", jpeg.len() / 1024);
                            let data = general_purpose::STANDARD.encode(&jpeg);
                            if tx.send(FrameOutcome::Encoded { data, report }).await.is_err() {
                                return;
                            }
                        }
                        Ok(Err(e)) => warn!("JPEG encoding failed: {}", e),
                        Err(e) => warn!("JPEG encoder task failed: {}", e),
                    }
                }
                Ok(None) => debug!("Source has no frame dimensions yet, skipping"),
                Err(e) => {
                    warn!("Frame capture failed: {}", e);
                    let _ = tx.send(FrameOutcome::Failed(e)).await;
                    return;
                }
            }
        } else {
            debug!("Session not ready, skipping capture");
        }

        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn solid_frame(width: u32, height: u32) -> RasterFrame {
        RasterFrame {
            width,
            height,
            rgba: vec![128; (width * height * 4) as usize],
        }
    }

    /// Source that counts captures and yields no dimensions for the first `blank` calls.
    pub(crate) struct TestSource {
        pub(crate) captures: Arc<AtomicUsize>,
        pub(crate) blank: usize,
    }

    #[async_trait]
    impl FrameSource for TestSource {
        async fn capture(&mut self) -> Result<Option<RasterFrame>, DeviceError> {
            let n = self.captures.fetch_add(1, Ordering::SeqCst);
            if n < self.blank {
                return Ok(None);
            }
            Ok(Some(solid_frame(8, 6)))
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct TestProvider {
        pub(crate) captures: Arc<AtomicUsize>,
        pub(crate) opens: Arc<AtomicUsize>,
        pub(crate) deny: bool,
    }

    #[async_trait]
    impl SourceProvider for TestProvider {
        async fn open(&self, kind: SourceKind) -> Result<Box<dyn FrameSource>, DeviceError> {
            if self.deny {
                return Err(DeviceError::PermissionDenied(kind.device_kind()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(TestSource {
                captures: self.captures.clone(),
                blank: 0,
            }))
        }
    }

    struct AlwaysDark;

    impl QualityCheck for AlwaysDark {
        fn check(&self, _frame: &RasterFrame) -> QualityReport {
            QualityReport {
                blurry: false,
                dark: true,
                issue: Some("too dark".to_string()),
            }
        }
    }

    fn ready_snapshot(navigation: bool, urgency: UrgencyLevel) -> SessionSnapshot {
        SessionSnapshot {
            state: SessionState::Ready,
            navigation,
            urgency,
            ..SessionSnapshot::default()
        }
    }

    fn settings() -> FrameSettings {
        FrameSettings::from(&Tuning::default())
    }

    #[test]
    fn test_interval_selection() {
        let default = Duration::from_millis(2500);
        assert_eq!(frame_interval(true, UrgencyLevel::Critical, default), Duration::from_millis(500));
        assert_eq!(frame_interval(true, UrgencyLevel::Low, default), Duration::from_millis(2000));
        for level in [UrgencyLevel::Critical, UrgencyLevel::High, UrgencyLevel::Low] {
            assert_eq!(frame_interval(false, level, default), default);
        }
    }

    #[test]
    fn test_encode_jpeg_downscales() {
        let jpeg = encode_jpeg(&solid_frame(2048, 1024), 70, 1024).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1024, 512));
    }

    #[test]
    fn test_encode_jpeg_rejects_short_buffer() {
        let frame = RasterFrame {
            width: 10,
            height: 10,
            rgba: vec![0; 12],
        };
        assert!(encode_jpeg(&frame, 70, 1024).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_cadence_follows_urgency() {
        let provider = TestProvider::default();
        let (snap_tx, snap_rx) = watch::channel(ready_snapshot(true, UrgencyLevel::Critical));
        let mut frames = FrameLoop::spawn(
            SourceKind::Screen,
            Arc::new(provider.clone()),
            Arc::new(AcceptAll),
            snap_rx,
            settings(),
            None,
        );

        // Critical: one capture every 500 ms
        for _ in 0..3 {
            assert!(matches!(frames.next().await, Some(FrameOutcome::Encoded { .. })));
        }
        let start = tokio::time::Instant::now();
        snap_tx.send_modify(|s| s.urgency = UrgencyLevel::Low);
        frames.next().await.unwrap();
        frames.next().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_skips_when_not_ready() {
        let provider = TestProvider::default();
        let (snap_tx, snap_rx) = watch::channel(SessionSnapshot::default());
        let mut frames = FrameLoop::spawn(
            SourceKind::Camera,
            Arc::new(provider.clone()),
            Arc::new(AlwaysDark),
            snap_rx,
            settings(),
            None,
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(provider.captures.load(Ordering::SeqCst), 0);

        snap_tx.send_modify(|s| s.state = SessionState::Ready);
        match frames.next().await {
            Some(FrameOutcome::Encoded { report, .. }) => {
                assert_eq!(report.issue.as_deref(), Some("too dark"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_denied_source_reports_error() {
        let provider = TestProvider {
            deny: true,
            ..TestProvider::default()
        };
        let (_snap_tx, snap_rx) = watch::channel(ready_snapshot(false, UrgencyLevel::Low));
        let (opened_tx, opened_rx) = oneshot::channel();
        let mut frames = FrameLoop::spawn(
            SourceKind::Camera,
            Arc::new(provider),
            Arc::new(AcceptAll),
            snap_rx,
            settings(),
            Some(opened_tx),
        );

        assert_eq!(
            opened_rx.await.unwrap(),
            Err(DeviceError::PermissionDenied(DeviceKind::Camera))
        );
        assert!(matches!(frames.next().await, Some(FrameOutcome::Failed(_))));
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_loop_releases_source() {
        let provider = TestProvider::default();
        let (_snap_tx, snap_rx) = watch::channel(ready_snapshot(false, UrgencyLevel::Low));
        let mut frames = FrameLoop::spawn(
            SourceKind::Camera,
            Arc::new(provider.clone()),
            Arc::new(AcceptAll),
            snap_rx,
            settings(),
            None,
        );
        frames.next().await.unwrap();
        let task = frames.task.abort_handle();
        drop(frames);
        for _ in 0..100 {
            if task.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(task.is_finished());
    }
}
