//! Microphone capture and barge-in detection
//!
//! Raw samples are pulled on a dedicated OS thread and handed to the session
//! as owned [`MicFrame`]s over a channel. The thread shares nothing with the
//! session except the shutdown flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{DeviceError, DeviceKind};
use crate::pcm;

/// One block of microphone audio at the input rate, normalized to [-1, 1].
#[derive(Debug, Clone)]
pub struct MicFrame {
    pub samples: Vec<f32>,
    pub rms: f32,
}

/// Blocking sample source read from the capture thread.
pub trait MicSource: Send + 'static {
    /// Fill `frame` completely.
    fn read(&mut self, frame: &mut [f32]) -> Result<(), DeviceError>;
}

/// Acquires a microphone. Called off the session task.
pub trait MicProvider: Send + Sync {
    fn open(&self) -> Result<Box<dyn MicSource>, DeviceError>;
}

/// Upper bound on waiting for the capture thread to let go of the device.
const JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Handle to a running capture thread. Dropping it stops the thread without
/// waiting; [`MicCapture::shutdown`] also waits for the device to close.
pub struct MicCapture {
    rx: mpsc::Receiver<MicFrame>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MicCapture {
    pub fn spawn(source: Box<dyn MicSource>, frame_samples: usize) -> Result<Self, DeviceError> {
        let (tx, rx) = mpsc::channel::<MicFrame>(32);
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::Builder::new()
            .name("navlive-mic".to_string())
            .spawn(move || run_capture(source, frame_samples, tx, shutdown_clone))
            .map_err(|e| DeviceError::other(DeviceKind::Microphone, e.to_string()))?;

        info!("Microphone capture started ({} samples per frame)", frame_samples);
        Ok(Self {
            rx,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Next captured frame, or `None` once the device has gone away.
    pub async fn next_frame(&mut self) -> Option<MicFrame> {
        self.rx.recv().await
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Stop the thread and wait until it has dropped the source.
    pub async fn shutdown(mut self) {
        self.stop();
        self.rx.close();
        let Some(handle) = self.handle.take() else {
            return;
        };
        let join = tokio::task::spawn_blocking(move || handle.join());
        match tokio::time::timeout(JOIN_TIMEOUT, join).await {
            Ok(Ok(Ok(()))) => debug!("Microphone released"),
            Ok(Ok(Err(_))) => error!("Microphone capture thread panicked"),
            Ok(Err(e)) => error!("Failed to join microphone thread: {}", e),
            Err(_) => warn!("Microphone read still blocked after {:?}", JOIN_TIMEOUT),
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        debug!("Releasing microphone");
        self.stop();
    }
}

fn run_capture(
    mut source: Box<dyn MicSource>,
    frame_samples: usize,
    tx: mpsc::Sender<MicFrame>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let mut samples = vec![0.0f32; frame_samples];
        if let Err(e) = source.read(&mut samples) {
            error!("Microphone read failed: {}", e);
            break;
        }
        let rms = pcm::rms(&samples);
        match tx.try_send(MicFrame { samples, rms }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Session is behind, dropping mic frame"),
            Err(TrySendError::Closed(_)) => break,
        }
    }
    debug!("Microphone capture thread exiting");
}

/// Detects the user talking over the model.
#[derive(Debug, Clone)]
pub struct BargeInDetector {
    threshold: f32,
    cooldown: Duration,
    last_trigger: Option<Instant>,
}

impl BargeInDetector {
    pub fn new(threshold: f32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            last_trigger: None,
        }
    }

    /// True when playback should be cut for this frame.
    pub fn check(&mut self, rms: f32, is_playing: bool, muted: bool, now: Instant) -> bool {
        if muted || !is_playing || rms <= self.threshold {
            return false;
        }
        if let Some(last) = self.last_trigger {
            if now.saturating_duration_since(last) < self.cooldown {
                return false;
            }
        }
        warn!("Barge-in: speech energy {:.3} over playback", rms);
        self.last_trigger = Some(now);
        true
    }

    pub fn reset(&mut self) {
        self.last_trigger = None;
    }
}
