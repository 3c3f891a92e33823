//! PulseAudio microphone and speaker
//!
//! Both directions use the blocking simple API: 16-bit little-endian mono.
//! The speaker thread renders the mixer one block at a time and lets the
//! blocking write pace the mixer clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use libpulse_binding::def::BufferAttr;
use libpulse_binding::error::{Code, PAErr};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::{DeviceError, DeviceKind};
use crate::mic::{MicProvider, MicSource};
use crate::mixer::Mixer;
use crate::pcm::{self, duration_to_frames, AudioBuffer, INPUT_SAMPLE_RATE};
use crate::playback::{AudioOutput, ChunkId, OutputProvider};

const APP_NAME: &str = "navlive";

/// Map a PulseAudio error code onto the device error categories.
fn classify(kind: DeviceKind, code: i32, message: String) -> DeviceError {
    // Connection errors come back positive, operation errors negative
    match code.abs() {
        c if c == Code::Access as i32 => DeviceError::PermissionDenied(kind),
        c if c == Code::NoEntity as i32 => DeviceError::NotFound(kind),
        c if c == Code::Busy as i32 => DeviceError::InUse(kind),
        _ => DeviceError::other(kind, message),
    }
}

fn pulse_error(kind: DeviceKind, err: PAErr) -> DeviceError {
    classify(kind, err.0, err.to_string())
}

fn mono_spec(rate: u32) -> Spec {
    Spec {
        format: Format::S16le,
        channels: 1,
        rate,
    }
}

/// Default (or named) PulseAudio source at 16 kHz.
#[derive(Debug, Clone, Default)]
pub struct PulseMic {
    pub device: Option<String>,
}

impl MicProvider for PulseMic {
    fn open(&self) -> Result<Box<dyn MicSource>, DeviceError> {
        let simple = Simple::new(
            None,
            APP_NAME,
            Direction::Record,
            self.device.as_deref(),
            "microphone",
            &mono_spec(INPUT_SAMPLE_RATE),
            None,
            None,
        )
        .map_err(|e| pulse_error(DeviceKind::Microphone, e))?;
        info!(
            "Recording from {}",
            self.device.as_deref().unwrap_or("default source")
        );
        Ok(Box::new(PulseSource {
            simple,
            bytes: Vec::new(),
        }))
    }
}

struct PulseSource {
    simple: Simple,
    bytes: Vec<u8>,
}

impl MicSource for PulseSource {
    fn read(&mut self, frame: &mut [f32]) -> Result<(), DeviceError> {
        self.bytes.resize(frame.len() * 2, 0);
        self.simple
            .read(&mut self.bytes)
            .map_err(|e| pulse_error(DeviceKind::Microphone, e))?;
        for (out, pair) in frame.iter_mut().zip(self.bytes.chunks_exact(2)) {
            *out = i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0;
        }
        Ok(())
    }
}

/// Default (or named) PulseAudio sink.
#[derive(Debug, Clone)]
pub struct PulseSpeaker {
    pub sample_rate: u32,
    pub block: Duration,
    pub device: Option<String>,
}

impl OutputProvider for PulseSpeaker {
    fn open(
        &self,
        completions: mpsc::UnboundedSender<ChunkId>,
    ) -> Result<Box<dyn AudioOutput>, DeviceError> {
        let block_frames = duration_to_frames(self.block, self.sample_rate).max(1) as usize;
        let block_bytes = (block_frames * 2) as u32;
        // Two blocks of server-side buffering
        let attr = BufferAttr {
            maxlength: u32::MAX,
            tlength: block_bytes * 2,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: u32::MAX,
        };
        let simple = Simple::new(
            None,
            APP_NAME,
            Direction::Playback,
            self.device.as_deref(),
            "assistant speech",
            &mono_spec(self.sample_rate),
            None,
            Some(&attr),
        )
        .map_err(|e| pulse_error(DeviceKind::Speaker, e))?;

        let mixer = Mixer::new(self.sample_rate, completions);
        let shutdown = Arc::new(AtomicBool::new(false));
        let render_mixer = mixer.clone();
        let render_shutdown = shutdown.clone();
        let handle = thread::Builder::new()
            .name("navlive-speaker".to_string())
            .spawn(move || render_loop(simple, render_mixer, block_frames, render_shutdown))
            .map_err(|e| DeviceError::other(DeviceKind::Speaker, e.to_string()))?;

        info!("Speaker open at {} Hz", self.sample_rate);
        Ok(Box::new(PulseOutput {
            mixer,
            shutdown,
            _handle: handle,
        }))
    }
}

fn render_loop(simple: Simple, mixer: Mixer, block_frames: usize, shutdown: Arc<AtomicBool>) {
    let mut block = vec![0.0f32; block_frames];
    while !shutdown.load(Ordering::Relaxed) {
        mixer.render(&mut block);
        if let Err(e) = simple.write(&pcm::encode(&block)) {
            error!("Speaker write failed: {}", e);
            break;
        }
    }
    if let Err(e) = simple.flush() {
        debug!("Speaker flush failed: {}", e);
    }
    debug!("Speaker thread exiting");
}

struct PulseOutput {
    mixer: Mixer,
    shutdown: Arc<AtomicBool>,
    _handle: thread::JoinHandle<()>,
}

impl AudioOutput for PulseOutput {
    fn now(&self) -> Duration {
        self.mixer.now()
    }

    fn start(&mut self, id: ChunkId, buffer: &AudioBuffer, at: Duration) {
        self.mixer.start(id, buffer, at)
    }

    fn stop(&mut self, id: ChunkId) {
        self.mixer.stop(id)
    }
}

impl Drop for PulseOutput {
    fn drop(&mut self) {
        debug!("Releasing speaker");
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
