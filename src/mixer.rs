//! Software mixer and output clock
//!
//! Chunks are placed on a timeline measured in output frames. Whoever drives
//! [`Mixer::render`] (a speaker thread, or the wall-clock driver when no
//! speaker is available) advances the clock and retires finished chunks.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::DeviceError;
use crate::pcm::{duration_to_frames, frames_to_duration, AudioBuffer};
use crate::playback::{AudioOutput, ChunkId, OutputProvider};

struct Voice {
    id: ChunkId,
    start: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

struct MixerState {
    sample_rate: u32,
    position: u64,
    voices: Vec<Voice>,
    completions: mpsc::UnboundedSender<ChunkId>,
}

/// Mono mixer shared between the scheduler and the rendering side.
#[derive(Clone)]
pub struct Mixer {
    state: Arc<Mutex<MixerState>>,
}

impl Mixer {
    pub fn new(sample_rate: u32, completions: mpsc::UnboundedSender<ChunkId>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MixerState {
                sample_rate,
                position: 0,
                voices: Vec::new(),
                completions,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MixerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sample_rate(&self) -> u32 {
        self.lock().sample_rate
    }

    /// Frames rendered so far.
    pub fn position(&self) -> u64 {
        self.lock().position
    }

    pub fn active_voices(&self) -> usize {
        self.lock().voices.len()
    }

    /// Mix the next `out.len()` frames and advance the clock.
    pub fn render(&self, out: &mut [f32]) {
        let mut state = self.lock();
        out.fill(0.0);

        let begin = state.position;
        let end = begin + out.len() as u64;

        for voice in &state.voices {
            let from = voice.start.max(begin);
            let to = voice.end().min(end);
            if from >= to {
                continue;
            }
            let src = &voice.samples[(from - voice.start) as usize..(to - voice.start) as usize];
            let dst = &mut out[(from - begin) as usize..(to - begin) as usize];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += *s;
            }
        }
        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        state.position = end;

        let mut finished = Vec::new();
        state.voices.retain(|voice| {
            if voice.end() <= end {
                finished.push(voice.id);
                false
            } else {
                true
            }
        });
        for id in finished {
            // Receiver gone means the session is tearing down
            let _ = state.completions.send(id);
        }
    }
}

impl AudioOutput for Mixer {
    fn now(&self) -> Duration {
        let state = self.lock();
        frames_to_duration(state.position, state.sample_rate)
    }

    fn start(&mut self, id: ChunkId, buffer: &AudioBuffer, at: Duration) {
        let mut state = self.lock();
        let mono = buffer.to_mono();
        let samples = if buffer.sample_rate() == state.sample_rate {
            mono
        } else {
            resample(&mono, buffer.sample_rate(), state.sample_rate)
        };
        let start = duration_to_frames(at, state.sample_rate);
        state.voices.push(Voice { id, start, samples });
    }

    fn stop(&mut self, id: ChunkId) {
        self.lock().voices.retain(|voice| voice.id != id);
    }
}

/// Linear interpolation resampler for the rare chunk at a foreign rate.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() || from_rate == to_rate {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

/// Advance a mixer in real time without any audio device attached.
pub fn spawn_clock(mixer: Mixer, block: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let frames = duration_to_frames(block, mixer.sample_rate()).max(1) as usize;
        let mut scratch = vec![0.0f32; frames];
        let mut ticker = interval(block);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        loop {
            ticker.tick().await;
            mixer.render(&mut scratch);
        }
    })
}

/// A mixer paired with the task that drives its clock.
pub struct ClockedMixer {
    mixer: Mixer,
    driver: JoinHandle<()>,
}

impl AudioOutput for ClockedMixer {
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

impl Drop for ClockedMixer {
    fn drop(&mut self) {
        debug!("Stopping output clock");
        self.driver.abort();
    }
}

/// Output used when no speaker backend is compiled in. Audio is timed and
/// discarded, which keeps the conversation flow intact.
pub struct SilentOutput {
    pub sample_rate: u32,
    pub block: Duration,
}

impl OutputProvider for SilentOutput {
    fn open(
        &self,
        completions: mpsc::UnboundedSender<ChunkId>,
    ) -> Result<Box<dyn AudioOutput>, DeviceError> {
        info!("Opening silent output at {} Hz", self.sample_rate);
        let mixer = Mixer::new(self.sample_rate, completions);
        let driver = spawn_clock(mixer.clone(), self.block);
        Ok(Box::new(ClockedMixer { mixer, driver }))
    }
}
