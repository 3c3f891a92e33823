//! Gapless playback scheduling
//!
//! The scheduler lines decoded chunks up back to back on an output clock.
//! Each chunk starts exactly where the previous one ends; when the clock has
//! already passed that point the chunk is pushed to `now + safety_margin`
//! and the gap is reported as an underrun.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::DeviceError;
use crate::pcm::AudioBuffer;

/// Identifies a scheduled chunk for its whole lifetime.
pub type ChunkId = u64;

/// A monotonically advancing audio clock that can play buffers at given times.
///
/// Completion of a started chunk is reported out of band, through the channel
/// handed to [`OutputProvider::open`].
pub trait AudioOutput: Send {
    /// Current position of the output clock.
    fn now(&self) -> Duration;
    /// Play `buffer` starting at clock time `at`.
    fn start(&mut self, id: ChunkId, buffer: &AudioBuffer, at: Duration);
    /// Stop a chunk immediately. Stopped chunks do not report completion.
    fn stop(&mut self, id: ChunkId);
}

impl<T: AudioOutput + ?Sized> AudioOutput for Box<T> {
    fn now(&self) -> Duration {
        (**self).now()
    }

    fn start(&mut self, id: ChunkId, buffer: &AudioBuffer, at: Duration) {
        (**self).start(id, buffer, at)
    }

    fn stop(&mut self, id: ChunkId) {
        (**self).stop(id)
    }
}

/// Opens an output for one session. Finished chunk ids go to `completions`.
pub trait OutputProvider: Send + Sync {
    fn open(
        &self,
        completions: mpsc::UnboundedSender<ChunkId>,
    ) -> Result<Box<dyn AudioOutput>, DeviceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The last in-flight chunk finished naturally.
    Idle,
    /// A chunk arrived after the clock had passed its slot.
    Underrun { late_by: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledChunk {
    pub id: ChunkId,
    pub start: Duration,
    pub duration: Duration,
}

impl ScheduledChunk {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

pub struct PlaybackScheduler<O: AudioOutput> {
    output: O,
    safety_margin: Duration,
    next_start_time: Duration,
    in_flight: BTreeMap<ChunkId, ScheduledChunk>,
    next_id: ChunkId,
    is_playing: bool,
    underruns: u64,
    events: Vec<PlaybackEvent>,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O, safety_margin: Duration) -> Self {
        let next_start_time = output.now();
        Self {
            output,
            safety_margin,
            next_start_time,
            in_flight: BTreeMap::new(),
            next_id: 0,
            is_playing: false,
            underruns: 0,
            events: Vec::new(),
        }
    }

    /// Queue a buffer directly after whatever is already scheduled.
    ///
    /// Empty buffers are dropped and return `None`.
    pub fn schedule_chunk(&mut self, buffer: &AudioBuffer) -> Option<ScheduledChunk> {
        if buffer.is_empty() {
            debug!("Skipping empty audio chunk");
            return None;
        }

        let now = self.output.now();
        if !self.is_playing {
            self.next_start_time = self.next_start_time.max(now + self.safety_margin);
        } else if self.next_start_time < now {
            let late_by = now - self.next_start_time;
            self.underruns += 1;
            warn!("Playback underrun: chunk arrived {:?} late", late_by);
            self.events.push(PlaybackEvent::Underrun { late_by });
            self.next_start_time = now + self.safety_margin;
        }

        let chunk = ScheduledChunk {
            id: self.next_id,
            start: self.next_start_time,
            duration: buffer.duration(),
        };
        self.next_id += 1;

        self.output.start(chunk.id, buffer, chunk.start);
        self.next_start_time = chunk.end();
        self.in_flight.insert(chunk.id, chunk);
        self.is_playing = true;
        Some(chunk)
    }

    /// Record natural completion of a chunk. Unknown ids are ignored.
    pub fn on_chunk_ended(&mut self, id: ChunkId) {
        if self.in_flight.remove(&id).is_none() {
            return;
        }
        if self.in_flight.is_empty() {
            self.is_playing = false;
            self.events.push(PlaybackEvent::Idle);
        }
    }

    /// Stop everything immediately. Safe to call repeatedly.
    pub fn flush(&mut self) {
        let ids: Vec<ChunkId> = self.in_flight.keys().copied().collect();
        for id in &ids {
            self.output.stop(*id);
        }
        if !ids.is_empty() {
            debug!("Flushed {} scheduled chunks", ids.len());
        }
        self.in_flight.clear();
        self.is_playing = false;
        self.next_start_time = self.output.now();
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn next_start_time(&self) -> Duration {
        self.next_start_time
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    pub fn now(&self) -> Duration {
        self.output.now()
    }

    /// Take the events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<PlaybackEvent> {
        std::mem::take(&mut self.events)
    }
}
