//! Inbound message processing
//!
//! Messages from the model are handled strictly one at a time in arrival
//! order. The processor owns the transcript, the urgency estimate and the
//! idle-then-periodic prompt timer; anything it wants sent goes into an
//! outbox the session drains.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{
    Tuning, DESCRIBE_PROMPT, NAVIGATION_EXIT_INSTRUCTION, NAVIGATION_INSTRUCTION, NAVIGATION_PROMPT,
};
use crate::pcm;
use crate::playback::{AudioOutput, PlaybackScheduler};
use crate::protocol::{AudioPayload, Inbound, Outbound, Role};
use crate::transcript::Transcript;
use crate::urgency::{self, NavigationTrigger, UrgencyLevel};

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// The server cut the model off; playback was flushed.
    Interrupted,
    /// Audio started after a silence.
    Speaking,
    TurnComplete,
    UrgencyChanged {
        level: UrgencyLevel,
        distance_m: Option<f32>,
    },
    NavigationChanged(bool),
    GoAway,
}

/// Quiet period after playback goes idle, then a fixed period until cancelled.
#[derive(Debug, Clone)]
pub struct PromptTimer {
    quiet: Duration,
    period: Duration,
    deadline: Option<Instant>,
}

impl PromptTimer {
    pub fn new(quiet: Duration, period: Duration) -> Self {
        Self {
            quiet,
            period,
            deadline: None,
        }
    }

    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.quiet);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True when a prompt is due. Re-arms for the next period.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = Some(now + self.period);
                true
            }
            _ => false,
        }
    }
}

pub struct MessageQueueProcessor {
    queue: VecDeque<Inbound>,
    transcript: Transcript,
    urgency: UrgencyLevel,
    distance_m: Option<f32>,
    /// Offset into the open assistant entry already used for urgency.
    assessed: usize,
    navigation: bool,
    frame_sent: bool,
    interrupted: bool,
    prompt: PromptTimer,
    outbox: Vec<Outbound>,
    events: Vec<QueueEvent>,
}

impl MessageQueueProcessor {
    pub fn new(tuning: &Tuning) -> Self {
        Self {
            queue: VecDeque::new(),
            transcript: Transcript::new(tuning.transcript_capacity),
            urgency: UrgencyLevel::default(),
            distance_m: None,
            assessed: 0,
            navigation: false,
            frame_sent: false,
            interrupted: false,
            prompt: PromptTimer::new(tuning.prompt_quiet_period, tuning.prompt_period),
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Fresh state for a newly opened session.
    pub fn begin_session(&mut self, navigation: bool) {
        self.queue.clear();
        self.transcript.clear();
        self.urgency = UrgencyLevel::default();
        self.distance_m = None;
        self.assessed = 0;
        self.navigation = navigation;
        self.frame_sent = false;
        self.interrupted = false;
        self.prompt.cancel();
        self.outbox.clear();
        self.events.clear();
    }

    /// Drop pending work when the session leaves Ready. The transcript survives.
    pub fn end_session(&mut self) {
        self.queue.clear();
        self.prompt.cancel();
        self.outbox.clear();
        self.transcript.seal();
    }

    pub fn enqueue(&mut self, message: Inbound) {
        self.queue.push_back(message);
    }

    /// Process everything queued, in order.
    pub fn drain<O: AudioOutput>(&mut self, scheduler: &mut PlaybackScheduler<O>) {
        while let Some(message) = self.queue.pop_front() {
            self.process(message, scheduler);
        }
    }

    fn process<O: AudioOutput>(&mut self, message: Inbound, scheduler: &mut PlaybackScheduler<O>) {
        match message {
            Inbound::Interruption => {
                info!("Model interrupted, flushing playback");
                scheduler.flush();
                let dropped = self.queue.len();
                self.queue.clear();
                if dropped > 0 {
                    debug!("Discarded {} stale messages", dropped);
                }
                self.prompt.cancel();
                self.transcript.seal();
                self.interrupted = true;
                self.events.push(QueueEvent::Interrupted);
            }
            Inbound::Transcript { role, text } => self.handle_transcript(role, &text),
            Inbound::Audio(payload) => self.handle_audio(payload, scheduler),
            Inbound::TurnComplete => {
                self.transcript.seal();
                self.events.push(QueueEvent::TurnComplete);
            }
            Inbound::GoAway => {
                warn!("Server announced it will close the session");
                self.events.push(QueueEvent::GoAway);
            }
            Inbound::SetupComplete => debug!("Ignoring setup complete inside an open session"),
        }
    }

    fn handle_transcript(&mut self, role: Role, text: &str) {
        let continues = self.transcript.continues(role);
        let entry = self.transcript.push(role, text);
        let full = entry.text.clone();
        debug!("{:?}: {}", role, full);

        match role {
            Role::User => match urgency::navigation_trigger(text) {
                Some(NavigationTrigger::Enter) if !self.navigation => self.set_navigation(true),
                Some(NavigationTrigger::Exit) if self.navigation => self.set_navigation(false),
                _ => {}
            },
            Role::Assistant => {
                // Re-scan only what arrived since the last match so a split
                // "four" + "feet" still joins up
                let start = if continues { self.assessed.min(full.len()) } else { 0 };
                let assessment = urgency::assess(&full[start..]);
                if assessment.urgency.is_none() {
                    self.assessed = start;
                    return;
                }
                self.assessed = start + assessment.consumed;

                if let Some(distance) = assessment.distance_m {
                    self.distance_m = Some(distance);
                }
                if let Some(level) = assessment.urgency {
                    if level != self.urgency {
                        info!("Urgency {} -> {} ({:?} m)", self.urgency, level, self.distance_m);
                        self.urgency = level;
                        self.events.push(QueueEvent::UrgencyChanged {
                            level,
                            distance_m: self.distance_m,
                        });
                    }
                }
            }
        }
    }

    fn handle_audio<O: AudioOutput>(&mut self, payload: AudioPayload, scheduler: &mut PlaybackScheduler<O>) {
        let buffer = match pcm::decode_audio(&payload.data, payload.sample_rate, 1) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!("Skipping undecodable audio chunk: {}", e);
                return;
            }
        };

        let was_playing = scheduler.is_playing();
        if let Some(chunk) = scheduler.schedule_chunk(&buffer) {
            debug!("Scheduled chunk {} at {:?} for {:?}", chunk.id, chunk.start, chunk.duration);
            self.prompt.cancel();
            self.interrupted = false;
            if !was_playing {
                self.events.push(QueueEvent::Speaking);
            }
        }
    }

    /// Toggle navigation mode and tell the model.
    pub fn set_navigation(&mut self, enabled: bool) {
        if self.navigation == enabled {
            return;
        }
        info!("Navigation mode {}", if enabled { "on" } else { "off" });
        self.navigation = enabled;
        let instruction = if enabled {
            NAVIGATION_INSTRUCTION
        } else {
            NAVIGATION_EXIT_INSTRUCTION
        };
        self.outbox.push(Outbound::Text(instruction.to_string()));
        self.events.push(QueueEvent::NavigationChanged(enabled));
    }

    /// Barge-in path: forget anything not yet processed.
    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// Playback went quiet; start the prompt countdown if the model has
    /// something to look at.
    pub fn on_playback_idle(&mut self, now: Instant) {
        if self.frame_sent {
            self.prompt.arm(now);
        }
    }

    pub fn note_frame_sent(&mut self) {
        self.frame_sent = true;
    }

    /// Queue a prompt if the timer is due.
    pub fn poll_prompt(&mut self, now: Instant) {
        if !self.frame_sent {
            self.prompt.cancel();
            return;
        }
        if self.prompt.fire(now) {
            debug!("Prompt timer fired");
            self.outbox.push(Outbound::Text(self.prompt_text().to_string()));
        }
    }

    pub fn prompt_text(&self) -> &'static str {
        if self.navigation {
            NAVIGATION_PROMPT
        } else {
            DESCRIBE_PROMPT
        }
    }

    pub fn prompt_deadline(&self) -> Option<Instant> {
        self.prompt.deadline()
    }

    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_events(&mut self) -> Vec<QueueEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn urgency(&self) -> UrgencyLevel {
        self.urgency
    }

    pub fn distance_m(&self) -> Option<f32> {
        self.distance_m
    }

    pub fn navigation(&self) -> bool {
        self.navigation
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::tests::ManualOutput;

    fn setup() -> (MessageQueueProcessor, PlaybackScheduler<ManualOutput>, ManualOutput) {
        let tuning = Tuning::default();
        let output = ManualOutput::default();
        let scheduler = PlaybackScheduler::new(output.clone(), tuning.safety_margin);
        (MessageQueueProcessor::new(&tuning), scheduler, output)
    }

    fn audio(ms: usize) -> Inbound {
        Inbound::Audio(AudioPayload {
            data: pcm::encode_base64(&vec![0.2; 24 * ms]),
            sample_rate: 24_000,
        })
    }

    fn assistant(text: &str) -> Inbound {
        Inbound::Transcript {
            role: Role::Assistant,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_audio_is_scheduled_in_order() {
        let (mut processor, mut scheduler, output) = setup();
        processor.enqueue(audio(100));
        processor.enqueue(audio(200));
        processor.drain(&mut scheduler);

        let started = output.inner.lock().unwrap().started.clone();
        assert_eq!(started.len(), 2);
        assert_eq!(started[1].1, started[0].1 + started[0].2);
        assert_eq!(processor.drain_events(), vec![QueueEvent::Speaking]);
    }

    #[test]
    fn test_interruption_flushes_and_drops_queue() {
        let (mut processor, mut scheduler, output) = setup();
        processor.enqueue(audio(100));
        processor.enqueue(Inbound::Interruption);
        processor.enqueue(audio(100));
        processor.enqueue(assistant("stale"));
        processor.drain(&mut scheduler);

        assert!(!scheduler.is_playing());
        assert_eq!(scheduler.in_flight(), 0);
        assert_eq!(processor.pending(), 0);
        assert!(processor.interrupted());
        assert!(processor.transcript().is_empty());

        let state = output.inner.lock().unwrap();
        assert_eq!(state.started.len(), 1);
        assert_eq!(state.stopped, vec![0]);
    }

    #[test]
    fn test_malformed_audio_is_skipped() {
        let (mut processor, mut scheduler, _output) = setup();
        processor.enqueue(Inbound::Audio(AudioPayload {
            data: "***".to_string(),
            sample_rate: 24_000,
        }));
        processor.enqueue(audio(50));
        processor.drain(&mut scheduler);

        assert_eq!(scheduler.in_flight(), 1);
    }

    #[test]
    fn test_urgency_follows_assistant_text() {
        let (mut processor, mut scheduler, _output) = setup();

        processor.enqueue(assistant("Chair two meters ahead."));
        processor.enqueue(Inbound::TurnComplete);
        processor.drain(&mut scheduler);
        assert_eq!(processor.urgency(), UrgencyLevel::Medium);
        assert_eq!(processor.distance_m(), Some(2.0));

        // No distance: urgency stays where it was
        processor.enqueue(assistant("It is a wooden chair."));
        processor.enqueue(Inbound::TurnComplete);
        processor.drain(&mut scheduler);
        assert_eq!(processor.urgency(), UrgencyLevel::Medium);

        processor.enqueue(assistant("Stop."));
        processor.drain(&mut scheduler);
        assert_eq!(processor.urgency(), UrgencyLevel::Critical);

        let changes: Vec<_> = processor
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, QueueEvent::UrgencyChanged { .. }))
            .collect();
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_streamed_fragments_parse_as_one_sentence() {
        let (mut processor, mut scheduler, _output) = setup();
        processor.enqueue(assistant("Obstacle right."));
        processor.enqueue(assistant("Four"));
        processor.enqueue(assistant("feet"));
        processor.drain(&mut scheduler);

        assert_eq!(processor.urgency(), UrgencyLevel::High);
        assert_eq!(processor.transcript().len(), 1);
    }

    #[test]
    fn test_nearer_hazard_later_in_turn_raises_urgency() {
        let (mut processor, mut scheduler, _output) = setup();
        processor.enqueue(assistant("Door five meters ahead."));
        processor.drain(&mut scheduler);
        assert_eq!(processor.urgency(), UrgencyLevel::Low);

        processor.enqueue(assistant("Now a wall, half meter in front."));
        processor.drain(&mut scheduler);
        assert_eq!(processor.urgency(), UrgencyLevel::Critical);
        assert_eq!(processor.distance_m(), Some(0.5));
        assert_eq!(processor.transcript().len(), 1);

        processor.enqueue(assistant("Bench three"));
        processor.enqueue(assistant("meters to the right."));
        processor.drain(&mut scheduler);
        assert_eq!(processor.urgency(), UrgencyLevel::Low);
        assert_eq!(processor.distance_m(), Some(3.0));
    }

    #[test]
    fn test_user_can_toggle_navigation() {
        let (mut processor, mut scheduler, _output) = setup();
        processor.enqueue(Inbound::Transcript {
            role: Role::User,
            text: "start navigation please".to_string(),
        });
        processor.drain(&mut scheduler);
        assert!(processor.navigation());
        assert_eq!(
            processor.drain_outbox(),
            vec![Outbound::Text(NAVIGATION_INSTRUCTION.to_string())]
        );
        assert_eq!(processor.prompt_text(), NAVIGATION_PROMPT);

        processor.enqueue(Inbound::TurnComplete);
        processor.enqueue(Inbound::Transcript {
            role: Role::User,
            text: "stop navigation".to_string(),
        });
        processor.drain(&mut scheduler);
        assert!(!processor.navigation());
        // "stop" from the user is not a hazard call
        assert_eq!(processor.urgency(), UrgencyLevel::Low);
    }

    #[test]
    fn test_prompt_timer_idle_then_periodic() {
        let (mut processor, _scheduler, _output) = setup();
        let t0 = Instant::now();

        // No frame yet: idle does not arm the timer
        processor.on_playback_idle(t0);
        assert_eq!(processor.prompt_deadline(), None);

        processor.note_frame_sent();
        processor.on_playback_idle(t0);
        assert_eq!(processor.prompt_deadline(), Some(t0 + Duration::from_secs(4)));

        processor.poll_prompt(t0 + Duration::from_secs(3));
        assert!(processor.drain_outbox().is_empty());

        processor.poll_prompt(t0 + Duration::from_secs(4));
        assert_eq!(
            processor.drain_outbox(),
            vec![Outbound::Text(DESCRIBE_PROMPT.to_string())]
        );
        assert_eq!(processor.prompt_deadline(), Some(t0 + Duration::from_secs(12)));

        processor.poll_prompt(t0 + Duration::from_secs(12));
        assert_eq!(processor.drain_outbox().len(), 1);
    }

    #[test]
    fn test_speech_cancels_prompt_timer() {
        let (mut processor, mut scheduler, _output) = setup();
        processor.note_frame_sent();
        processor.on_playback_idle(Instant::now());
        assert!(processor.prompt_deadline().is_some());

        processor.enqueue(audio(100));
        processor.drain(&mut scheduler);
        assert_eq!(processor.prompt_deadline(), None);
    }

    #[test]
    fn test_end_session_cancels_timer_keeps_transcript() {
        let (mut processor, mut scheduler, _output) = setup();
        processor.note_frame_sent();
        processor.enqueue(assistant("hello"));
        processor.drain(&mut scheduler);
        processor.on_playback_idle(Instant::now());

        processor.end_session();
        assert_eq!(processor.prompt_deadline(), None);
        assert_eq!(processor.transcript().len(), 1);

        processor.begin_session(false);
        assert!(processor.transcript().is_empty());
        assert_eq!(processor.urgency(), UrgencyLevel::Low);
    }
}
