//! Session lifecycle
//!
//! A single actor task owns the transport, the playback scheduler, the
//! microphone and the frame loop. Callers talk to it through
//! [`SessionHandle`]; every observer reads the same [`SessionSnapshot`]
//! from a `watch` channel.
//!
//! ```text
//! Idle -> Connecting -> Ready -> (Disconnected | Idle)
//! ```
//!
//! Outbound audio, video and text are only sent while Ready.

use std::fmt;
use std::future::pending;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{DeviceError, DeviceKind, Result, SessionError, TransportError};
use crate::feedback::{Feedback, FeedbackFactory, LogFeedback};
use crate::frames::{
    AcceptAll, FrameLoop, FrameOutcome, FrameSettings, QualityCheck, SourceKind, SourceProvider,
};
use crate::mic::{BargeInDetector, MicCapture, MicFrame, MicProvider};
use crate::playback::{AudioOutput, ChunkId, OutputProvider, PlaybackEvent, PlaybackScheduler};
use crate::protocol::{Inbound, Outbound};
use crate::queue::{MessageQueueProcessor, QueueEvent};
use crate::transcript::TranscriptEntry;
use crate::transport::{Connector, EventSink, SessionParams, Transport, TransportEvent};
use crate::urgency::UrgencyLevel;

/// Close code servers use for policy violations such as a bad API key.
const POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Ready,
    Disconnected,
}

/// What the user should be told right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Status {
    #[default]
    Idle,
    Connecting,
    Listening,
    Speaking,
    Interrupted,
    Disconnected,
    Error(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Idle => f.write_str("idle"),
            Status::Connecting => f.write_str("connecting"),
            Status::Listening => f.write_str("listening"),
            Status::Speaking => f.write_str("speaking"),
            Status::Interrupted => f.write_str("interrupted"),
            Status::Disconnected => f.write_str("disconnected"),
            Status::Error(message) => write!(f, "error: {}", message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub status: Status,
    pub muted: bool,
    pub navigation: bool,
    pub urgency: UrgencyLevel,
    pub distance_m: Option<f32>,
    pub transcript_len: usize,
    pub mic_active: bool,
    pub source: Option<SourceKind>,
    /// Increments on every `start`.
    pub generation: u64,
    /// Most recent non-fatal device problem.
    pub last_error: Option<String>,
}

/// External collaborators the session acquires resources from.
#[derive(Clone)]
pub struct Devices {
    pub connector: Arc<dyn Connector>,
    pub output: Arc<dyn OutputProvider>,
    pub mic: Option<Arc<dyn MicProvider>>,
    pub sources: Option<Arc<dyn SourceProvider>>,
    pub quality: Arc<dyn QualityCheck>,
    pub feedback: Arc<dyn FeedbackFactory>,
}

impl Devices {
    pub fn new(connector: Arc<dyn Connector>, output: Arc<dyn OutputProvider>) -> Self {
        Self {
            connector,
            output,
            mic: None,
            sources: None,
            quality: Arc::new(AcceptAll),
            feedback: Arc::new(LogFeedback::factory()),
        }
    }

    pub fn with_mic(mut self, mic: Arc<dyn MicProvider>) -> Self {
        self.mic = Some(mic);
        self
    }

    pub fn with_sources(mut self, sources: Arc<dyn SourceProvider>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn with_quality(mut self, quality: Arc<dyn QualityCheck>) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_feedback(mut self, feedback: Arc<dyn FeedbackFactory>) -> Self {
        self.feedback = feedback;
        self
    }
}

enum Command {
    Start {
        voice: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    SetMuted(bool),
    ToggleMute {
        reply: oneshot::Sender<bool>,
    },
    SetSource {
        kind: Option<SourceKind>,
        reply: oneshot::Sender<std::result::Result<(), DeviceError>>,
    },
    SetNavigation(bool),
    SendText {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Tilt {
        pitch_deg: f32,
        roll_deg: f32,
    },
    Transcript {
        reply: oneshot::Sender<Vec<TranscriptEntry>>,
    },
}

/// Cheap, cloneable front door to the session actor.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Spawn the actor on the current runtime. It runs until every handle is dropped.
    pub fn spawn(config: Config, devices: Devices) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let actor = SessionActor::new(config, devices, commands_rx, snapshot_tx);
        tokio::spawn(actor.run());
        Self {
            commands: commands_tx,
            snapshot: snapshot_rx,
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| SessionError::Shutdown)
    }

    /// Open a new session, replacing any current one. Returns once the
    /// connection is being set up; watch the snapshot for Ready.
    pub async fn start(&self, voice: Option<&str>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start {
            voice: voice.map(str::to_string),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { reply })?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    pub fn set_muted(&self, muted: bool) -> Result<()> {
        self.send(Command::SetMuted(muted))
    }

    /// Flip mute and return the new value.
    pub async fn toggle_mute(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ToggleMute { reply })?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    /// Switch the visual source. `None` stops capture.
    pub async fn set_source(&self, kind: Option<SourceKind>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetSource { kind, reply })?;
        rx.await.map_err(|_| SessionError::Shutdown)??;
        Ok(())
    }

    pub fn set_navigation(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetNavigation(enabled))
    }

    /// Send a typed user turn.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SendText {
            text: text.into(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    pub fn report_tilt(&self, pitch_deg: f32, roll_deg: f32) -> Result<()> {
        self.send(Command::Tilt {
            pitch_deg,
            roll_deg,
        })
    }

    pub async fn transcript(&self) -> Result<Vec<TranscriptEntry>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Transcript { reply })?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the snapshot satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| SessionError::Shutdown)?;
        Ok(snapshot.clone())
    }
}

/// Resources that live exactly as long as one session.
struct Active {
    generation: u64,
    transport: Box<dyn Transport>,
    scheduler: PlaybackScheduler<Box<dyn AudioOutput>>,
    completions: mpsc::UnboundedReceiver<ChunkId>,
    barge_in: BargeInDetector,
    mic: Option<MicCapture>,
    frames: Option<FrameLoop>,
    feedback: Box<dyn Feedback>,
    connect_deadline: Option<Instant>,
    initial_prompt_at: Option<Instant>,
    frames_sent: u64,
}

enum Wake {
    Command(Option<Command>),
    Transport(u64, TransportEvent),
    MicOpened(u64, std::result::Result<MicCapture, DeviceError>),
    ChunkEnded(ChunkId),
    Mic(Option<MicFrame>),
    Frame(Option<FrameOutcome>),
    Deadline,
}

type MicResult = (u64, std::result::Result<MicCapture, DeviceError>);

struct SessionActor {
    config: Config,
    devices: Devices,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    mic_tx: mpsc::UnboundedSender<MicResult>,
    mic_rx: mpsc::UnboundedReceiver<MicResult>,
    snapshot: watch::Sender<SessionSnapshot>,
    state: SessionState,
    status: Status,
    muted: bool,
    source: Option<SourceKind>,
    generation: u64,
    last_error: Option<String>,
    processor: MessageQueueProcessor,
    active: Option<Active>,
}

impl SessionActor {
    fn new(
        config: Config,
        devices: Devices,
        commands: mpsc::UnboundedReceiver<Command>,
        snapshot: watch::Sender<SessionSnapshot>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (mic_tx, mic_rx) = mpsc::unbounded_channel();
        let processor = MessageQueueProcessor::new(&config.tuning);
        let source = config.source;
        Self {
            config,
            devices,
            commands,
            events_tx,
            events_rx,
            mic_tx,
            mic_rx,
            snapshot,
            state: SessionState::Idle,
            status: Status::Idle,
            muted: false,
            source,
            generation: 0,
            last_error: None,
            processor,
            active: None,
        }
    }

    async fn run(mut self) {
        debug!("Session actor started");
        loop {
            match self.next_wake().await {
                Wake::Command(None) => break,
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Transport(generation, event) => self.on_transport_event(generation, event).await,
                Wake::MicOpened(generation, result) => self.on_mic_opened(generation, result),
                Wake::ChunkEnded(id) => {
                    if let Some(active) = self.active.as_mut() {
                        active.scheduler.on_chunk_ended(id);
                    }
                    self.apply_effects().await;
                }
                Wake::Mic(frame) => self.on_mic_frame(frame).await,
                Wake::Frame(outcome) => self.on_frame(outcome).await,
                Wake::Deadline => self.on_deadline().await,
            }
            self.publish();
        }
        self.stop().await;
        debug!("Session actor stopped");
    }

    async fn next_wake(&mut self) -> Wake {
        let deadline = self.next_deadline();
        let (completions, mic, frames) = match self.active.as_mut() {
            Some(active) => (
                Some(&mut active.completions),
                active.mic.as_mut(),
                active.frames.as_mut(),
            ),
            None => (None, None, None),
        };

        tokio::select! {
            command = self.commands.recv() => Wake::Command(command),
            Some((generation, event)) = self.events_rx.recv() => Wake::Transport(generation, event),
            Some((generation, result)) = self.mic_rx.recv() => Wake::MicOpened(generation, result),
            Some(id) = recv_or_pending(completions) => Wake::ChunkEnded(id),
            frame = next_mic_frame(mic) => Wake::Mic(frame),
            outcome = next_frame(frames) => Wake::Frame(outcome),
            _ = sleep_until_or_pending(deadline) => Wake::Deadline,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let active = self.active.as_ref()?;
        let prompt = if self.state == SessionState::Ready {
            self.processor.prompt_deadline()
        } else {
            None
        };
        [active.connect_deadline, active.initial_prompt_at, prompt]
            .into_iter()
            .flatten()
            .min()
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { voice, reply } => {
                let result = self.start(voice).await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::SetMuted(muted) => self.set_muted(muted),
            Command::ToggleMute { reply } => {
                self.set_muted(!self.muted);
                let _ = reply.send(self.muted);
            }
            Command::SetSource { kind, reply } => self.set_source(kind, reply).await,
            Command::SetNavigation(enabled) => {
                self.processor.set_navigation(enabled);
                self.apply_effects().await;
            }
            Command::SendText { text, reply } => {
                let result = if self.state == SessionState::Ready {
                    self.send(Outbound::Text(text)).await
                } else {
                    Err(SessionError::NotReady)
                };
                let failure = match &result {
                    Err(SessionError::Transport(e)) => Some(e.to_string()),
                    _ => None,
                };
                if let Some(message) = failure {
                    self.teardown(SessionState::Disconnected, Status::Error(message)).await;
                }
                let _ = reply.send(result);
            }
            Command::Tilt {
                pitch_deg,
                roll_deg,
            } => {
                if let Some(active) = self.active.as_mut() {
                    active.feedback.tilt(pitch_deg, roll_deg);
                }
            }
            Command::Transcript { reply } => {
                let _ = reply.send(self.processor.transcript().to_vec());
            }
        }
    }

    fn set_muted(&mut self, muted: bool) {
        if self.muted != muted {
            info!("Microphone {}", if muted { "muted" } else { "unmuted" });
            self.muted = muted;
        }
    }

    async fn start(&mut self, voice: Option<String>) -> Result<()> {
        if self.active.is_some() {
            info!("Replacing the open session");
            self.stop().await;
        }

        self.generation += 1;
        let generation = self.generation;
        self.last_error = None;
        self.set_state(SessionState::Connecting, Status::Connecting);
        self.publish();

        let (completions_tx, completions) = mpsc::unbounded_channel();
        let output = match self.devices.output.open(completions_tx) {
            Ok(output) => output,
            Err(e) => {
                error!("Could not open audio output: {}", e);
                self.set_state(SessionState::Idle, Status::Error(e.to_string()));
                return Err(e.into());
            }
        };

        let voice = voice.unwrap_or_else(|| self.config.voice.clone());
        let params = SessionParams {
            model: self.config.model.clone(),
            system_instruction: self.config.instruction(self.config.navigation),
            voice: Some(voice),
        };
        let sink = EventSink::new(generation, self.events_tx.clone());
        let transport = match self.devices.connector.connect(&params, sink).await {
            Ok(transport) => transport,
            Err(e) => {
                error!("Could not connect: {}", e);
                self.set_state(SessionState::Disconnected, Status::Error(e.to_string()));
                return Err(e.into());
            }
        };

        let tuning = &self.config.tuning;
        let mut active = Active {
            generation,
            transport,
            scheduler: PlaybackScheduler::new(output, tuning.safety_margin),
            completions,
            barge_in: BargeInDetector::new(tuning.barge_in_threshold, tuning.barge_in_cooldown),
            mic: None,
            frames: None,
            feedback: self.devices.feedback.create(),
            connect_deadline: Some(Instant::now() + tuning.setup_timeout),
            initial_prompt_at: None,
            frames_sent: 0,
        };

        if let Some(kind) = self.source {
            match self.spawn_frames(kind, None) {
                Ok(frames) => active.frames = Some(frames),
                Err(e) => {
                    warn!("Visual source unavailable: {}", e);
                    self.source = None;
                    self.last_error = Some(e.to_string());
                }
            }
        }

        info!("Session {} connecting", generation);
        self.active = Some(active);
        Ok(())
    }

    /// Graceful shutdown: flip out of Ready, try a clean close, then tear down regardless.
    async fn stop(&mut self) {
        if self.active.is_none() {
            self.set_state(SessionState::Idle, Status::Idle);
            return;
        }

        self.state = SessionState::Idle;
        self.processor.end_session();
        self.publish();

        let close_timeout = self.config.tuning.close_timeout;
        if let Some(active) = self.active.as_mut() {
            active.scheduler.flush();
            match timeout(close_timeout, active.transport.close()).await {
                Ok(Ok(())) => info!("Session {} closed", active.generation),
                Ok(Err(e)) => warn!("Graceful close failed ({}), forcing local cleanup", e),
                Err(_) => warn!("Graceful close timed out, forcing local cleanup"),
            }
        }

        self.teardown(SessionState::Idle, Status::Idle).await;
    }

    /// Release everything the session holds. Safe to call repeatedly.
    async fn teardown(&mut self, state: SessionState, status: Status) {
        self.set_state(state, status);
        self.processor.end_session();

        if let Some(mut active) = self.active.take() {
            if let Some(frames) = active.frames.take() {
                frames.shutdown().await;
            }
            if let Some(mic) = active.mic.take() {
                mic.shutdown().await;
            }
            active.connect_deadline = None;
            active.initial_prompt_at = None;
            active.scheduler.flush();
            debug!("Session {} torn down", active.generation);
        }
        self.publish();
    }

    fn set_state(&mut self, state: SessionState, status: Status) {
        if self.state != state {
            info!("Session state {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.status = status;
    }

    fn spawn_frames(
        &self,
        kind: SourceKind,
        opened: Option<oneshot::Sender<std::result::Result<(), DeviceError>>>,
    ) -> std::result::Result<FrameLoop, DeviceError> {
        let provider = self
            .devices
            .sources
            .clone()
            .ok_or(DeviceError::NotFound(kind.device_kind()))?;
        Ok(FrameLoop::spawn(
            kind,
            provider,
            self.devices.quality.clone(),
            self.snapshot.subscribe(),
            FrameSettings::from(&self.config.tuning),
            opened,
        ))
    }

    async fn set_source(
        &mut self,
        kind: Option<SourceKind>,
        reply: oneshot::Sender<std::result::Result<(), DeviceError>>,
    ) {
        if let Some(active) = self.active.as_mut() {
            if let Some(frames) = active.frames.take() {
                info!("Stopping {} capture", frames.kind());
                frames.shutdown().await;
            }
        }

        let Some(kind) = kind else {
            self.source = None;
            let _ = reply.send(Ok(()));
            return;
        };

        if self.devices.sources.is_none() {
            let e = DeviceError::NotFound(kind.device_kind());
            warn!("Cannot switch to {}: {}", kind, e);
            self.source = None;
            self.last_error = Some(e.to_string());
            let _ = reply.send(Err(e));
            return;
        }

        self.source = Some(kind);
        if self.active.is_none() {
            debug!("{} selected, capture starts with the next session", kind);
            let _ = reply.send(Ok(()));
            return;
        }

        match self.spawn_frames(kind, Some(reply)) {
            Ok(frames) => {
                if let Some(active) = self.active.as_mut() {
                    active.frames = Some(frames);
                }
            }
            Err(e) => warn!("Cannot switch to {}: {}", kind, e),
        }
    }

    async fn on_transport_event(&mut self, generation: u64, event: TransportEvent) {
        let current = self
            .active
            .as_ref()
            .is_some_and(|active| active.generation == generation);
        if !current {
            debug!("Ignoring {:?} from stale session {}", event, generation);
            return;
        }

        if event.is_clean_close() {
            info!("Session closed by server");
            self.teardown(SessionState::Idle, Status::Idle).await;
            return;
        }

        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Message(message) => self.on_inbound(message).await,
            TransportEvent::Error(message) => {
                error!("Transport error: {}", message);
                self.teardown(SessionState::Disconnected, Status::Error(message)).await;
            }
            TransportEvent::Closed { code, reason } => {
                if code == POLICY_VIOLATION {
                    error!("Session rejected by server policy: {}", reason);
                } else {
                    warn!("Connection closed abnormally ({}): {}", code, reason);
                }
                self.teardown(SessionState::Disconnected, Status::Disconnected).await;
            }
        }
    }

    fn on_open(&mut self) {
        if self.state != SessionState::Connecting {
            debug!("Ignoring open while {:?}", self.state);
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.connect_deadline = None;
        let generation = active.generation;

        self.processor.begin_session(self.config.navigation);
        self.set_state(SessionState::Ready, Status::Listening);
        self.publish();
        info!("Session {} ready", generation);

        self.begin_mic_setup(generation);
    }

    fn begin_mic_setup(&mut self, generation: u64) {
        if !self.config.use_mic {
            info!("Microphone disabled by configuration");
            return;
        }
        let Some(provider) = self.devices.mic.clone() else {
            warn!("No microphone backend available, continuing without mic input");
            return;
        };
        let frame_samples = self.config.tuning.mic_frame_samples;
        let tx = self.mic_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = provider
                .open()
                .and_then(|source| MicCapture::spawn(source, frame_samples));
            let _ = tx.send((generation, result));
        });
    }

    fn on_mic_opened(
        &mut self,
        generation: u64,
        result: std::result::Result<MicCapture, DeviceError>,
    ) {
        let ready = self.state == SessionState::Ready;
        let active = self
            .active
            .as_mut()
            .filter(|active| active.generation == generation && ready);
        match (active, result) {
            (Some(active), Ok(capture)) => {
                info!("Microphone live");
                active.mic = Some(capture);
            }
            (Some(_), Err(e)) => {
                warn!(
                    "Microphone unavailable, continuing without mic input: {} ({})",
                    e,
                    e.guidance()
                );
                self.last_error = Some(e.to_string());
            }
            (None, _) => debug!("Discarding microphone opened for a stale session"),
        }
    }

    async fn on_inbound(&mut self, message: Inbound) {
        if self.state != SessionState::Ready {
            debug!("Dropping message received while {:?}", self.state);
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        self.processor.enqueue(message);
        self.processor.drain(&mut active.scheduler);
        self.apply_effects().await;
    }

    /// React to what the scheduler and processor produced, then send the outbox.
    async fn apply_effects(&mut self) {
        if let Some(active) = self.active.as_mut() {
            for event in active.scheduler.drain_events() {
                match event {
                    PlaybackEvent::Idle => {
                        debug!("Playback idle");
                        self.processor.on_playback_idle(Instant::now());
                        if self.status == Status::Speaking {
                            self.status = Status::Listening;
                        }
                    }
                    PlaybackEvent::Underrun { late_by } => debug!("Underrun by {:?}", late_by),
                }
            }

            for event in self.processor.drain_events() {
                match event {
                    QueueEvent::Interrupted => self.status = Status::Interrupted,
                    QueueEvent::Speaking => self.status = Status::Speaking,
                    QueueEvent::TurnComplete => debug!("Turn complete"),
                    QueueEvent::UrgencyChanged { level, distance_m } => {
                        active.feedback.urgency_changed(level, distance_m)
                    }
                    QueueEvent::NavigationChanged(enabled) => {
                        debug!("Navigation changed to {}", enabled)
                    }
                    QueueEvent::GoAway => warn!("Server will end the session soon"),
                }
            }
        }

        for message in self.processor.drain_outbox() {
            if !self.send_or_fail(message).await {
                break;
            }
        }
    }

    async fn send(&mut self, message: Outbound) -> Result<()> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotReady);
        }
        let active = self.active.as_mut().ok_or(SessionError::NotReady)?;
        active.transport.send(message).await?;
        Ok(())
    }

    /// Send, tearing the session down on transport failure. Returns true if sent.
    async fn send_or_fail(&mut self, message: Outbound) -> bool {
        let kind = message.kind();
        match self.send(message).await {
            Ok(()) => true,
            Err(SessionError::NotReady) => {
                debug!("Session not ready, dropping {} message", kind);
                false
            }
            Err(e) => {
                error!("Failed to send {}: {}", kind, e);
                self.teardown(SessionState::Disconnected, Status::Error(e.to_string()))
                    .await;
                false
            }
        }
    }

    async fn on_mic_frame(&mut self, frame: Option<MicFrame>) {
        let Some(frame) = frame else {
            warn!("Microphone stream ended, continuing without mic input");
            if let Some(active) = self.active.as_mut() {
                active.mic = None;
            }
            self.last_error = Some(DeviceError::NotFound(DeviceKind::Microphone).to_string());
            return;
        };
        if self.state != SessionState::Ready {
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let now = Instant::now();
        if active
            .barge_in
            .check(frame.rms, active.scheduler.is_playing(), self.muted, now)
        {
            active.scheduler.flush();
            self.processor.clear_queue();
            self.status = Status::Listening;
        }

        if !self.muted {
            self.send_or_fail(Outbound::audio(&frame.samples)).await;
        }
    }

    async fn on_frame(&mut self, outcome: Option<FrameOutcome>) {
        match outcome {
            None => {
                if let Some(active) = self.active.as_mut() {
                    active.frames = None;
                }
            }
            Some(FrameOutcome::Failed(e)) => {
                warn!("Capture stopped: {} ({})", e, e.guidance());
                self.last_error = Some(e.to_string());
                self.source = None;
                if let Some(active) = self.active.as_mut() {
                    active.frames = None;
                }
            }
            Some(FrameOutcome::Encoded { data, report }) => {
                if report.issue.is_some() {
                    if let Some(active) = self.active.as_mut() {
                        active.feedback.image_issue(&report);
                    }
                }
                if !self.send_or_fail(Outbound::jpeg(data)).await {
                    return;
                }
                self.processor.note_frame_sent();
                let delay = self.config.tuning.initial_prompt_delay;
                if let Some(active) = self.active.as_mut() {
                    active.frames_sent += 1;
                    if active.frames_sent == 1 {
                        active.initial_prompt_at = Some(Instant::now() + delay);
                    }
                }
            }
        }
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();
        let Some(active) = self.active.as_mut() else {
            return;
        };

        if active.connect_deadline.is_some_and(|deadline| deadline <= now) {
            active.connect_deadline = None;
            if self.state == SessionState::Connecting {
                let e = TransportError::SetupTimeout;
                error!("{}", e);
                self.teardown(SessionState::Disconnected, Status::Error(e.to_string()))
                    .await;
                return;
            }
        }

        if active.initial_prompt_at.is_some_and(|at| at <= now) {
            active.initial_prompt_at = None;
            let prompt = self.processor.prompt_text().to_string();
            debug!("Sending initial prompt");
            if !self.send_or_fail(Outbound::Text(prompt)).await {
                return;
            }
        }

        if self.state == SessionState::Ready {
            self.processor.poll_prompt(now);
            self.apply_effects().await;
        }
    }

    fn publish(&self) {
        let (mic_active, source) = match &self.active {
            Some(active) => (
                active.mic.is_some(),
                active.frames.as_ref().map(FrameLoop::kind),
            ),
            None => (false, self.source),
        };
        let snapshot = SessionSnapshot {
            state: self.state,
            status: self.status.clone(),
            muted: self.muted,
            navigation: self.processor.navigation(),
            urgency: self.processor.urgency(),
            distance_m: self.processor.distance_m(),
            transcript_len: self.processor.transcript().len(),
            mic_active,
            source,
            generation: self.generation,
            last_error: self.last_error.clone(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn recv_or_pending<T>(rx: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn next_mic_frame(mic: Option<&mut MicCapture>) -> Option<MicFrame> {
    match mic {
        Some(mic) => mic.next_frame().await,
        None => pending().await,
    }
}

async fn next_frame(frames: Option<&mut FrameLoop>) -> Option<FrameOutcome> {
    match frames {
        Some(frames) => frames.next().await,
        None => pending().await,
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::{mpsc as std_mpsc, Mutex};
    use std::time::Duration;

    use crate::config::{DEFAULT_MODEL, DESCRIBE_PROMPT};
    use crate::feedback::tests::RecordingFeedback;
    use crate::frames::tests::TestProvider;
    use crate::mic::MicSource;
    use crate::pcm;
    use crate::playback::tests::ManualOutput;
    use crate::protocol::{AudioPayload, Role};
    use crate::transport::tests::MemoryConnector;
    use crate::transport::NORMAL_CLOSURE;

    /// Output provider that hands tests the completion channel.
    #[derive(Clone, Default)]
    struct ManualProvider {
        output: ManualOutput,
        completions: Arc<Mutex<Option<mpsc::UnboundedSender<ChunkId>>>>,
    }

    impl ManualProvider {
        fn complete(&self, id: ChunkId) {
            let completions = self.completions.lock().unwrap();
            completions.as_ref().unwrap().send(id).unwrap();
        }

        fn started(&self) -> Vec<ChunkId> {
            let state = self.output.inner.lock().unwrap();
            state.started.iter().map(|(id, _, _)| *id).collect()
        }

        fn stopped(&self) -> Vec<ChunkId> {
            self.output.inner.lock().unwrap().stopped.clone()
        }
    }

    impl OutputProvider for ManualProvider {
        fn open(
            &self,
            completions: mpsc::UnboundedSender<ChunkId>,
        ) -> std::result::Result<Box<dyn AudioOutput>, DeviceError> {
            *self.completions.lock().unwrap() = Some(completions);
            Ok(Box::new(self.output.clone()))
        }
    }

    /// Microphone fed one frame per level pushed by the test.
    struct ChannelMic {
        levels: Mutex<Option<std_mpsc::Receiver<f32>>>,
    }

    struct ChannelSource {
        levels: std_mpsc::Receiver<f32>,
    }

    impl MicSource for ChannelSource {
        fn read(&mut self, frame: &mut [f32]) -> std::result::Result<(), DeviceError> {
            let level = self
                .levels
                .recv()
                .map_err(|_| DeviceError::NotFound(DeviceKind::Microphone))?;
            frame.fill(level);
            Ok(())
        }
    }

    impl MicProvider for ChannelMic {
        fn open(&self) -> std::result::Result<Box<dyn MicSource>, DeviceError> {
            let levels = self
                .levels
                .lock()
                .unwrap()
                .take()
                .ok_or(DeviceError::InUse(DeviceKind::Microphone))?;
            Ok(Box::new(ChannelSource { levels }))
        }
    }

    struct DeniedMic;

    impl MicProvider for DeniedMic {
        fn open(&self) -> std::result::Result<Box<dyn MicSource>, DeviceError> {
            Err(DeviceError::PermissionDenied(DeviceKind::Microphone))
        }
    }

    struct Harness {
        handle: SessionHandle,
        connector: MemoryConnector,
        output: ManualProvider,
        sources: TestProvider,
        feedback: RecordingFeedback,
    }

    impl Harness {
        fn new(config: Config) -> Self {
            Self::build(config, MemoryConnector::auto_open(), TestProvider::default(), None)
        }

        fn build(
            config: Config,
            connector: MemoryConnector,
            sources: TestProvider,
            mic: Option<Arc<dyn MicProvider>>,
        ) -> Self {
            let output = ManualProvider::default();
            let feedback = RecordingFeedback::default();
            let recorder = feedback.clone();
            let mut devices = Devices::new(Arc::new(connector.clone()), Arc::new(output.clone()))
                .with_sources(Arc::new(sources.clone()))
                .with_feedback(Arc::new(move || Box::new(recorder.clone()) as Box<dyn Feedback>));
            if let Some(mic) = mic {
                devices = devices.with_mic(mic);
            }
            Self {
                handle: SessionHandle::spawn(config, devices),
                connector,
                output,
                sources,
                feedback,
            }
        }

        async fn ready(&self) -> SessionSnapshot {
            self.handle.start(None).await.unwrap();
            self.handle
                .wait_for(|s| s.state == SessionState::Ready)
                .await
                .unwrap()
        }

        fn emit(&self, message: Inbound) {
            self.connector.emit(TransportEvent::Message(message));
        }

        fn sent_kinds(&self) -> Vec<&'static str> {
            self.connector.sent().iter().map(Outbound::kind).collect()
        }
    }

    fn config() -> Config {
        let mut config = Config::with_api_key("test-key");
        config.use_mic = false;
        config
    }

    fn speech(ms: u64) -> Inbound {
        let samples = vec![0.1f32; (24 * ms) as usize];
        Inbound::Audio(AudioPayload {
            data: pcm::encode_base64(&samples),
            sample_rate: 24_000,
        })
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reaches_ready() {
        let h = Harness::new(config());
        h.handle.start(Some("Kore")).await.unwrap();
        let snapshot = h
            .handle
            .wait_for(|s| s.state == SessionState::Ready)
            .await
            .unwrap();
        assert_eq!(snapshot.status, Status::Listening);
        assert_eq!(snapshot.generation, 1);

        let params = h.connector.state.lock().unwrap().connects[0].clone();
        assert_eq!(params.voice.as_deref(), Some("Kore"));
        assert_eq!(params.model, DEFAULT_MODEL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speech_then_interruption() {
        let h = Harness::new(config());
        h.ready().await;

        h.emit(speech(500));
        h.emit(speech(500));
        h.handle
            .wait_for(|s| s.status == Status::Speaking)
            .await
            .unwrap();
        eventually(|| h.output.started().len() == 2).await;

        h.emit(Inbound::Interruption);
        h.handle
            .wait_for(|s| s.status == Status::Interrupted)
            .await
            .unwrap();
        let mut stopped = h.output.stopped();
        stopped.sort();
        assert_eq!(stopped, h.output.started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_idle_returns_to_listening() {
        let h = Harness::new(config());
        h.ready().await;

        h.emit(speech(200));
        h.handle
            .wait_for(|s| s.status == Status::Speaking)
            .await
            .unwrap();
        eventually(|| h.output.started().len() == 1).await;

        // Unknown ids change nothing
        h.output.complete(99);
        h.output.complete(h.output.started()[0]);
        h.handle
            .wait_for(|s| s.status == Status::Listening)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_before_open_are_dropped() {
        let h = Harness::build(config(), MemoryConnector::default(), TestProvider::default(), None);
        h.handle.start(None).await.unwrap();
        assert_eq!(h.handle.snapshot().state, SessionState::Connecting);

        h.emit(Inbound::Transcript {
            role: Role::Assistant,
            text: "too early".to_string(),
        });
        h.connector.emit(TransportEvent::Open);
        h.handle
            .wait_for(|s| s.state == SessionState::Ready)
            .await
            .unwrap();
        assert!(h.handle.transcript().await.unwrap().is_empty());

        h.emit(Inbound::Transcript {
            role: Role::Assistant,
            text: "A door on your left.".to_string(),
        });
        h.handle.wait_for(|s| s.transcript_len == 1).await.unwrap();
        let transcript = h.handle.transcript().await.unwrap();
        assert_eq!(transcript[0].text, "A door on your left.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_timeout_disconnects() {
        let h = Harness::build(config(), MemoryConnector::default(), TestProvider::default(), None);
        h.handle.start(None).await.unwrap();
        let snapshot = h
            .handle
            .wait_for(|s| s.state == SessionState::Disconnected)
            .await
            .unwrap();
        assert_eq!(
            snapshot.status,
            Status::Error(TransportError::SetupTimeout.to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_reports_error() {
        let h = Harness::new(config());
        h.connector.state.lock().unwrap().fail_next = true;
        let result = h.handle.start(None).await;
        assert!(matches!(result, Err(SessionError::Transport(_))));
        assert_eq!(h.handle.snapshot().state, SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_and_blocks_sends() {
        let h = Harness::new(config());
        h.ready().await;
        h.handle.send_text("hello").await.unwrap();

        h.handle.stop().await.unwrap();
        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(snapshot.status, Status::Idle);
        assert_eq!(h.connector.state.lock().unwrap().closes, 1);

        assert!(matches!(
            h.handle.send_text("anyone there?").await,
            Err(SessionError::NotReady)
        ));
        assert_eq!(h.sent_kinds(), vec!["text"]);

        // Stopping twice is harmless
        h.handle.stop().await.unwrap();
        assert_eq!(h.connector.state.lock().unwrap().closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_session() {
        let mut config = config();
        config.source = Some(SourceKind::Screen);
        let h = Harness::new(config);
        h.ready().await;
        eventually(|| h.sources.opens.load(Ordering::SeqCst) == 1).await;

        h.handle.start(None).await.unwrap();
        let snapshot = h
            .handle
            .wait_for(|s| s.state == SessionState::Ready && s.generation == 2)
            .await
            .unwrap();
        assert_eq!(snapshot.source, Some(SourceKind::Screen));
        assert_eq!(h.connector.connects(), 2);
        assert_eq!(h.connector.state.lock().unwrap().closes, 1);
        eventually(|| h.sources.opens.load(Ordering::SeqCst) == 2).await;

        // A late failure from the first connection is ignored
        let first = h.connector.state.lock().unwrap().sinks[0].clone();
        first.emit(TransportEvent::Closed {
            code: 1006,
            reason: "gone".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.handle.snapshot().state, SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_then_clean_close() {
        let h = Harness::new(config());
        h.ready().await;

        h.connector.emit(TransportEvent::Error("boom".to_string()));
        let snapshot = h
            .handle
            .wait_for(|s| s.state == SessionState::Disconnected)
            .await
            .unwrap();
        assert_eq!(snapshot.status, Status::Error("boom".to_string()));

        h.ready().await;
        h.connector.emit(TransportEvent::Closed {
            code: NORMAL_CLOSURE,
            reason: String::new(),
        });
        let snapshot = h
            .handle
            .wait_for(|s| s.state == SessionState::Idle)
            .await
            .unwrap();
        assert_eq!(snapshot.status, Status::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_sent_then_prompted() {
        let mut config = config();
        config.source = Some(SourceKind::Screen);
        let h = Harness::new(config);
        h.ready().await;

        eventually(|| h.sent_kinds().contains(&"video")).await;
        eventually(|| {
            h.connector
                .sent()
                .contains(&Outbound::Text(DESCRIBE_PROMPT.to_string()))
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_source_keeps_session() {
        let sources = TestProvider {
            deny: true,
            ..TestProvider::default()
        };
        let h = Harness::build(config(), MemoryConnector::auto_open(), sources, None);
        h.ready().await;

        let result = h.handle.set_source(Some(SourceKind::Camera)).await;
        assert!(matches!(
            result,
            Err(SessionError::Device(DeviceError::PermissionDenied(DeviceKind::Camera)))
        ));
        let snapshot = h
            .handle
            .wait_for(|s| s.last_error.is_some())
            .await
            .unwrap();
        assert_eq!(snapshot.state, SessionState::Ready);
        assert_eq!(snapshot.source, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_urgency_reaches_snapshot_and_feedback() {
        let h = Harness::new(config());
        h.ready().await;

        h.emit(Inbound::Transcript {
            role: Role::Assistant,
            text: "Pole about 1.5 meters ahead.".to_string(),
        });
        let snapshot = h
            .handle
            .wait_for(|s| s.urgency == UrgencyLevel::High)
            .await
            .unwrap();
        assert_eq!(snapshot.distance_m, Some(1.5));

        h.handle.report_tilt(50.0, 0.0).unwrap();
        eventually(|| h.feedback.calls.lock().unwrap().len() == 2).await;
        let calls = h.feedback.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["urgency:high".to_string(), "tilt:50".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spoken_navigation_request() {
        let h = Harness::new(config());
        h.ready().await;

        h.emit(Inbound::Transcript {
            role: Role::User,
            text: "please start navigation".to_string(),
        });
        h.handle.wait_for(|s| s.navigation).await.unwrap();
        eventually(|| h.sent_kinds() == vec!["text"]).await;
    }

    #[tokio::test]
    async fn test_barge_in_flushes_playback() {
        let (levels, rx) = std_mpsc::channel();
        let mic = ChannelMic {
            levels: Mutex::new(Some(rx)),
        };
        let mut config = config();
        config.use_mic = true;
        let h = Harness::build(
            config,
            MemoryConnector::auto_open(),
            TestProvider::default(),
            Some(Arc::new(mic)),
        );
        h.ready().await;
        h.handle.wait_for(|s| s.mic_active).await.unwrap();

        h.emit(speech(5000));
        h.handle
            .wait_for(|s| s.status == Status::Speaking)
            .await
            .unwrap();

        levels.send(0.5).unwrap();
        h.handle
            .wait_for(|s| s.status == Status::Listening)
            .await
            .unwrap();
        assert_eq!(h.output.stopped(), h.output.started());
        eventually(|| h.sent_kinds().contains(&"audio")).await;
    }

    #[tokio::test]
    async fn test_muted_mic_sends_nothing() {
        let (levels, rx) = std_mpsc::channel();
        let mic = ChannelMic {
            levels: Mutex::new(Some(rx)),
        };
        let mut config = config();
        config.use_mic = true;
        let h = Harness::build(
            config,
            MemoryConnector::auto_open(),
            TestProvider::default(),
            Some(Arc::new(mic)),
        );
        h.ready().await;
        h.handle.wait_for(|s| s.mic_active).await.unwrap();
        assert!(h.handle.toggle_mute().await.unwrap());

        for _ in 0..3 {
            levels.send(0.5).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!h.sent_kinds().contains(&"audio"));

        assert!(!h.handle.toggle_mute().await.unwrap());
        levels.send(0.2).unwrap();
        eventually(|| h.sent_kinds().contains(&"audio")).await;
    }

    #[tokio::test]
    async fn test_mic_failure_is_not_fatal() {
        let mut config = config();
        config.use_mic = true;
        let h = Harness::build(
            config,
            MemoryConnector::auto_open(),
            TestProvider::default(),
            Some(Arc::new(DeniedMic)),
        );
        h.ready().await;
        let snapshot = h
            .handle
            .wait_for(|s| s.last_error.is_some())
            .await
            .unwrap();
        assert_eq!(snapshot.state, SessionState::Ready);
        assert!(!snapshot.mic_active);
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_actor() {
        let h = Harness::new(config());
        h.ready().await;
        let connector = h.connector.clone();
        drop(h);
        eventually(|| connector.state.lock().unwrap().closes == 1).await;
    }
}
