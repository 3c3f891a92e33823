//! Transport seam between the session and the model backend

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::{Inbound, Outbound};

/// Close code for a deliberate, clean shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the connection vanished without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake finished; the session may start streaming.
    Open,
    Message(Inbound),
    Error(String),
    Closed { code: u16, reason: String },
}

impl TransportEvent {
    pub fn is_clean_close(&self) -> bool {
        matches!(self, TransportEvent::Closed { code, .. } if *code == NORMAL_CLOSURE)
    }
}

/// Parameters fixed for the lifetime of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub model: String,
    pub system_instruction: String,
    pub voice: Option<String>,
}

/// Delivers transport events tagged with the session generation that owns them.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the session side has gone away.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// An open connection.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, message: Outbound) -> Result<(), TransportError>;

    /// Request a clean close. Any later events still arrive through the sink.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Factory for connections. `connect` returns once the channel exists;
/// [`TransportEvent::Open`] follows when the session handshake completes.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        params: &SessionParams,
        events: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError>;
}
