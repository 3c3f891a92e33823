//! Error taxonomy for the streaming pipeline
//!
//! Device failures abort a single capture attempt, transport failures force a
//! full teardown, and decode failures only ever skip the offending payload.

use std::fmt;

/// Failure to turn a wire payload into playable audio.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM payload of {len} bytes is not a whole number of {frame_bytes}-byte frames")]
    Misaligned { len: usize, frame_bytes: usize },

    #[error("channel count must be non-zero")]
    NoChannels,

    #[error("sample rate must be non-zero")]
    NoSampleRate,
}

/// Which piece of hardware a device error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Microphone,
    Speaker,
    Camera,
    Screen,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Microphone => "microphone",
            DeviceKind::Speaker => "speaker",
            DeviceKind::Camera => "camera",
            DeviceKind::Screen => "screen capture",
        };
        f.write_str(name)
    }
}

/// Device acquisition failures. Fatal to the capture attempt, never to the process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("permission to use the {0} was denied")]
    PermissionDenied(DeviceKind),

    #[error("no {0} was found")]
    NotFound(DeviceKind),

    #[error("the {0} is already in use by another application")]
    InUse(DeviceKind),

    #[error("the {0} cannot satisfy the requested constraints")]
    Overconstrained(DeviceKind),

    #[error("access to the {0} was blocked for security reasons")]
    Security(DeviceKind),

    #[error("{kind} failure: {message}")]
    Other { kind: DeviceKind, message: String },
}

impl DeviceError {
    pub fn other(kind: DeviceKind, message: impl Into<String>) -> Self {
        DeviceError::Other {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceError::PermissionDenied(kind)
            | DeviceError::NotFound(kind)
            | DeviceError::InUse(kind)
            | DeviceError::Overconstrained(kind)
            | DeviceError::Security(kind) => *kind,
            DeviceError::Other { kind, .. } => *kind,
        }
    }

    /// Short guidance a front end can show next to the error.
    pub fn guidance(&self) -> &'static str {
        match self {
            DeviceError::PermissionDenied(_) => "grant access in your system privacy settings and try again",
            DeviceError::NotFound(_) => "connect a device and try again",
            DeviceError::InUse(_) => "close other applications using the device",
            DeviceError::Overconstrained(_) => "try a different device or lower resolution",
            DeviceError::Security(_) => "capture is only available from a trusted context",
            DeviceError::Other { .. } => "check the logs for details",
        }
    }
}

/// Failures of the AI session channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection closed ({code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("timed out waiting for the session handshake")]
    SetupTimeout,

    #[error("channel closed")]
    ChannelClosed,
}

/// Errors surfaced by [`crate::session::SessionHandle`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not ready")]
    NotReady,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("session task has shut down")]
    Shutdown,

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, SessionError>;
