//! navlive: a live, spoken assistant for blind and low-vision users.
//!
//! Microphone audio and camera or screen frames stream to a Gemini Live
//! session; the model's speech is scheduled gaplessly on a local output
//! clock, and distances it mentions drive urgency alerts and frame cadence
//! while navigating.

pub mod config;
pub mod devices;
pub mod error;
pub mod feedback;
pub mod frames;
pub mod gemini;
pub mod mic;
pub mod mixer;
pub mod pcm;
pub mod playback;
pub mod protocol;
pub mod queue;
pub mod reconnect;
pub mod session;
pub mod transcript;
pub mod transport;
pub mod urgency;

pub use config::Config;
pub use error::{Result, SessionError};
pub use session::{Devices, SessionHandle, SessionSnapshot, SessionState, Status};
