//! Configuration
//!
//! Settings come from the environment; the binary layers command-line flags
//! on top. Timing constants live in [`Tuning`].

use std::env;
use std::time::Duration;

use crate::frames::SourceKind;
use crate::pcm::OUTPUT_SAMPLE_RATE;

pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";
pub const DEFAULT_VOICE: &str = "Puck";

pub const DEFAULT_INSTRUCTION: &str = "You are a visual assistant for a blind or low-vision user. \
You receive a live camera or screen feed and the user's voice. Describe what matters briefly and \
clearly, answer questions about the scene, and mention hazards with their approximate distance in \
meters.";

pub const NAVIGATION_INSTRUCTION: &str = "Navigation mode is on. The user is walking. Keep every \
reply to one short sentence. Report the nearest obstacle first with its direction and distance in \
meters, for example \"Chair two meters ahead\". Say \"Stop\" first if something is less than one \
meter away. Say \"Clear path\" when nothing is in the way.";

pub const DESCRIBE_PROMPT: &str = "Describe what you see.";
pub const NAVIGATION_PROMPT: &str = "What is ahead of me now?";
pub const NAVIGATION_EXIT_INSTRUCTION: &str = "Navigation mode is off. Go back to normal, \
conversational descriptions.";

/// Timing and threshold constants.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuning {
    /// Delay added ahead of the first chunk after silence.
    pub safety_margin: Duration,
    pub barge_in_threshold: f32,
    pub barge_in_cooldown: Duration,
    /// Samples per microphone frame at 16 kHz.
    pub mic_frame_samples: usize,
    pub output_sample_rate: u32,
    /// Render block for the output clock.
    pub output_block: Duration,
    pub transcript_capacity: usize,
    pub prompt_quiet_period: Duration,
    pub prompt_period: Duration,
    pub initial_prompt_delay: Duration,
    /// Frame interval outside navigation mode.
    pub default_frame_interval: Duration,
    pub jpeg_quality: u8,
    pub max_frame_edge: u32,
    pub setup_timeout: Duration,
    pub close_timeout: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_millis(80),
            barge_in_threshold: 0.04,
            barge_in_cooldown: Duration::from_millis(1000),
            mic_frame_samples: 1600,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            output_block: Duration::from_millis(20),
            transcript_capacity: 50,
            prompt_quiet_period: Duration::from_secs(4),
            prompt_period: Duration::from_secs(8),
            initial_prompt_delay: Duration::from_millis(1500),
            default_frame_interval: Duration::from_millis(2500),
            jpeg_quality: 70,
            max_frame_edge: 1024,
            setup_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub model: String,
    pub voice: String,
    /// Start every session in navigation mode.
    pub navigation: bool,
    pub use_mic: bool,
    pub source: Option<SourceKind>,
    pub tuning: Tuning,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// *   `GEMINI_API_KEY`: required.
    /// *   `NAVLIVE_MODEL`: optional, defaults to the flash live model.
    /// *   `NAVLIVE_VOICE`: optional prebuilt voice name, defaults to "Puck".
    /// *   `NAVLIVE_SOURCE`: optional, "camera", "screen" or "none".
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = env::var("GEMINI_API_KEY")
            .map_err(|_| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;
        let model = env::var("NAVLIVE_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let voice = env::var("NAVLIVE_VOICE").unwrap_or_else(|_| DEFAULT_VOICE.to_string());

        let source = match env::var("NAVLIVE_SOURCE") {
            Ok(value) => parse_source(&value).ok_or_else(|| ConfigError::InvalidValue {
                name: "NAVLIVE_SOURCE".to_string(),
                value,
            })?,
            Err(_) => None,
        };

        Ok(Self {
            api_key,
            model,
            voice,
            navigation: false,
            use_mic: true,
            source,
            tuning: Tuning::default(),
        })
    }

    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            navigation: false,
            use_mic: true,
            source: None,
            tuning: Tuning::default(),
        }
    }

    pub fn instruction(&self, navigation: bool) -> String {
        if navigation {
            format!("{}\n\n{}", DEFAULT_INSTRUCTION, NAVIGATION_INSTRUCTION)
        } else {
            DEFAULT_INSTRUCTION.to_string()
        }
    }
}

/// `Some(None)` is an explicit "no source".
pub fn parse_source(value: &str) -> Option<Option<SourceKind>> {
    match value.trim().to_ascii_lowercase().as_str() {
        "camera" => Some(Some(SourceKind::Camera)),
        "screen" => Some(Some(SourceKind::Screen)),
        "none" | "" => Some(None),
        _ => None,
    }
}
