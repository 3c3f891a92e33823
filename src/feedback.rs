//! Non-visual feedback hooks
//!
//! Haptics, audio cues and orientation hints live outside the core. The
//! session creates one [`Feedback`] per session and drops it on teardown, so
//! nothing persists between sessions.

use tracing::{info, warn};

use crate::frames::QualityReport;
use crate::urgency::UrgencyLevel;

/// Pitch beyond which the device is considered pointed at the floor or sky.
const TILT_LIMIT_DEG: f32 = 35.0;

pub trait Feedback: Send {
    fn urgency_changed(&mut self, level: UrgencyLevel, distance_m: Option<f32>);

    fn image_issue(&mut self, report: &QualityReport);

    /// Device orientation reading in degrees.
    fn tilt(&mut self, _pitch_deg: f32, _roll_deg: f32) {}
}

pub trait FeedbackFactory: Send + Sync {
    fn create(&self) -> Box<dyn Feedback>;
}

impl<F> FeedbackFactory for F
where
    F: Fn() -> Box<dyn Feedback> + Send + Sync,
{
    fn create(&self) -> Box<dyn Feedback> {
        self()
    }
}

/// Writes feedback to the log.
#[derive(Debug, Default)]
pub struct LogFeedback {
    alerts: u64,
    tilted: bool,
}

impl LogFeedback {
    pub fn factory() -> impl FeedbackFactory {
        || Box::new(LogFeedback::default()) as Box<dyn Feedback>
    }

    pub fn alerts(&self) -> u64 {
        self.alerts
    }
}

impl Feedback for LogFeedback {
    fn urgency_changed(&mut self, level: UrgencyLevel, distance_m: Option<f32>) {
        let distance = distance_m
            .map(|d| format!("{:.1} m", d))
            .unwrap_or_else(|| "unknown distance".to_string());
        if level == UrgencyLevel::Critical {
            self.alerts += 1;
            warn!("ALERT: obstacle at {}", distance);
        } else {
            info!("Urgency {} ({})", level, distance);
        }
    }

    fn image_issue(&mut self, report: &QualityReport) {
        if let Some(issue) = &report.issue {
            warn!("Camera image problem: {}", issue);
        }
    }

    fn tilt(&mut self, pitch_deg: f32, _roll_deg: f32) {
        let tilted = pitch_deg.abs() > TILT_LIMIT_DEG;
        if tilted && !self.tilted {
            info!("Device tilted {:.0} degrees, hold it level", pitch_deg);
        }
        self.tilted = tilted;
    }
}
