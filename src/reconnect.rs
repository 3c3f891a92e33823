//! Automatic reconnection with exponential backoff
//!
//! Watches the session snapshot and restarts the session whenever it lands
//! in Disconnected. A user-initiated stop ends in Idle and is left alone.

use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::error::{Result, SessionError};
use crate::session::{SessionHandle, SessionState};

#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random.
    pub jitter: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            max_attempts: Some(10),
        }
    }
}

impl Backoff {
    /// `min(base * factor^attempt, max)`, then jittered and capped again.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .base_delay
            .saturating_mul(self.factor.saturating_pow(attempt))
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        delay.mul_f64((1.0 + spread).max(0.0)).min(self.max_delay)
    }
}

/// Keep the session alive until the actor goes away or the attempts run out.
///
/// Intended to run in its own task; abort it to stop reconnecting.
pub async fn run_with_reconnect(
    handle: SessionHandle,
    voice: Option<String>,
    backoff: Backoff,
) -> Result<()> {
    let mut rx = handle.subscribe();
    let mut attempt: u32 = 0;

    loop {
        let state = rx.borrow_and_update().state;
        match state {
            SessionState::Ready if attempt > 0 => {
                info!("Reconnected after {} attempts", attempt);
                attempt = 0;
            }
            SessionState::Disconnected => {
                if backoff.max_attempts.is_some_and(|max| attempt >= max) {
                    error!("Giving up after {} reconnect attempts", attempt);
                    return Err(SessionError::ReconnectExhausted { attempts: attempt });
                }
                let delay = backoff.delay_for_attempt(attempt);
                attempt += 1;
                warn!("Connection lost, reconnecting in {:?} (attempt {})", delay, attempt);
                tokio::time::sleep(delay).await;

                if handle.snapshot().state != SessionState::Disconnected {
                    info!("Session changed while waiting, skipping reconnect");
                    continue;
                }
                if let Err(e) = handle.start(voice.as_deref()).await {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                }
                continue;
            }
            _ => {}
        }

        if rx.changed().await.is_err() {
            return Ok(());
        }
    }
}
