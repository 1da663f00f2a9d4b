use std::time::Duration;

/// Exponential backoff shared by the restart ladder, the broker reconnect loop
/// and telemetry retries.
///
/// Attempt `n` (0-indexed) waits `initial * multiplier^n`, capped at `max`.
/// With `jitter` on, the delay is spread ±25% and clamped to `max` again.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    /// Total attempts allowed (`None` = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            max_attempts: None,
        }
    }
}

impl Backoff {
    /// Fixed-schedule policy used for telemetry uploads: 1s, 2s, then give up.
    pub fn telemetry() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: false,
            max_attempts: Some(3),
        }
    }

    /// Delay before retry `attempt`, ignoring jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.initial.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let spread = base.as_millis() as f64 / 4.0;
        let offset = (rand::random::<f64>() * 2.0 - 1.0) * spread;
        let millis = (base.as_millis() as f64 + offset).max(0.0);
        Duration::from_millis(millis as u64).min(self.max)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}
