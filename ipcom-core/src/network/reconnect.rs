//! Exponential backoff for reconnection attempts.

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Backoff bookkeeping.
///
/// The delay never shrinks across consecutive failures and only goes back
/// to `base` through [`reset`](Self::reset) after a confirmed reconnect.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    current: Duration,
    base: Duration,
    max: Duration,
    multiplier: f64,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration, multiplier: f64) -> Self {
        let max = max.max(base);
        Self {
            current: base,
            base,
            max,
            multiplier: multiplier.max(1.0),
        }
    }

    pub fn from_config(cfg: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.base_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
            cfg.multiplier,
        )
    }

    /// Advance after a failure: `min(current * multiplier, max)`, stored
    /// and returned.
    pub fn next_delay(&mut self) -> Duration {
        let scaled = self.current.as_secs_f64() * self.multiplier;
        self.current = if scaled >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(scaled)
        };
        self.current
    }

    /// Back to the base delay after a successful reconnect.
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn current_delay(&self) -> Duration {
        self.current
    }

    pub fn base_delay(&self) -> Duration {
        self.base
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

// ── Tests ────────────────────────────────────────────────────────
