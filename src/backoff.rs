//! Retry delay policy for resolution and dial failures

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay policy applied between consecutive failed attempts
///
/// `initial_delay_ms` is used for the first retry and multiplied by
/// `multiplier` for each further consecutive failure, capped at
/// `max_delay_ms`. `jitter` spreads each delay uniformly within
/// `±jitter × delay` (0.0 disables it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub jitter: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

impl Backoff {
    /// Same delay for every attempt
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            initial_delay_ms: ms,
            max_delay_ms: ms,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Exponential growth from `initial` up to `max`
    pub fn exponential(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay_ms: initial.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            multiplier,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let cap = self.max_delay_ms.max(self.initial_delay_ms) as f64;
        let base = (self.initial_delay_ms as f64 * factor).min(cap);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let ms = if jitter > 0.0 && base > 0.0 {
            let spread = base * jitter;
            rand::thread_rng().gen_range((base - spread)..=(base + spread))
        } else {
            base
        };

        Duration::from_millis(ms.max(0.0) as u64)
    }
}
