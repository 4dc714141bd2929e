//! Resubmission policy for transfers that fail at the transport level.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How often and how quickly a failed transfer is resubmitted.
///
/// `max_attempts` counts every hand-off to the multiplexer, the first one
/// included. Delays grow geometrically from `initial_delay` by
/// `backoff_multiplier` and are capped at `max_delay`; with `jitter` enabled
/// each delay is spread by up to ±10%.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts allowed. `None` means retry forever.
    pub max_attempts: Option<u32>,
    /// Delay before the first resubmission.
    #[serde(rename = "initial_delay_ms", with = "crate::config::millis")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    #[serde(rename = "max_delay_ms", with = "crate::config::millis")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Spread delays by ±10%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create the default bounded policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resubmit forever without waiting.
    pub fn immediate() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Never resubmit.
    pub fn never() -> Self {
        Self {
            max_attempts: Some(1),
            ..Self::immediate()
        }
    }

    /// Set the total number of attempts.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Allow unlimited attempts.
    pub fn unbounded(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Set the delay before the first resubmission.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay between attempts.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// The delay to wait after `attempts` failed attempts, or `None` once the
    /// policy is exhausted.
    pub fn next_delay(&self, attempts: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts
            && attempts >= max
        {
            return None;
        }
        Some(self.delay_for_attempt(attempts.saturating_sub(1)))
    }

    /// Calculate the delay for a given retry number (0-indexed).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let base_delay_ms = self.initial_delay.as_millis() as f64;
        let exponent = retry.min(i32::MAX as u32) as i32;
        let delay_ms = base_delay_ms * self.backoff_multiplier.powi(exponent);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64).max(0.0) as i64;

        if !self.jitter {
            return Duration::from_millis(delay_ms as u64);
        }

        let jitter_range = delay_ms / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0
        };

        Duration::from_millis((delay_ms + jitter).max(0) as u64)
    }
}
