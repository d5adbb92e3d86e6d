//! Continuously decaying request counter
//!
//! Models the call-counter style of exchange limits: every admitted request
//! adds its cost to the counter, the counter drains at a fixed rate, and new
//! requests are refused while they would push it over the maximum.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for a decaying counter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecayCounterConfig {
    /// Counter ceiling; a request is refused if it would exceed this
    pub max_counter: f64,
    /// Units drained per second
    pub decay_per_sec: f64,
}

impl Default for DecayCounterConfig {
    fn default() -> Self {
        Self {
            max_counter: 15.0,
            decay_per_sec: 0.33,
        }
    }
}

impl DecayCounterConfig {
    pub fn with_max_counter(mut self, max_counter: f64) -> Self {
        self.max_counter = max_counter;
        self
    }

    pub fn with_decay_per_sec(mut self, decay_per_sec: f64) -> Self {
        self.decay_per_sec = decay_per_sec;
        self
    }
}

/// Decaying counter; never negative
#[derive(Debug)]
pub struct DecayCounter {
    value: f64,
    last_decay: Instant,
    config: DecayCounterConfig,
}

impl DecayCounter {
    pub fn new(config: DecayCounterConfig) -> Self {
        Self {
            value: 0.0,
            last_decay: Instant::now(),
            config,
        }
    }

    pub fn config(&self) -> &DecayCounterConfig {
        &self.config
    }

    /// Current value after applying decay
    pub fn value(&mut self) -> f64 {
        self.decay();
        self.value
    }

    /// Check whether `cost` fits without consuming it.
    ///
    /// Returns the estimated wait until it would fit otherwise.
    pub fn check(&mut self, cost: f64) -> Result<(), Duration> {
        self.decay();
        let overflow = self.value + cost - self.config.max_counter;
        if overflow <= 0.0 {
            Ok(())
        } else {
            Err(self.drain_time(overflow))
        }
    }

    /// Consume `cost` if it fits
    pub fn try_acquire(&mut self, cost: f64) -> Result<(), Duration> {
        self.check(cost)?;
        self.value += cost;
        Ok(())
    }

    /// Add `cost` unconditionally, even past the ceiling. Callers that must
    /// respect the limit call [`check`](Self::check) first.
    pub fn consume(&mut self, cost: f64) {
        self.decay();
        self.value += cost;
    }

    /// Push the counter to its ceiling (exchange said we are over the limit)
    pub fn saturate(&mut self) {
        self.decay();
        self.value = self.value.max(self.config.max_counter);
    }

    /// Overwrite the counter with an externally observed value
    pub fn seed(&mut self, value: f64) {
        self.value = if value.is_finite() { value.max(0.0) } else { 0.0 };
        self.last_decay = Instant::now();
    }

    fn decay(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_decay).as_secs_f64();
        self.value = (self.value - elapsed * self.config.decay_per_sec).max(0.0);
        self.last_decay = now;
    }

    fn drain_time(&self, amount: f64) -> Duration {
        if self.config.decay_per_sec <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64(amount / self.config.decay_per_sec).unwrap_or(Duration::MAX)
    }
}
