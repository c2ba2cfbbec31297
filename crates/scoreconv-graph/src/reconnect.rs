//! Exponential-backoff schedule for re-establishing the graph connection.
//!
//! Retries are unbounded; only the delay between attempts is capped.

use std::time::Duration;

use scoreconv_core::defaults;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(defaults::RECONNECT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(defaults::RECONNECT_MAX_DELAY_MS),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Stateful backoff tracker used by the transport's connection loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    delay: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let delay = config.initial_delay;
        Self {
            config,
            delay,
            attempt: 0,
        }
    }

    /// Attempt number and delay for the next retry, advancing the schedule.
    pub fn next(&mut self) -> (u32, Duration) {
        self.attempt = self.attempt.saturating_add(1);
        let current = self.delay;
        self.delay = next_delay(self.delay, &self.config);
        (self.attempt, current)
    }

    /// Number of retries scheduled since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.delay = self.config.initial_delay;
        self.attempt = 0;
    }
}
