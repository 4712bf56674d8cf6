use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

pub(crate) const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub(crate) const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;

/// Runtime-adjustable reconnect parameters.
///
/// Both values may be changed while the player runs; the ingest thread reads
/// them at every failure. Negative inputs are clamped to zero, so a negative
/// attempt count disables retries instead of meaning "retry forever".
#[derive(Debug)]
pub struct ReconnectSettings {
    max_attempts: AtomicU32,
    delay_ms: AtomicU64,
}

impl ReconnectSettings {
    pub fn new(max_attempts: i64, delay_ms: i64) -> Self {
        let settings = Self {
            max_attempts: AtomicU32::new(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            delay_ms: AtomicU64::new(DEFAULT_RECONNECT_DELAY_MS),
        };
        settings.set_max_attempts(max_attempts);
        settings.set_delay_ms(delay_ms);
        settings
    }

    pub fn set_max_attempts(&self, attempts: i64) {
        let attempts = attempts.clamp(0, u32::MAX as i64) as u32;
        self.max_attempts.store(attempts, Ordering::Release);
    }

    pub fn set_delay_ms(&self, delay_ms: i64) {
        self.delay_ms.store(delay_ms.max(0) as u64, Ordering::Release);
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.load(Ordering::Acquire)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.load(Ordering::Acquire))
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_RECONNECT_ATTEMPTS as i64,
            DEFAULT_RECONNECT_DELAY_MS as i64,
        )
    }
}

/// What the ingest thread should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStep {
    /// Failures counted so far, including this one.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Back-off before the next connection attempt.
    pub delay: Duration,
}

impl RetryStep {
    /// Whether a `Retrying(attempt/max)` status should be announced.
    ///
    /// With `max_attempts == 0` retries are disabled and nothing is announced.
    pub fn announces_retry(&self) -> bool {
        self.attempt <= self.max_attempts
    }

    /// Whether the retry budget is spent and the pipeline must stop.
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Retry counter owned by the ingest thread.
///
/// Every failed open and every mid-stream disconnect counts one failure; a
/// successful open resets the count. With `K` attempts the sequence for `K`
/// consecutive failures is `Retrying(1/K) .. Retrying(K/K)` followed by the
/// terminal error, i.e. exactly `K` connection attempts are made.
#[derive(Debug, Default)]
pub struct ReconnectState {
    retry_count: u32,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self { retry_count: 0 }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn on_connected(&mut self) {
        self.retry_count = 0;
    }

    pub fn on_failure(&mut self, settings: &ReconnectSettings) -> RetryStep {
        self.retry_count = self.retry_count.saturating_add(1);
        RetryStep {
            attempt: self.retry_count,
            max_attempts: settings.max_attempts(),
            delay: settings.delay(),
        }
    }
}
