use crate::core::packet::StreamKind;
use crate::core::packet_queue::OverflowPolicy;
use crate::core::reconnect::{DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY_MS};
use crate::error::{ConfigurationError, Result};
use std::time::Duration;

const DEFAULT_VIDEO_QUEUE_CAPACITY: usize = 90;
const DEFAULT_AUDIO_QUEUE_CAPACITY: usize = 180;
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PACER_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_STATS_INTERVAL: Duration = Duration::from_millis(1000);
const DEFAULT_EMPTY_QUEUE_BACKOFF: Duration = Duration::from_millis(5);
const DEFAULT_PUSH_RETRY_BACKOFF: Duration = Duration::from_millis(10);
const DEFAULT_EVENT_BACKLOG: usize = 64;
const DEFAULT_MAX_PENDING_AUDIO: Duration = Duration::from_millis(2000);

/// Capacity and overflow policy of one packet queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub policy: OverflowPolicy,
}

/// Player configuration, built with chained `set_*` calls.
///
/// ```rust
/// use ez_live_player::{OverflowPolicy, PlayerConfig};
///
/// let config = PlayerConfig::default()
///     .set_video_queue(120, OverflowPolicy::DropOldest)
///     .set_max_reconnect_attempts(3)
///     .set_reconnect_delay_ms(500);
/// assert_eq!(config.max_reconnect_attempts(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub(crate) video_queue: QueueConfig,
    pub(crate) audio_queue: QueueConfig,
    pub(crate) max_reconnect_attempts: i64,
    pub(crate) reconnect_delay_ms: i64,
    pub(crate) io_timeout: Duration,
    pub(crate) pacer_interval: Duration,
    pub(crate) stats_interval: Duration,
    pub(crate) empty_queue_backoff: Duration,
    pub(crate) push_retry_backoff: Duration,
    pub(crate) event_backlog: usize,
    pub(crate) max_pending_audio: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            video_queue: QueueConfig {
                capacity: DEFAULT_VIDEO_QUEUE_CAPACITY,
                policy: OverflowPolicy::DropOldest,
            },
            audio_queue: QueueConfig {
                capacity: DEFAULT_AUDIO_QUEUE_CAPACITY,
                policy: OverflowPolicy::Block,
            },
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS as i64,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS as i64,
            io_timeout: DEFAULT_IO_TIMEOUT,
            pacer_interval: DEFAULT_PACER_INTERVAL,
            stats_interval: DEFAULT_STATS_INTERVAL,
            empty_queue_backoff: DEFAULT_EMPTY_QUEUE_BACKOFF,
            push_retry_backoff: DEFAULT_PUSH_RETRY_BACKOFF,
            event_backlog: DEFAULT_EVENT_BACKLOG,
            max_pending_audio: DEFAULT_MAX_PENDING_AUDIO,
        }
    }
}

impl PlayerConfig {
    pub fn set_video_queue(mut self, capacity: usize, policy: OverflowPolicy) -> Self {
        self.video_queue = QueueConfig { capacity, policy };
        self
    }

    pub fn set_audio_queue(mut self, capacity: usize, policy: OverflowPolicy) -> Self {
        self.audio_queue = QueueConfig { capacity, policy };
        self
    }

    /// Negative values are clamped to 0 (no retries).
    pub fn set_max_reconnect_attempts(mut self, attempts: i64) -> Self {
        self.max_reconnect_attempts = attempts.max(0);
        self
    }

    /// Negative values are clamped to 0.
    pub fn set_reconnect_delay_ms(mut self, delay_ms: i64) -> Self {
        self.reconnect_delay_ms = delay_ms.max(0);
        self
    }

    /// Timeout applied to every blocking network read or open.
    pub fn set_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn set_pacer_interval(mut self, interval: Duration) -> Self {
        self.pacer_interval = interval;
        self
    }

    pub fn set_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// How long a decode thread sleeps after finding its queue empty.
    pub fn set_empty_queue_backoff(mut self, backoff: Duration) -> Self {
        self.empty_queue_backoff = backoff;
        self
    }

    /// How long the ingest thread sleeps after a rejected push.
    pub fn set_push_retry_backoff(mut self, backoff: Duration) -> Self {
        self.push_retry_backoff = backoff;
        self
    }

    /// Frame and stats events beyond this backlog are dropped.
    pub fn set_event_backlog(mut self, backlog: usize) -> Self {
        self.event_backlog = backlog;
        self
    }

    /// Upper bound of decoded audio waiting for the output device.
    pub fn set_max_pending_audio(mut self, duration: Duration) -> Self {
        self.max_pending_audio = duration;
        self
    }

    pub fn queue(&self, kind: StreamKind) -> QueueConfig {
        match kind {
            StreamKind::Video => self.video_queue,
            StreamKind::Audio => self.audio_queue,
        }
    }

    pub fn max_reconnect_attempts(&self) -> i64 {
        self.max_reconnect_attempts
    }

    pub fn reconnect_delay_ms(&self) -> i64 {
        self.reconnect_delay_ms
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.video_queue.capacity == 0 {
            return Err(ConfigurationError::InvalidQueueCapacity("video").into());
        }
        if self.audio_queue.capacity == 0 {
            return Err(ConfigurationError::InvalidQueueCapacity("audio").into());
        }
        Ok(())
    }
}

/// Checks that `address` can be handed to the stream source.
pub(crate) fn validate_address(address: &str) -> Result<&str> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ConfigurationError::EmptyAddress.into());
    }
    if address.contains('\0') {
        return Err(ConfigurationError::InvalidAddress("contains a NUL byte".into()).into());
    }
    if let Some((scheme, rest)) = address.split_once("://") {
        let valid_scheme = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid_scheme || rest.is_empty() {
            return Err(ConfigurationError::InvalidAddress(address.to_string()).into());
        }
    }
    Ok(address)
}

/// Lowercased URL scheme, or `None` for plain paths.
pub fn url_scheme(address: &str) -> Option<String> {
    let (scheme, _) = address.trim().split_once("://")?;
    if scheme.is_empty() {
        return None;
    }
    Some(scheme.to_ascii_lowercase())
}

/// Options passed to the stream source when opening an input.
///
/// Biased towards latency: no input buffering, low-delay flags and a bounded
/// I/O timeout. RTSP is forced onto TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    entries: Vec<(String, String)>,
    io_timeout: Duration,
}

impl OpenOptions {
    pub fn for_address(address: &str, io_timeout: Duration) -> Self {
        let timeout_us = io_timeout.as_micros().to_string();
        let mut options = Self {
            entries: Vec::with_capacity(6),
            io_timeout,
        };
        options.set("buffer_size", "65536");
        options.set("fflags", "nobuffer");
        options.set("flags", "low_delay");
        options.set("rw_timeout", &timeout_us);

        if url_scheme(address).as_deref() == Some("rtsp") {
            options.set("rtsp_transport", "tcp");
            options.set("stimeout", &timeout_us);
        }
        options
    }

    /// Adds or replaces an option.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }
}
