use crate::core::backend::VideoFrame;
use crate::core::stats::PlayerStats;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, trace};
use std::fmt;

/// Connection status reported to the owning context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerStatus {
    Connecting,
    Playing,
    Retrying { attempt: u32, max_attempts: u32 },
    /// The stream dropped while playing; a retry decision follows.
    ConnectionLost,
    /// Reconnect attempts are exhausted or an unrecoverable error occurred.
    Error,
    Stopped,
}

impl fmt::Display for PlayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerStatus::Connecting => write!(f, "Connecting"),
            PlayerStatus::Playing => write!(f, "Playing"),
            PlayerStatus::Retrying {
                attempt,
                max_attempts,
            } => write!(f, "Retrying connection ({attempt}/{max_attempts})"),
            PlayerStatus::ConnectionLost => write!(f, "Connection lost"),
            PlayerStatus::Error => write!(f, "Error"),
            PlayerStatus::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Events emitted by the pipeline. The core never calls into consumer state;
/// the owning context drains these from [`LivePlayer::events`](crate::LivePlayer::events).
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    FrameReady(VideoFrame),
    StatusChanged(PlayerStatus),
    StatsUpdated(PlayerStats),
    ErrorOccurred { message: String, fatal: bool },
}

/// Sending half of the event channel, cloned into every worker.
///
/// Status and error events are always delivered. Frames and stats snapshots
/// are dropped while the consumer is more than `backlog_limit` events behind,
/// so a stalled consumer cannot grow memory without bound.
#[derive(Clone)]
pub(crate) struct EventEmitter {
    sender: Sender<PlayerEvent>,
    backlog_limit: usize,
}

impl EventEmitter {
    pub(crate) fn channel(backlog_limit: usize) -> (Self, Receiver<PlayerEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (
            Self {
                sender,
                backlog_limit: backlog_limit.max(1),
            },
            receiver,
        )
    }

    pub(crate) fn status(&self, status: PlayerStatus) {
        debug!("Player status: {status}");
        self.send(PlayerEvent::StatusChanged(status));
    }

    pub(crate) fn error(&self, message: impl Into<String>, fatal: bool) {
        self.send(PlayerEvent::ErrorOccurred {
            message: message.into(),
            fatal,
        });
    }

    /// Returns `false` if the frame was dropped because the consumer lags.
    pub(crate) fn frame(&self, frame: VideoFrame) -> bool {
        self.send_lossy(PlayerEvent::FrameReady(frame))
    }

    pub(crate) fn stats(&self, stats: PlayerStats) -> bool {
        self.send_lossy(PlayerEvent::StatsUpdated(stats))
    }

    fn send(&self, event: PlayerEvent) {
        if self.sender.send(event).is_err() {
            trace!("Event receiver dropped, event discarded");
        }
    }

    fn send_lossy(&self, event: PlayerEvent) -> bool {
        if self.sender.len() >= self.backlog_limit {
            trace!("Event backlog full, dropping {}", event_name(&event));
            return false;
        }
        self.sender.send(event).is_ok()
    }
}

fn event_name(event: &PlayerEvent) -> &'static str {
    match event {
        PlayerEvent::FrameReady(_) => "frame",
        PlayerEvent::StatusChanged(_) => "status",
        PlayerEvent::StatsUpdated(_) => "stats",
        PlayerEvent::ErrorOccurred { .. } => "error",
    }
}
