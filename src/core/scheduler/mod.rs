pub(crate) mod audio_pacer;
pub(crate) mod decode_task;
pub(crate) mod ingest_task;
pub(crate) mod stats_task;

use crate::core::backend::{AudioDecoder, MediaBackend, VideoDecoder};
use crate::core::config::PlayerConfig;
use crate::core::dispatcher::Dispatcher;
use crate::core::events::EventEmitter;
use crate::core::packet::StreamKind;
use crate::core::packet_queue::PacketQueue;
use crate::core::reconnect::ReconnectSettings;
use crate::core::scheduler::audio_pacer::AudioOutput;
use crate::core::stats::StatsCollector;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep of any worker.
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Decode contexts of the current connection.
///
/// Installed and released only by the ingest thread (and by the stop
/// sequence once every worker has been joined). Decode workers hold the lock
/// only around send/receive calls.
#[derive(Default)]
pub(crate) struct DecodeContexts {
    pub(crate) video: Option<Box<dyn VideoDecoder>>,
    pub(crate) audio: Option<Box<dyn AudioDecoder>>,
}

impl DecodeContexts {
    pub(crate) fn release(&mut self) {
        self.video = None;
        self.audio = None;
    }
}

/// State shared by every worker of one player.
pub(crate) struct PipelineShared {
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) stop_requested: Arc<AtomicBool>,
    pub(crate) video_queue: Arc<PacketQueue>,
    pub(crate) audio_queue: Arc<PacketQueue>,
    pub(crate) decoders: Mutex<DecodeContexts>,
    pub(crate) stats: StatsCollector,
    pub(crate) audio: AudioOutput,
    pub(crate) reconnect: ReconnectSettings,
    pub(crate) events: EventEmitter,
    pub(crate) config: PlayerConfig,
    pub(crate) backend: Arc<dyn MediaBackend>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
}

impl PipelineShared {
    pub(crate) fn new(
        config: PlayerConfig,
        backend: Arc<dyn MediaBackend>,
        dispatcher: Arc<dyn Dispatcher>,
        events: EventEmitter,
    ) -> Self {
        let video = config.queue(StreamKind::Video);
        let audio = config.queue(StreamKind::Audio);
        let video_queue = Arc::new(PacketQueue::new(StreamKind::Video, video.capacity, video.policy));
        let audio_queue = Arc::new(PacketQueue::new(StreamKind::Audio, audio.capacity, audio.policy));
        Self {
            running: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            stats: StatsCollector::new(video_queue.clone(), audio_queue.clone()),
            video_queue,
            audio_queue,
            decoders: Mutex::new(DecodeContexts::default()),
            audio: AudioOutput::new(config.max_pending_audio),
            reconnect: ReconnectSettings::new(
                config.max_reconnect_attempts,
                config.reconnect_delay_ms,
            ),
            events,
            config,
            backend,
            dispatcher,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.stop_requested.load(Ordering::Acquire)
    }

    /// Marks the pipeline as stopping; workers observe it on their next check.
    pub(crate) fn halt(&self) {
        self.running.store(false, Ordering::Release);
        self.stop_requested.store(true, Ordering::Release);
    }

    pub(crate) fn lock_decoders(&self) -> MutexGuard<'_, DecodeContexts> {
        self.decoders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn release_decoders(&self) {
        self.lock_decoders().release();
    }

    pub(crate) fn queue(&self, kind: StreamKind) -> &Arc<PacketQueue> {
        match kind {
            StreamKind::Video => &self.video_queue,
            StreamKind::Audio => &self.audio_queue,
        }
    }

    pub(crate) fn open_queues(&self) {
        self.video_queue.open();
        self.audio_queue.open();
    }

    pub(crate) fn close_queues(&self) {
        self.video_queue.close();
        self.audio_queue.close();
    }

    pub(crate) fn clear_queues(&self) {
        self.video_queue.clear();
        self.audio_queue.clear();
    }

    /// Refreshes the stats snapshot and emits it.
    pub(crate) fn publish_stats(&self) {
        let stats = self.stats.refresh();
        self.events.stats(stats);
    }

    /// Sleeps for `duration` in short slices; returns `false` as soon as the
    /// pipeline stops.
    pub(crate) fn sleep_while_running(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if !self.is_running() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}
