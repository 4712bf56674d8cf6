use crate::core::packet_queue::PacketQueue;
use crossbeam::atomic::AtomicCell;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Read-only pipeline snapshot, built fresh every stats cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlayerStats {
    pub video_queue_size: usize,
    pub audio_queue_size: usize,
    pub incoming_bitrate_kbps: f64,
    /// Buffered latency estimate: queue depth × per-unit playback duration.
    pub jitter_buffer_ms: f64,
    pub dropped_video_frames: u64,
}

/// `max(video_ms × video_queue, audio_ms × audio_queue)`; a non-positive
/// duration contributes nothing.
pub fn jitter_buffer_ms(
    video_frame_ms: f64,
    video_queue_size: usize,
    audio_frame_ms: f64,
    audio_queue_size: usize,
) -> f64 {
    let video = if video_frame_ms > 0.0 {
        video_frame_ms * video_queue_size as f64
    } else {
        0.0
    };
    let audio = if audio_frame_ms > 0.0 {
        audio_frame_ms * audio_queue_size as f64
    } else {
        0.0
    };
    video.max(audio)
}

/// Byte counter producing one kbps sample per window.
pub(crate) struct BitrateMeter {
    window: Duration,
    window_start: Instant,
    bytes: usize,
}

impl BitrateMeter {
    pub(crate) fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            window_start: now,
            bytes: 0,
        }
    }

    /// Adds `bytes`; returns the window's rate once `window` has elapsed.
    pub(crate) fn record(&mut self, bytes: usize, now: Instant) -> Option<f64> {
        self.bytes += bytes;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return None;
        }
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let kbps = self.bytes as f64 * 8.0 / elapsed_ms;
        self.bytes = 0;
        self.window_start = now;
        Some(kbps)
    }
}

/// Shared inputs of the stats snapshot.
///
/// Frame durations are written by the ingest thread once per connection,
/// the bitrate once per meter window. The latest snapshot sits behind its
/// own lock, separate from the decode lock.
pub(crate) struct StatsCollector {
    video_queue: Arc<PacketQueue>,
    audio_queue: Arc<PacketQueue>,
    bitrate_kbps: AtomicCell<f64>,
    video_frame_ms: AtomicCell<f64>,
    audio_frame_ms: AtomicCell<f64>,
    latest: Mutex<PlayerStats>,
}

impl StatsCollector {
    pub(crate) fn new(video_queue: Arc<PacketQueue>, audio_queue: Arc<PacketQueue>) -> Self {
        Self {
            video_queue,
            audio_queue,
            bitrate_kbps: AtomicCell::new(0.0),
            video_frame_ms: AtomicCell::new(0.0),
            audio_frame_ms: AtomicCell::new(0.0),
            latest: Mutex::new(PlayerStats::default()),
        }
    }

    pub(crate) fn set_bitrate(&self, kbps: f64) {
        self.bitrate_kbps.store(kbps);
    }

    pub(crate) fn set_frame_durations(&self, video_ms: f64, audio_ms: f64) {
        self.video_frame_ms.store(video_ms);
        self.audio_frame_ms.store(audio_ms);
    }

    /// Clears bitrate and frame durations.
    pub(crate) fn reset(&self) {
        self.bitrate_kbps.store(0.0);
        self.set_frame_durations(0.0, 0.0);
    }

    pub(crate) fn snapshot(&self) -> PlayerStats {
        let video_queue_size = self.video_queue.len();
        let audio_queue_size = self.audio_queue.len();
        PlayerStats {
            video_queue_size,
            audio_queue_size,
            incoming_bitrate_kbps: self.bitrate_kbps.load(),
            jitter_buffer_ms: jitter_buffer_ms(
                self.video_frame_ms.load(),
                video_queue_size,
                self.audio_frame_ms.load(),
                audio_queue_size,
            ),
            dropped_video_frames: self.video_queue.dropped_count(),
        }
    }

    /// Builds a snapshot and stores it as the latest one.
    pub(crate) fn refresh(&self) -> PlayerStats {
        let stats = self.snapshot();
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = stats;
        stats
    }

    pub(crate) fn latest(&self) -> PlayerStats {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::{Packet, StreamKind};
    use crate::core::packet_queue::OverflowPolicy;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_jitter_takes_larger_buffer() {
        let jitter = jitter_buffer_ms(33.3, 3, 21.3, 10);
        assert!((jitter - 213.0).abs() < 1e-9);

        let jitter = jitter_buffer_ms(40.0, 10, 20.0, 5);
        assert!((jitter - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_jitter_ignores_unknown_durations() {
        assert_eq!(jitter_buffer_ms(0.0, 50, 0.0, 50), 0.0);
        assert!((jitter_buffer_ms(-1.0, 50, 10.0, 2) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_bitrate_meter_windows() {
        let start = Instant::now();
        let mut meter = BitrateMeter::new(Duration::from_secs(1), start);
        assert_eq!(meter.record(50_000, start + Duration::from_millis(400)), None);
        let kbps = meter
            .record(75_000, start + Duration::from_millis(1000))
            .unwrap();
        assert!((kbps - 1000.0).abs() < 1e-6);

        // next window starts empty
        let kbps = meter.record(0, start + Duration::from_millis(2000)).unwrap();
        assert_eq!(kbps, 0.0);
    }

    #[test]
    fn test_snapshot_reads_queues() {
        let live = AtomicBool::new(true);
        let video = Arc::new(PacketQueue::new(StreamKind::Video, 2, OverflowPolicy::DropOldest));
        let audio = Arc::new(PacketQueue::new(StreamKind::Audio, 16, OverflowPolicy::Block));
        for _ in 0..3 {
            video.push(Packet::new(0, vec![0u8; 4]), &live);
        }
        for _ in 0..10 {
            audio.push(Packet::new(1, vec![0u8; 4]), &live);
        }

        let collector = StatsCollector::new(video, audio);
        collector.set_frame_durations(33.3, 21.3);
        collector.set_bitrate(1500.0);

        let stats = collector.refresh();
        assert_eq!(stats.video_queue_size, 2);
        assert_eq!(stats.audio_queue_size, 10);
        assert_eq!(stats.dropped_video_frames, 1);
        assert_eq!(stats.incoming_bitrate_kbps, 1500.0);
        assert!((stats.jitter_buffer_ms - 213.0).abs() < 1e-9);
        assert_eq!(collector.latest(), stats);

        collector.reset();
        let stats = collector.snapshot();
        assert_eq!(stats.incoming_bitrate_kbps, 0.0);
        assert_eq!(stats.jitter_buffer_ms, 0.0);
    }
}
