use ez_live_player::error::ResourceError;
use ez_live_player::ffmpeg::FfmpegBackend;
use ez_live_player::{AudioFormat, AudioSink, LivePlayer, PlayerConfig, PlayerEvent};
use std::time::{Duration, Instant};

/// Discards PCM at real-time rate, standing in for a sound card.
struct NullSink {
    format: Option<AudioFormat>,
    started: Instant,
    consumed: usize,
    /// Device buffer size in bytes.
    buffer: usize,
}

impl NullSink {
    fn new() -> Self {
        Self {
            format: None,
            started: Instant::now(),
            consumed: 0,
            buffer: 0,
        }
    }
}

impl AudioSink for NullSink {
    fn open(&mut self, requested: AudioFormat) -> Result<AudioFormat, ResourceError> {
        self.format = Some(requested);
        self.started = Instant::now();
        self.consumed = 0;
        // 200 ms of device buffer
        self.buffer = requested.bytes_per_second() / 5;
        println!("audio out: {}Hz {}ch", requested.sample_rate, requested.channels);
        Ok(requested)
    }

    fn bytes_free(&self) -> usize {
        let Some(format) = self.format else {
            return 0;
        };
        let played = (self.started.elapsed().as_secs_f64() * format.bytes_per_second() as f64) as usize;
        let queued = self.consumed.saturating_sub(played);
        self.buffer.saturating_sub(queued)
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.bytes_free());
        self.consumed += n;
        n
    }

    fn close(&mut self) {
        self.format = None;
        println!("audio out closed");
    }
}

fn main() {
    env_logger::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "rtmp://127.0.0.1:1935/live/stream".to_string());

    let player = LivePlayer::builder(FfmpegBackend::new())
        .config(
            PlayerConfig::default()
                .set_max_reconnect_attempts(5)
                .set_reconnect_delay_ms(2000),
        )
        .audio_sink(NullSink::new())
        .build()
        .unwrap();
    let events = player.events();
    player.start(&url).unwrap();

    let deadline = Instant::now() + Duration::from_secs(30);
    let mut frames = 0u64;
    while Instant::now() < deadline {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(PlayerEvent::FrameReady(frame)) => {
                frames += 1;
                if frames % 100 == 0 {
                    println!("{frames} frames, last {}x{}", frame.width(), frame.height());
                }
            }
            Ok(PlayerEvent::StatusChanged(status)) => println!("status: {status}"),
            Ok(PlayerEvent::StatsUpdated(stats)) => println!(
                "queues v={} a={} | {:.0} kbps | jitter {:.0} ms | dropped {}",
                stats.video_queue_size,
                stats.audio_queue_size,
                stats.incoming_bitrate_kbps,
                stats.jitter_buffer_ms,
                stats.dropped_video_frames,
            ),
            Ok(PlayerEvent::ErrorOccurred { message, fatal }) => {
                eprintln!("error: {message}");
                if fatal {
                    break;
                }
            }
            Err(_) => {}
        }
    }

    player.stop();
    println!("played {frames} frames");
}
