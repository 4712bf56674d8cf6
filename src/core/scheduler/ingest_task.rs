use crate::core::backend::{AudioDecoder, AudioStreamParams, Interrupt, StreamSource};
use crate::core::config::{url_scheme, OpenOptions};
use crate::core::dispatcher::call_on_owner;
use crate::core::events::PlayerStatus;
use crate::core::packet::StreamKind;
use crate::core::reconnect::ReconnectState;
use crate::core::scheduler::{DecodeContexts, PipelineShared};
use crate::core::stats::BitrateMeter;
use crate::error::{ConnectionError, Error, ResourceError};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const BITRATE_WINDOW: Duration = Duration::from_secs(1);
/// How long device negotiation may wait for the owning context.
const OWNER_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Invoked once when reconnect attempts are exhausted.
pub(crate) type ExhaustedHook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Connect,
    ConnectionLost,
}

pub(crate) fn ingest_init(
    shared: Arc<PipelineShared>,
    address: String,
    on_exhausted: ExhaustedHook,
) -> crate::error::Result<JoinHandle<()>> {
    let scheme = url_scheme(&address).unwrap_or_else(|| "file".to_string());
    let result = std::thread::Builder::new()
        .name(format!("ingest:{scheme}"))
        .spawn(move || {
            let exhausted = ingest_loop(&shared, &address);
            if exhausted {
                on_exhausted();
            }
            debug!("Ingest finished.");
        });
    result.map_err(|e| {
        error!("Ingest thread exited with error: {e}");
        Error::ThreadExited
    })
}

/// Connect, read, reconnect. Returns `true` if it ended because retries were
/// exhausted.
fn ingest_loop(shared: &Arc<PipelineShared>, address: &str) -> bool {
    let options = OpenOptions::for_address(address, shared.config.io_timeout);
    let mut reconnect = ReconnectState::new();

    while shared.is_running() {
        let mut source = match open_connection(shared, address, &options) {
            Ok(source) => source,
            Err(e) => {
                if !shared.is_running() {
                    break;
                }
                warn!("Connection to {address} failed: {e}");
                shared.events.error(e.to_string(), false);
                match schedule_retry(shared, &mut reconnect, Failure::Connect) {
                    RetryOutcome::Retry => continue,
                    RetryOutcome::Stopped => break,
                    RetryOutcome::Exhausted => return true,
                }
            }
        };

        // a stop that landed while the open was in progress skips Playing
        if !shared.is_running() {
            drop_connection(shared, source);
            break;
        }
        reconnect.on_connected();
        info!("Connected to {address}");
        shared.events.status(PlayerStatus::Playing);

        let outcome = read_loop(shared, source.as_mut());
        drop_connection(shared, source);

        if !shared.is_running() {
            break;
        }
        if let Err(e) = outcome {
            warn!("Connection to {address} lost: {e}");
            shared.events.error(e.to_string(), false);
        }
        shared.events.status(PlayerStatus::ConnectionLost);
        match schedule_retry(shared, &mut reconnect, Failure::ConnectionLost) {
            RetryOutcome::Retry => {}
            RetryOutcome::Stopped => break,
            RetryOutcome::Exhausted => return true,
        }
    }
    false
}

enum RetryOutcome {
    Retry,
    Stopped,
    Exhausted,
}

/// Counts one failure, announces the retry and waits out the delay.
///
/// A stop request observed here always wins over the retry decision.
fn schedule_retry(
    shared: &PipelineShared,
    reconnect: &mut ReconnectState,
    failure: Failure,
) -> RetryOutcome {
    if !shared.is_running() {
        return RetryOutcome::Stopped;
    }
    let step = reconnect.on_failure(&shared.reconnect);
    if step.announces_retry() {
        shared.events.status(PlayerStatus::Retrying {
            attempt: step.attempt,
            max_attempts: step.max_attempts,
        });
    }

    if step.is_exhausted() {
        let message = match failure {
            Failure::Connect => format!("Failed to connect after {} attempts.", step.max_attempts),
            Failure::ConnectionLost => format!(
                "Connection lost. Reached maximum {} retries.",
                step.max_attempts
            ),
        };
        error!("{message}");
        shared.events.error(message, true);
        shared.events.status(PlayerStatus::Error);
        shared.halt();
        shared.close_queues();
        return RetryOutcome::Exhausted;
    }

    info!(
        "Reconnecting in {:?} ({}/{})",
        step.delay, step.attempt, step.max_attempts
    );
    if shared.sleep_while_running(step.delay) {
        RetryOutcome::Retry
    } else {
        RetryOutcome::Stopped
    }
}

/// Opens the source and installs fresh decode contexts.
///
/// A video decoder that cannot be created fails the attempt; audio problems
/// only disable audio for this connection.
fn open_connection(
    shared: &Arc<PipelineShared>,
    address: &str,
    options: &OpenOptions,
) -> crate::error::Result<Box<dyn StreamSource>> {
    shared.release_decoders();

    let interrupt = Interrupt::new(shared.running.clone(), shared.stop_requested.clone());
    let mut source = shared.backend.open(address, options, interrupt)?;

    let video = source.video_stream().clone();
    debug!(
        "Video stream #{} {}x{}, {:.2}ms per frame",
        video.index, video.width, video.height, video.frame_duration_ms
    );
    let video_decoder = source.open_video_decoder().map_err(|e| {
        error!("{e}");
        e
    })?;

    let audio_params = source.audio_stream().cloned();
    let audio_decoder = match &audio_params {
        Some(params) => open_audio(shared, source.as_mut(), params),
        None => {
            debug!("No audio stream, playing video only");
            None
        }
    };
    let audio_frame_ms = match (&audio_decoder, &audio_params) {
        (Some(_), Some(params)) => params.frame_duration_ms,
        _ => 0.0,
    };

    shared
        .stats
        .set_frame_durations(video.frame_duration_ms, audio_frame_ms);
    *shared.lock_decoders() = DecodeContexts {
        video: Some(video_decoder),
        audio: audio_decoder,
    };
    shared.open_queues();
    Ok(source)
}

fn open_audio(
    shared: &Arc<PipelineShared>,
    source: &mut dyn StreamSource,
    params: &AudioStreamParams,
) -> Option<Box<dyn AudioDecoder>> {
    if !shared.audio.has_sink() {
        debug!("No audio sink attached, audio stream #{} ignored", params.index);
        return None;
    }

    let requested = params.requested;
    let output = {
        let owner_shared = Arc::clone(shared);
        call_on_owner(
            shared.dispatcher.as_ref(),
            move || owner_shared.audio.open(requested),
            OWNER_CALL_TIMEOUT,
        )
        .unwrap_or_else(|| {
            Err(ResourceError::AudioOutputUnavailable(
                "owner context did not respond".to_string(),
            ))
        })
    };
    let format = match output {
        Ok(format) => format,
        Err(e) => {
            warn!("{e}");
            shared.events.error(e.to_string(), false);
            return None;
        }
    };

    match source.open_audio_decoder(format) {
        Ok(decoder) => Some(decoder),
        Err(e) => {
            warn!("{e}");
            shared.events.error(e.to_string(), false);
            None
        }
    }
}

/// Reads packets and routes them to their queue until the pipeline stops or
/// the connection fails.
fn read_loop(shared: &PipelineShared, source: &mut dyn StreamSource) -> Result<(), ConnectionError> {
    let video_index = source.video_stream().index;
    let audio_index = source.audio_stream().map(|params| params.index);
    let mut meter = BitrateMeter::new(BITRATE_WINDOW, Instant::now());

    while shared.is_running() {
        let packet = source.read_packet()?;

        if let Some(kbps) = meter.record(packet.size(), Instant::now()) {
            shared.stats.set_bitrate(kbps);
            shared.publish_stats();
        }

        let kind = if packet.stream_index() == video_index {
            StreamKind::Video
        } else if Some(packet.stream_index()) == audio_index {
            StreamKind::Audio
        } else {
            continue;
        };

        if !shared.queue(kind).push(packet, &shared.running) {
            if !shared.is_running() {
                break;
            }
            std::thread::sleep(shared.config.push_retry_backoff);
        }
    }
    Ok(())
}

/// Tears down one connection: flushes both queues and releases the decode
/// contexts before the source itself is dropped.
fn drop_connection(shared: &PipelineShared, source: Box<dyn StreamSource>) {
    shared.close_queues();
    shared.clear_queues();
    shared.release_decoders();
    drop(source);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::{
        AudioFormat, MediaBackend, VideoDecoder, VideoFrame, VideoStreamParams,
    };
    use crate::core::config::PlayerConfig;
    use crate::core::dispatcher::InlineDispatcher;
    use crate::core::events::{EventEmitter, PlayerEvent};
    use crate::core::packet::Packet;
    use crate::error::DecodeError;
    use crossbeam_channel::Receiver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullVideo;

    impl VideoDecoder for NullVideo {
        fn send_packet(&mut self, _packet: &Packet) -> Result<(), DecodeError> {
            Ok(())
        }

        fn receive_frame(&mut self) -> Result<Option<VideoFrame>, DecodeError> {
            Ok(None)
        }
    }

    /// Delivers `packets` packets on stream 0, then reports end of stream.
    struct FiniteSource {
        video: VideoStreamParams,
        remaining: usize,
    }

    impl StreamSource for FiniteSource {
        fn video_stream(&self) -> &VideoStreamParams {
            &self.video
        }

        fn audio_stream(&self) -> Option<&AudioStreamParams> {
            None
        }

        fn read_packet(&mut self) -> Result<Packet, ConnectionError> {
            if self.remaining == 0 {
                return Err(ConnectionError::EndOfStream);
            }
            self.remaining -= 1;
            Ok(Packet::new(0, vec![0u8; 125]))
        }

        fn open_video_decoder(&mut self) -> Result<Box<dyn VideoDecoder>, ResourceError> {
            Ok(Box::new(NullVideo))
        }

        fn open_audio_decoder(
            &mut self,
            _output: AudioFormat,
        ) -> Result<Box<dyn AudioDecoder>, ResourceError> {
            Err(ResourceError::DecoderUnavailable("audio"))
        }
    }

    /// Fails the first `failures` opens, then serves finite sources.
    struct FlakyBackend {
        failures: usize,
        opens: AtomicUsize,
        packets: usize,
        open_delay: Duration,
    }

    impl FlakyBackend {
        fn new(failures: usize, packets: usize) -> Self {
            Self {
                failures,
                opens: AtomicUsize::new(0),
                packets,
                open_delay: Duration::ZERO,
            }
        }
    }

    impl MediaBackend for FlakyBackend {
        fn open(
            &self,
            _address: &str,
            _options: &OpenOptions,
            _interrupt: Interrupt,
        ) -> Result<Box<dyn StreamSource>, ConnectionError> {
            // ignores the interrupt, like a handshake stuck in a blocking call
            std::thread::sleep(self.open_delay);
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ConnectionError::OpenInput("Connection refused".into()));
            }
            Ok(Box::new(FiniteSource {
                video: VideoStreamParams {
                    index: 0,
                    width: 2,
                    height: 2,
                    frame_duration_ms: 40.0,
                },
                remaining: self.packets,
            }))
        }
    }

    fn pipeline(
        backend: FlakyBackend,
        config: PlayerConfig,
    ) -> (Arc<PipelineShared>, Arc<FlakyBackend>, Receiver<PlayerEvent>) {
        let backend = Arc::new(backend);
        let (events, receiver) = EventEmitter::channel(1024);
        let shared = Arc::new(PipelineShared::new(
            config,
            backend.clone(),
            Arc::new(InlineDispatcher),
            events,
        ));
        shared.running.store(true, Ordering::Release);
        (shared, backend, receiver)
    }

    fn statuses(events: &Receiver<PlayerEvent>) -> Vec<PlayerStatus> {
        events
            .try_iter()
            .filter_map(|event| match event {
                PlayerEvent::StatusChanged(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_exhausts_after_max_attempts() {
        let config = PlayerConfig::default()
            .set_max_reconnect_attempts(3)
            .set_reconnect_delay_ms(0);
        let (shared, backend, events) = pipeline(
            FlakyBackend::new(usize::MAX, 0),
            config,
        );

        assert!(ingest_loop(&shared, "rtsp://cam/live"));
        assert_eq!(backend.opens.load(Ordering::SeqCst), 3);
        assert!(!shared.is_running());
        assert_eq!(
            statuses(&events),
            vec![
                PlayerStatus::Retrying { attempt: 1, max_attempts: 3 },
                PlayerStatus::Retrying { attempt: 2, max_attempts: 3 },
                PlayerStatus::Retrying { attempt: 3, max_attempts: 3 },
                PlayerStatus::Error,
            ]
        );
    }

    #[test]
    fn test_zero_attempts_fails_immediately() {
        let config = PlayerConfig::default()
            .set_max_reconnect_attempts(0)
            .set_reconnect_delay_ms(0);
        let (shared, backend, events) = pipeline(
            FlakyBackend::new(usize::MAX, 0),
            config,
        );

        assert!(ingest_loop(&shared, "rtmp://host/app"));
        assert_eq!(backend.opens.load(Ordering::SeqCst), 1);
        let fatal: Vec<String> = events
            .try_iter()
            .filter_map(|event| match event {
                PlayerEvent::ErrorOccurred { message, fatal: true } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(fatal, vec!["Failed to connect after 0 attempts.".to_string()]);
    }

    #[test]
    fn test_success_resets_retry_count() {
        // two failed opens, then connections that each end after 5 packets
        let config = PlayerConfig::default()
            .set_max_reconnect_attempts(3)
            .set_reconnect_delay_ms(0);
        let (shared, backend, events) = pipeline(
            FlakyBackend::new(2, 5),
            config,
        );

        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || ingest_loop(&shared, "srt://host:9000"))
        };
        while backend.opens.load(Ordering::SeqCst) < 5 {
            std::thread::sleep(Duration::from_millis(1));
        }
        shared.halt();
        assert!(!worker.join().unwrap());

        let statuses = statuses(&events);
        assert_eq!(
            &statuses[..4],
            &[
                PlayerStatus::Retrying { attempt: 1, max_attempts: 3 },
                PlayerStatus::Retrying { attempt: 2, max_attempts: 3 },
                PlayerStatus::Playing,
                PlayerStatus::ConnectionLost,
            ]
        );
        // the count restarted after the successful open
        assert_eq!(
            statuses[4],
            PlayerStatus::Retrying { attempt: 1, max_attempts: 3 }
        );
        assert!(!statuses.contains(&PlayerStatus::Error));
    }

    #[test]
    fn test_stop_during_backoff_ends_quietly() {
        let config = PlayerConfig::default()
            .set_max_reconnect_attempts(5)
            .set_reconnect_delay_ms(10_000);
        let (shared, _backend, events) = pipeline(
            FlakyBackend::new(usize::MAX, 0),
            config,
        );

        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || ingest_loop(&shared, "rtsp://cam/live"))
        };
        std::thread::sleep(Duration::from_millis(50));
        shared.halt();
        assert!(!worker.join().unwrap());
        assert!(!statuses(&events).contains(&PlayerStatus::Error));
    }

    #[test]
    fn test_stop_during_open_skips_playing() {
        let config = PlayerConfig::default().set_reconnect_delay_ms(0);
        let mut backend = FlakyBackend::new(0, 5);
        backend.open_delay = Duration::from_millis(200);
        let (shared, backend, events) = pipeline(backend, config);

        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || ingest_loop(&shared, "rtmp://host/slow"))
        };
        std::thread::sleep(Duration::from_millis(50));
        shared.halt();
        assert!(!worker.join().unwrap());

        assert_eq!(backend.opens.load(Ordering::SeqCst), 1);
        assert!(statuses(&events).is_empty());
        assert!(shared.lock_decoders().video.is_none());
        assert!(!shared.video_queue.is_open());
    }
}
