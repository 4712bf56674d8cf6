//! Scripted in-memory backend and sink shared by the integration tests.
#![allow(dead_code)]

use bytes::Bytes;
use crossbeam_channel::Receiver;
use ez_live_player::error::{ConnectionError, DecodeError, ResourceError};
use ez_live_player::{
    AudioDecoder, AudioFormat, AudioSink, AudioStreamParams, Interrupt, MediaBackend,
    OpenOptions, Packet, PlayerEvent, PlayerStatus, StreamSource, VideoDecoder, VideoFrame,
    VideoStreamParams,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const VIDEO_INDEX: usize = 0;
pub const AUDIO_INDEX: usize = 1;

/// What every successful connection serves.
#[derive(Clone, Debug)]
pub struct Script {
    /// Opens that fail before the first success.
    pub failures: usize,
    /// Video packets per connection.
    pub video_packets: usize,
    /// Audio packets per connection, interleaved after each video packet.
    pub audio_packets: usize,
    pub audio: Option<AudioFormat>,
    /// Keep the connection open after the last packet until interrupted.
    pub hold_open: bool,
    /// Time spent in `open`, ignoring the interrupt.
    pub open_delay: Duration,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            failures: 0,
            video_packets: 0,
            audio_packets: 0,
            audio: None,
            hold_open: true,
            open_delay: Duration::ZERO,
        }
    }
}

#[derive(Default)]
pub struct MockBackend {
    pub script: Script,
    pub opens: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self::new(Script {
            failures: usize::MAX,
            ..Script::default()
        })
    }
}

impl MediaBackend for MockBackend {
    fn open(
        &self,
        _address: &str,
        _options: &OpenOptions,
        interrupt: Interrupt,
    ) -> Result<Box<dyn StreamSource>, ConnectionError> {
        std::thread::sleep(self.script.open_delay);
        let n = self.opens.fetch_add(1, Ordering::SeqCst);
        if n < self.script.failures {
            return Err(ConnectionError::OpenInput("Connection refused".into()));
        }
        Ok(Box::new(MockSource::new(self.script.clone(), interrupt)))
    }
}

pub struct MockSource {
    script: Script,
    interrupt: Interrupt,
    video: VideoStreamParams,
    audio: Option<AudioStreamParams>,
    video_sent: usize,
    audio_sent: usize,
}

impl MockSource {
    fn new(script: Script, interrupt: Interrupt) -> Self {
        let audio = script.audio.map(|format| AudioStreamParams {
            index: AUDIO_INDEX,
            requested: format,
            frame_duration_ms: 20.0,
        });
        Self {
            script,
            interrupt,
            video: VideoStreamParams {
                index: VIDEO_INDEX,
                width: 2,
                height: 2,
                frame_duration_ms: 40.0,
            },
            audio,
            video_sent: 0,
            audio_sent: 0,
        }
    }
}

impl StreamSource for MockSource {
    fn video_stream(&self) -> &VideoStreamParams {
        &self.video
    }

    fn audio_stream(&self) -> Option<&AudioStreamParams> {
        self.audio.as_ref()
    }

    fn read_packet(&mut self) -> Result<Packet, ConnectionError> {
        let audio_due = self.audio.is_some()
            && self.audio_sent < self.script.audio_packets
            && (self.audio_sent < self.video_sent
                || self.video_sent >= self.script.video_packets);
        if audio_due {
            self.audio_sent += 1;
            return Ok(Packet::new(AUDIO_INDEX, vec![self.audio_sent as u8; 4]));
        }
        if self.video_sent < self.script.video_packets {
            self.video_sent += 1;
            return Ok(Packet::new(VIDEO_INDEX, vec![self.video_sent as u8; 16]).with_keyframe(true));
        }
        if !self.script.hold_open {
            return Err(ConnectionError::EndOfStream);
        }
        while !self.interrupt.should_abort() {
            std::thread::sleep(Duration::from_millis(2));
        }
        Err(ConnectionError::Interrupted)
    }

    fn open_video_decoder(&mut self) -> Result<Box<dyn VideoDecoder>, ResourceError> {
        Ok(Box::new(EchoVideo::default()))
    }

    fn open_audio_decoder(
        &mut self,
        _output: AudioFormat,
    ) -> Result<Box<dyn AudioDecoder>, ResourceError> {
        Ok(Box::new(EchoAudio::default()))
    }
}

/// Turns each 16-byte packet into one 2x2 BGRA frame.
#[derive(Default)]
pub struct EchoVideo {
    pending: Option<Bytes>,
}

impl VideoDecoder for EchoVideo {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), DecodeError> {
        self.pending = Some(packet.data().clone());
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<VideoFrame>, DecodeError> {
        Ok(self.pending.take().map(|data| VideoFrame::new(2, 2, 8, data)))
    }
}

/// Passes packet payloads through as PCM.
#[derive(Default)]
pub struct EchoAudio {
    pending: Option<Bytes>,
}

impl AudioDecoder for EchoAudio {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), DecodeError> {
        self.pending = Some(packet.data().clone());
        Ok(())
    }

    fn receive_samples(&mut self) -> Result<Option<Bytes>, DecodeError> {
        Ok(self.pending.take())
    }
}

/// Sink with unlimited space that records everything written to it.
#[derive(Clone, Default)]
pub struct CaptureSink {
    pub written: Arc<Mutex<Vec<u8>>>,
    pub opens: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    /// Thread names the device was opened and closed on.
    pub threads: Arc<Mutex<Vec<String>>>,
}

impl CaptureSink {
    fn record_thread(&self) {
        let name = std::thread::current().name().unwrap_or("").to_string();
        self.threads.lock().unwrap().push(name);
    }
}

impl AudioSink for CaptureSink {
    fn open(&mut self, requested: AudioFormat) -> Result<AudioFormat, ResourceError> {
        self.record_thread();
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(requested)
    }

    fn bytes_free(&self) -> usize {
        usize::MAX
    }

    fn write(&mut self, data: &[u8]) -> usize {
        self.written.lock().unwrap().extend_from_slice(data);
        data.len()
    }

    fn close(&mut self) {
        self.record_thread();
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Collects events until `done` matches one or `timeout` passes.
pub fn collect_until(
    events: &Receiver<PlayerEvent>,
    timeout: Duration,
    mut done: impl FnMut(&PlayerEvent) -> bool,
) -> Vec<PlayerEvent> {
    let deadline = Instant::now() + timeout;
    let mut collected = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) => {
                let finished = done(&event);
                collected.push(event);
                if finished {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    collected
}

pub fn statuses(events: &[PlayerEvent]) -> Vec<PlayerStatus> {
    events
        .iter()
        .filter_map(|event| match event {
            PlayerEvent::StatusChanged(status) => Some(status.clone()),
            _ => None,
        })
        .collect()
}

pub fn is_stopped(event: &PlayerEvent) -> bool {
    matches!(event, PlayerEvent::StatusChanged(PlayerStatus::Stopped))
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
