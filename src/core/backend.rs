//! Contracts for the collaborators the pipeline drives but does not
//! implement: the network stream source, the codec engine and the audio
//! output device.
//!
//! The FFmpeg implementation lives in [`crate::ffmpeg`] (feature `ffmpeg`);
//! tests drive the pipeline with scripted in-memory implementations.

use crate::core::config::OpenOptions;
use crate::core::packet::Packet;
use crate::error::{ConnectionError, DecodeError, ResourceError};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Frames per second assumed when stream metadata gives no usable rate.
pub const DEFAULT_VIDEO_FPS: f64 = 30.0;
/// Samples per audio frame assumed when the codec does not report one.
pub const DEFAULT_AUDIO_FRAME_SIZE: u32 = 1024;
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;
pub const DEFAULT_CHANNELS: u16 = 2;

/// Polled abort check handed to the stream source.
///
/// Blocking network calls must consult [`should_abort`](Self::should_abort)
/// regularly so a stop request unblocks them within one polling interval.
#[derive(Clone, Debug)]
pub struct Interrupt {
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
}

impl Interrupt {
    pub(crate) fn new(running: Arc<AtomicBool>, stop_requested: Arc<AtomicBool>) -> Self {
        Self {
            running,
            stop_requested,
        }
    }

    pub fn should_abort(&self) -> bool {
        !self.running.load(Ordering::Acquire) || self.stop_requested.load(Ordering::Acquire)
    }
}

/// A decoded picture converted to BGRA, 8 bits per channel.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    width: u32,
    height: u32,
    stride: usize,
    data: Bytes,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, stride: usize, data: Bytes) -> Self {
        Self {
            width,
            height,
            stride,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row, at least `width * 4`.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// Interleaved signed 16-bit little-endian PCM layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * 2
    }

    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0
    }
}

/// The selected video stream of an opened source.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamParams {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    /// Playback duration of one frame, derived once per connection.
    pub frame_duration_ms: f64,
}

/// The selected audio stream of an opened source.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioStreamParams {
    pub index: usize,
    /// Format the stream would like to be played at.
    pub requested: AudioFormat,
    pub frame_duration_ms: f64,
}

/// Frame duration from a frame rate, falling back to [`DEFAULT_VIDEO_FPS`]
/// below 1 fps.
pub fn video_frame_duration_ms(fps: f64) -> f64 {
    let fps = if fps.is_finite() && fps >= 1.0 {
        fps
    } else {
        DEFAULT_VIDEO_FPS
    };
    1000.0 / fps
}

/// Audio frame duration from the codec frame size, falling back to
/// [`DEFAULT_AUDIO_FRAME_SIZE`] samples. Zero without a sample rate.
pub fn audio_frame_duration_ms(frame_size: u32, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    let frame_size = if frame_size > 0 {
        frame_size
    } else {
        DEFAULT_AUDIO_FRAME_SIZE
    };
    1000.0 * frame_size as f64 / sample_rate as f64
}

/// Opens network inputs.
pub trait MediaBackend: Send + Sync + 'static {
    /// Opens `address`, resolves its streams and selects the first video and
    /// the first audio stream. A source without video is an error.
    fn open(
        &self,
        address: &str,
        options: &OpenOptions,
        interrupt: Interrupt,
    ) -> Result<Box<dyn StreamSource>, ConnectionError>;
}

/// An opened input. Exclusively owned by the ingest thread.
pub trait StreamSource: Send {
    fn video_stream(&self) -> &VideoStreamParams;

    fn audio_stream(&self) -> Option<&AudioStreamParams>;

    /// Reads the next packet of any stream. End of input is reported as
    /// [`ConnectionError::EndOfStream`].
    fn read_packet(&mut self) -> Result<Packet, ConnectionError>;

    /// Creates the video decode context together with a scaler to BGRA.
    fn open_video_decoder(&mut self) -> Result<Box<dyn VideoDecoder>, ResourceError>;

    /// Creates the audio decode context together with a resampler to `output`.
    fn open_audio_decoder(
        &mut self,
        output: AudioFormat,
    ) -> Result<Box<dyn AudioDecoder>, ResourceError>;
}

/// A video decode context. Not reentrant; always used under the decode lock.
pub trait VideoDecoder: Send {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), DecodeError>;

    /// Drains one converted frame; `Ok(None)` when more input is needed.
    fn receive_frame(&mut self) -> Result<Option<VideoFrame>, DecodeError>;
}

/// An audio decode context. Not reentrant; always used under the decode lock.
pub trait AudioDecoder: Send {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), DecodeError>;

    /// Drains one resampled PCM chunk; `Ok(None)` when more input is needed.
    fn receive_samples(&mut self) -> Result<Option<Bytes>, DecodeError>;
}

/// Audio output device.
pub trait AudioSink: Send {
    /// (Re)opens the device, returning the nearest supported format.
    fn open(&mut self, requested: AudioFormat) -> Result<AudioFormat, ResourceError>;

    /// Bytes the device accepts right now without blocking.
    fn bytes_free(&self) -> usize;

    /// Writes up to `data.len()` bytes, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> usize;

    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_frame_duration_fallback() {
        assert!((video_frame_duration_ms(25.0) - 40.0).abs() < 1e-9);
        assert!((video_frame_duration_ms(0.0) - 1000.0 / 30.0).abs() < 1e-9);
        assert!((video_frame_duration_ms(f64::NAN) - 1000.0 / 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_audio_frame_duration_fallback() {
        assert!((audio_frame_duration_ms(960, 48000) - 20.0).abs() < 1e-9);
        assert!((audio_frame_duration_ms(0, 48000) - 1000.0 * 1024.0 / 48000.0).abs() < 1e-9);
        assert_eq!(audio_frame_duration_ms(1024, 0), 0.0);
    }

    #[test]
    fn test_interrupt_follows_flags() {
        let running = Arc::new(AtomicBool::new(true));
        let stop_requested = Arc::new(AtomicBool::new(false));
        let interrupt = Interrupt::new(running.clone(), stop_requested.clone());
        assert!(!interrupt.should_abort());

        stop_requested.store(true, Ordering::Release);
        assert!(interrupt.should_abort());

        stop_requested.store(false, Ordering::Release);
        running.store(false, Ordering::Release);
        assert!(interrupt.should_abort());
    }

    #[test]
    fn test_audio_format_rate() {
        let format = AudioFormat::new(48000, 2);
        assert_eq!(format.bytes_per_second(), 192000);
        assert!(format.is_valid());
        assert!(!AudioFormat::new(0, 2).is_valid());
    }
}
