// Paced hand-off of decoded PCM to the audio output device.
//
// - The decode thread appends chunks under a short lock
// - Every pacer tick swaps the whole pending list out and writes it while the
//   device reports free space
// - A partially written chunk is re-queued at the front, order preserved
// - Pending audio is capped by duration; the oldest chunks go first and the
//   drop is logged

use crate::core::backend::{AudioFormat, AudioSink, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use crate::core::scheduler::PipelineShared;
use crate::error::ResourceError;
use bytes::Bytes;
use log::{debug, error, trace};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Default)]
struct PendingAudio {
    chunks: VecDeque<Bytes>,
    bytes: usize,
}

/// Output device plus the PCM waiting for it.
pub(crate) struct AudioOutput {
    sink: Mutex<Option<Box<dyn AudioSink>>>,
    format: Mutex<Option<AudioFormat>>,
    pending: Mutex<PendingAudio>,
    max_pending: Duration,
    dropped_chunks: AtomicU64,
}

impl AudioOutput {
    pub(crate) fn new(max_pending: Duration) -> Self {
        Self {
            sink: Mutex::new(None),
            format: Mutex::new(None),
            pending: Mutex::new(PendingAudio::default()),
            max_pending,
            dropped_chunks: AtomicU64::new(0),
        }
    }

    fn lock_sink(&self) -> MutexGuard<'_, Option<Box<dyn AudioSink>>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingAudio> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_format(&self) -> MutexGuard<'_, Option<AudioFormat>> {
        self.format.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn attach(&self, sink: Box<dyn AudioSink>) {
        *self.lock_sink() = Some(sink);
    }

    pub(crate) fn has_sink(&self) -> bool {
        self.lock_sink().is_some()
    }

    /// Negotiated format of the open device, if any.
    pub(crate) fn format(&self) -> Option<AudioFormat> {
        *self.lock_format()
    }

    /// (Re)opens the device for `requested` and returns the negotiated
    /// format. Runs on the owning context.
    pub(crate) fn open(&self, requested: AudioFormat) -> Result<AudioFormat, ResourceError> {
        let requested = if requested.is_valid() {
            requested
        } else {
            AudioFormat::new(DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS)
        };

        let mut sink = self.lock_sink();
        let Some(device) = sink.as_mut() else {
            return Err(ResourceError::AudioOutputUnavailable(
                "no audio sink attached".to_string(),
            ));
        };
        if self.lock_format().take().is_some() {
            device.close();
        }
        let negotiated = device.open(requested)?;
        if !negotiated.is_valid() {
            device.close();
            return Err(ResourceError::AudioOutputUnavailable(format!(
                "device negotiated an unusable format {}Hz/{}ch",
                negotiated.sample_rate, negotiated.channels
            )));
        }
        drop(sink);

        if negotiated != requested {
            debug!(
                "Audio output negotiated {}Hz/{}ch instead of {}Hz/{}ch",
                negotiated.sample_rate, negotiated.channels, requested.sample_rate, requested.channels
            );
        }
        *self.lock_format() = Some(negotiated);
        self.clear_pending();
        Ok(negotiated)
    }

    /// Closes the device and discards pending audio. Runs on the owning
    /// context; a device that is not open is left alone.
    pub(crate) fn teardown(&self) {
        let mut sink = self.lock_sink();
        if self.lock_format().take().is_some() {
            if let Some(device) = sink.as_mut() {
                device.close();
                debug!("Audio output closed");
            }
        }
        drop(sink);
        self.clear_pending();
    }

    /// Appends a decoded chunk. Dropped while no device is open.
    pub(crate) fn enqueue(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let Some(format) = self.format() else {
            return;
        };
        let limit = (format.bytes_per_second() as f64 * self.max_pending.as_secs_f64()) as usize;

        let mut pending = self.lock_pending();
        pending.bytes += chunk.len();
        pending.chunks.push_back(chunk);
        let mut dropped = 0;
        while pending.bytes > limit && pending.chunks.len() > 1 {
            if let Some(oldest) = pending.chunks.pop_front() {
                pending.bytes -= oldest.len();
                dropped += 1;
            }
        }
        drop(pending);

        if dropped > 0 {
            let total = self.dropped_chunks.fetch_add(dropped, Ordering::Relaxed) + dropped;
            debug!(
                "Audio output behind by more than {:?}, dropped {dropped} chunks ({total} total)",
                self.max_pending
            );
        }
    }

    pub(crate) fn clear_pending(&self) {
        let mut pending = self.lock_pending();
        pending.chunks.clear();
        pending.bytes = 0;
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.lock_pending().bytes
    }

    pub(crate) fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks.load(Ordering::Relaxed)
    }

    fn take_pending(&self) -> VecDeque<Bytes> {
        let mut pending = self.lock_pending();
        pending.bytes = 0;
        std::mem::take(&mut pending.chunks)
    }

    /// Puts unwritten chunks back in front of anything queued meanwhile.
    fn requeue_front(&self, remainder: VecDeque<Bytes>) {
        let mut pending = self.lock_pending();
        for chunk in remainder.into_iter().rev() {
            pending.bytes += chunk.len();
            pending.chunks.push_front(chunk);
        }
    }

    /// One pacer tick: writes as much pending audio as the device accepts.
    /// Returns the number of bytes written.
    /// Pending audio is left in place while no device is open.
    pub(crate) fn flush_once(&self) -> usize {
        let mut sink = self.lock_sink();
        let device = match sink.as_mut() {
            Some(device) if self.format().is_some() => device,
            _ => return 0,
        };

        let mut chunks = self.take_pending();
        if chunks.is_empty() {
            return 0;
        }

        let mut written = 0;
        while let Some(chunk) = chunks.pop_front() {
            let mut offset = 0;
            while offset < chunk.len() && device.bytes_free() > 0 {
                let n = device.write(&chunk[offset..]);
                if n == 0 {
                    break;
                }
                offset += n;
                written += n;
            }
            if offset < chunk.len() {
                chunks.push_front(chunk.slice(offset..));
                break;
            }
        }
        drop(sink);

        if !chunks.is_empty() {
            trace!("Audio device full, {} chunks re-queued", chunks.len());
            self.requeue_front(chunks);
        }
        written
    }
}

pub(crate) fn audio_pacer_init(shared: Arc<PipelineShared>) -> crate::error::Result<JoinHandle<()>> {
    let interval = shared.config.pacer_interval;
    let result = std::thread::Builder::new()
        .name("audio-pacer".to_string())
        .spawn(move || {
            while shared.is_running() {
                shared.audio.flush_once();
                if !shared.sleep_while_running(interval) {
                    break;
                }
            }
            debug!("Audio pacer finished.");
        });
    result.map_err(|e| {
        error!("Audio pacer thread exited with error: {e}");
        crate::error::Error::ThreadExited
    })
}
