use crate::core::backend::VideoFrame;
use crate::core::packet::{Packet, StreamKind};
use crate::core::scheduler::{DecodeContexts, PipelineShared};
use crate::error::{DecodeError, Error, ResourceError};
use bytes::Bytes;
use log::{debug, error, trace, warn};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Upper bound of outputs drained from one packet before they are emitted.
const OUTPUT_BATCH: usize = 16;

/// What one decoded packet produced, emitted after the decode lock is released.
enum DecodedBatch<'a> {
    Video(&'a mut Vec<VideoFrame>),
    Audio(&'a mut Vec<Bytes>),
}

pub(crate) fn video_decoder_init(shared: Arc<PipelineShared>) -> crate::error::Result<JoinHandle<()>> {
    spawn_decoder(shared, StreamKind::Video)
}

pub(crate) fn audio_decoder_init(shared: Arc<PipelineShared>) -> crate::error::Result<JoinHandle<()>> {
    spawn_decoder(shared, StreamKind::Audio)
}

fn spawn_decoder(shared: Arc<PipelineShared>, kind: StreamKind) -> crate::error::Result<JoinHandle<()>> {
    let result = std::thread::Builder::new()
        .name(format!("{}-decoder", kind.label()))
        .spawn(move || {
            match kind {
                StreamKind::Video => run_video(&shared),
                StreamKind::Audio => run_audio(&shared),
            }
            debug!("{} decoder finished.", kind.label());
        });
    result.map_err(|e| {
        error!("{} decoder thread exited with error: {e}", kind.label());
        Error::ThreadExited
    })
}

/// Reserves the worker's reusable output buffer. Failure is reported once
/// and ends the worker.
fn reserve_outputs<T>(shared: &PipelineShared, kind: StreamKind) -> Option<Vec<T>> {
    let mut outputs = Vec::new();
    if outputs.try_reserve(OUTPUT_BATCH).is_err() {
        let err = ResourceError::FrameAlloc(kind.label());
        error!("{err}");
        shared.events.error(err.to_string(), false);
        return None;
    }
    Some(outputs)
}

fn run_video(shared: &PipelineShared) {
    let Some(mut frames) = reserve_outputs::<VideoFrame>(shared, StreamKind::Video) else {
        return;
    };
    while let Some(packet) = next_packet(shared, StreamKind::Video) {
        decode_packet(shared, &packet, DecodedBatch::Video(&mut frames));
        for frame in frames.drain(..) {
            if !shared.events.frame(frame) {
                trace!("Frame dropped, consumer is behind");
            }
        }
    }
}

fn run_audio(shared: &PipelineShared) {
    let Some(mut chunks) = reserve_outputs::<Bytes>(shared, StreamKind::Audio) else {
        return;
    };
    while let Some(packet) = next_packet(shared, StreamKind::Audio) {
        decode_packet(shared, &packet, DecodedBatch::Audio(&mut chunks));
        for chunk in chunks.drain(..) {
            shared.audio.enqueue(chunk);
        }
    }
}

/// Blocks for the next packet of `kind`; `None` once the pipeline stops.
fn next_packet(shared: &PipelineShared, kind: StreamKind) -> Option<Packet> {
    let queue = shared.queue(kind);
    loop {
        if !shared.is_running() {
            return None;
        }
        match queue.pop(&shared.running) {
            Some(packet) => return Some(packet),
            None => {
                if !shared.is_running() {
                    return None;
                }
                std::thread::sleep(shared.config.empty_queue_backoff);
            }
        }
    }
}

/// Feeds one packet and drains every output it produced, all under the
/// decode lock. Errors skip the packet and are reported as non-fatal.
fn decode_packet(shared: &PipelineShared, packet: &Packet, batch: DecodedBatch<'_>) {
    let mut contexts = shared.lock_decoders();
    let result = match batch {
        DecodedBatch::Video(frames) => decode_video(shared, &mut contexts, packet, frames),
        DecodedBatch::Audio(chunks) => decode_audio(shared, &mut contexts, packet, chunks),
    };
    drop(contexts);

    if let Err(e) = result {
        warn!("{e}");
        shared.events.error(e.to_string(), false);
    }
}

fn decode_video(
    shared: &PipelineShared,
    contexts: &mut DecodeContexts,
    packet: &Packet,
    frames: &mut Vec<VideoFrame>,
) -> Result<(), DecodeError> {
    // no context between connections: the packet is discarded
    let Some(decoder) = contexts.video.as_mut() else {
        return Ok(());
    };
    decoder.send_packet(packet)?;
    while shared.is_running() {
        match decoder.receive_frame()? {
            Some(frame) => frames.push(frame),
            None => break,
        }
    }
    Ok(())
}

fn decode_audio(
    shared: &PipelineShared,
    contexts: &mut DecodeContexts,
    packet: &Packet,
    chunks: &mut Vec<Bytes>,
) -> Result<(), DecodeError> {
    let Some(decoder) = contexts.audio.as_mut() else {
        return Ok(());
    };
    decoder.send_packet(packet)?;
    while shared.is_running() {
        match decoder.receive_samples()? {
            Some(chunk) => chunks.push(chunk),
            None => break,
        }
    }
    Ok(())
}
