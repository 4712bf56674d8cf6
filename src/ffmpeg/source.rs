use std::ffi::{c_void, CString};
use std::os::raw::c_int;
use std::ptr::{null, null_mut};
use std::time::Duration;

use bytes::Bytes;
use ffmpeg_sys_next::{
    av_dict_free, av_dict_set, av_packet_alloc, av_packet_free, av_packet_unref, av_read_frame,
    avformat_alloc_context, avformat_close_input, avformat_find_stream_info, avformat_open_input,
    AVCodecParameters, AVFormatContext, AVPacket, AVERROR, AVERROR_EOF, AVFMT_FLAG_NOBUFFER,
    AV_NOPTS_VALUE, AV_PKT_FLAG_KEY, EAGAIN,
};
use log::{debug, info};

use crate::core::backend::{
    AudioDecoder, AudioFormat, AudioStreamParams, Interrupt, StreamSource, VideoDecoder,
    VideoStreamParams, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE,
};
use crate::core::config::OpenOptions;
use crate::core::packet::Packet;
use crate::error::{ConnectionError, ResourceError};
use crate::ffmpeg::decoder::{FfmpegAudioDecoder, FfmpegVideoDecoder};
use crate::ffmpeg::stream_info::{extract_stream_infos, StreamInfo};
use crate::ffmpeg::av_error_string;

const EAGAIN_BACKOFF: Duration = Duration::from_millis(10);

/// A network input opened through libavformat.
///
/// Owns the format context, a reusable read packet and the boxed
/// [`Interrupt`] the context's interrupt callback points at.
pub struct FfmpegSource {
    fmt_ctx: *mut AVFormatContext,
    pkt: *mut AVPacket,
    // Referenced by fmt_ctx.interrupt_callback.opaque; must outlive fmt_ctx.
    interrupt: Box<Interrupt>,
    streams: Vec<StreamInfo>,
    video: VideoStreamParams,
    audio: Option<AudioStreamParams>,
}

// SAFETY: FfmpegSource owns its AVFormatContext and AVPacket exclusively and
// is only ever moved into the ingest thread, never shared. The interrupt
// callback reads a heap-pinned `Interrupt`, which is Send + Sync.
unsafe impl Send for FfmpegSource {}

unsafe extern "C" fn interrupt_cb(opaque: *mut c_void) -> c_int {
    if opaque.is_null() {
        return 0;
    }
    // SAFETY: opaque was set to the address of the source's boxed Interrupt,
    // which lives until after avformat_close_input.
    let interrupt = &*(opaque as *const Interrupt);
    c_int::from(interrupt.should_abort())
}

impl FfmpegSource {
    /// Opens `address` with `options`, probes its streams and selects the
    /// first video and first audio stream.
    pub fn open(
        address: &str,
        options: &OpenOptions,
        interrupt: Interrupt,
    ) -> Result<Self, ConnectionError> {
        let url = CString::new(address)
            .map_err(|_| ConnectionError::OpenInput("URL contains a NUL byte".into()))?;
        let interrupt = Box::new(interrupt);

        // SAFETY: Every allocation is released on each error path. On failure
        // avformat_open_input frees the context and nulls the pointer, so the
        // following avformat_close_input is a no-op.
        unsafe {
            let mut fmt_ctx = avformat_alloc_context();
            if fmt_ctx.is_null() {
                return Err(ConnectionError::OpenInput(av_error_string(AVERROR(
                    ffmpeg_sys_next::ENOMEM,
                ))));
            }
            (*fmt_ctx).flags |= AVFMT_FLAG_NOBUFFER as c_int;
            (*fmt_ctx).interrupt_callback.callback = Some(interrupt_cb);
            (*fmt_ctx).interrupt_callback.opaque = &*interrupt as *const Interrupt as *mut c_void;

            let mut format_opts = null_mut();
            for (key, value) in options.entries() {
                let (Ok(key), Ok(value)) = (CString::new(key), CString::new(value)) else {
                    continue;
                };
                av_dict_set(&mut format_opts, key.as_ptr(), value.as_ptr(), 0);
            }

            let ret = avformat_open_input(&mut fmt_ctx, url.as_ptr(), null(), &mut format_opts);
            av_dict_free(&mut format_opts);
            if ret < 0 {
                avformat_close_input(&mut fmt_ctx);
                if interrupt.should_abort() {
                    return Err(ConnectionError::Interrupted);
                }
                return Err(ConnectionError::OpenInput(av_error_string(ret)));
            }

            let ret = avformat_find_stream_info(fmt_ctx, null_mut());
            if ret < 0 {
                avformat_close_input(&mut fmt_ctx);
                if interrupt.should_abort() {
                    return Err(ConnectionError::Interrupted);
                }
                return Err(ConnectionError::FindStreamInfo(av_error_string(ret)));
            }

            let streams = extract_stream_infos(fmt_ctx);
            let Some(video) = streams.iter().find(|s| s.is_video()).map(video_params) else {
                avformat_close_input(&mut fmt_ctx);
                return Err(ConnectionError::NoVideoStream);
            };
            let audio = streams.iter().find(|s| s.is_audio()).map(audio_params);

            let pkt = av_packet_alloc();
            if pkt.is_null() {
                avformat_close_input(&mut fmt_ctx);
                return Err(ConnectionError::OpenInput(av_error_string(AVERROR(
                    ffmpeg_sys_next::ENOMEM,
                ))));
            }

            info!(
                "Opened {address}: video #{} {}, audio {}",
                video.index,
                streams.get(video.index).and_then(StreamInfo::codec_name).unwrap_or("?"),
                audio
                    .as_ref()
                    .and_then(|a| streams.get(a.index))
                    .and_then(StreamInfo::codec_name)
                    .unwrap_or("none"),
            );

            Ok(Self {
                fmt_ctx,
                pkt,
                interrupt,
                streams,
                video,
                audio,
            })
        }
    }

    /// Metadata of every stream in the input, selected or not.
    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn codecpar(&self, index: usize) -> Option<*const AVCodecParameters> {
        // SAFETY: fmt_ctx is valid for the lifetime of self and index comes
        // from the stream list extracted from it.
        unsafe {
            let fmt_ctx = &*self.fmt_ctx;
            if index >= fmt_ctx.nb_streams as usize {
                return None;
            }
            let stream = *fmt_ctx.streams.add(index);
            if stream.is_null() || (*stream).codecpar.is_null() {
                return None;
            }
            Some((*stream).codecpar as *const AVCodecParameters)
        }
    }
}

fn video_params(info: &StreamInfo) -> VideoStreamParams {
    let (width, height) = match info {
        StreamInfo::Video { width, height, .. } => (*width, *height),
        _ => (0, 0),
    };
    VideoStreamParams {
        index: info.index(),
        width: width.max(0) as u32,
        height: height.max(0) as u32,
        frame_duration_ms: info.frame_duration_ms(),
    }
}

fn audio_params(info: &StreamInfo) -> AudioStreamParams {
    let (sample_rate, channels) = match info {
        StreamInfo::Audio {
            sample_rate,
            nb_channels,
            ..
        } => (*sample_rate, *nb_channels),
        _ => (0, 0),
    };
    let sample_rate = if sample_rate > 0 {
        sample_rate as u32
    } else {
        DEFAULT_SAMPLE_RATE
    };
    let channels = if channels > 0 {
        channels as u16
    } else {
        DEFAULT_CHANNELS
    };
    AudioStreamParams {
        index: info.index(),
        requested: AudioFormat::new(sample_rate, channels),
        frame_duration_ms: info.frame_duration_ms(),
    }
}

impl StreamSource for FfmpegSource {
    fn video_stream(&self) -> &VideoStreamParams {
        &self.video
    }

    fn audio_stream(&self) -> Option<&AudioStreamParams> {
        self.audio.as_ref()
    }

    fn read_packet(&mut self) -> Result<Packet, ConnectionError> {
        // SAFETY: self.pkt is a valid, non-null AVPacket allocated in open().
        // av_packet_unref resets it for reuse; av_read_frame fills it. The
        // payload is copied out before the next unref.
        unsafe {
            av_packet_unref(self.pkt);

            loop {
                let ret = av_read_frame(self.fmt_ctx, self.pkt);
                if ret == AVERROR(EAGAIN) {
                    if self.interrupt.should_abort() {
                        return Err(ConnectionError::Interrupted);
                    }
                    std::thread::sleep(EAGAIN_BACKOFF);
                    continue;
                }
                if ret == AVERROR_EOF {
                    return Err(ConnectionError::EndOfStream);
                }
                if ret < 0 {
                    if self.interrupt.should_abort() {
                        return Err(ConnectionError::Interrupted);
                    }
                    return Err(ConnectionError::ReadPacket(av_error_string(ret)));
                }
                break;
            }

            let pkt = &*self.pkt;
            let data = if pkt.data.is_null() || pkt.size <= 0 {
                Bytes::new()
            } else {
                Bytes::copy_from_slice(std::slice::from_raw_parts(pkt.data, pkt.size as usize))
            };
            let pts = (pkt.pts != AV_NOPTS_VALUE).then_some(pkt.pts);
            let dts = (pkt.dts != AV_NOPTS_VALUE).then_some(pkt.dts);

            Ok(Packet::new(pkt.stream_index.max(0) as usize, data)
                .with_timestamps(pts, dts, pkt.duration)
                .with_keyframe(pkt.flags & AV_PKT_FLAG_KEY as c_int != 0))
        }
    }

    fn open_video_decoder(&mut self) -> Result<Box<dyn VideoDecoder>, ResourceError> {
        let codecpar = self
            .codecpar(self.video.index)
            .ok_or(ResourceError::DecoderUnavailable("video"))?;
        // SAFETY: codecpar points into fmt_ctx, which outlives this call; the
        // decoder copies the parameters and keeps no reference to them.
        let decoder = unsafe { FfmpegVideoDecoder::open(codecpar)? };
        Ok(Box::new(decoder))
    }

    fn open_audio_decoder(
        &mut self,
        output: AudioFormat,
    ) -> Result<Box<dyn AudioDecoder>, ResourceError> {
        let index = self
            .audio
            .as_ref()
            .map(|a| a.index)
            .ok_or(ResourceError::DecoderUnavailable("audio"))?;
        let codecpar = self
            .codecpar(index)
            .ok_or(ResourceError::DecoderUnavailable("audio"))?;
        // SAFETY: same as the video decoder above.
        let decoder = unsafe { FfmpegAudioDecoder::open(codecpar, output)? };
        Ok(Box::new(decoder))
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        // SAFETY: both pointers were allocated in open() and are released
        // exactly once here. The boxed interrupt is dropped after this body.
        unsafe {
            av_packet_free(&mut self.pkt);
            avformat_close_input(&mut self.fmt_ctx);
        }
        debug!("Stream source closed");
    }
}
