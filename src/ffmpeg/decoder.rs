use std::os::raw::c_int;
use std::ptr::{null, null_mut};

use bytes::Bytes;
use ffmpeg_sys_next::AVPixelFormat::AV_PIX_FMT_BGRA;
use ffmpeg_sys_next::AVSampleFormat::AV_SAMPLE_FMT_S16;
use ffmpeg_sys_next::{
    av_channel_layout_copy, av_channel_layout_default, av_channel_layout_uninit, av_frame_alloc,
    av_frame_free, av_frame_unref, av_new_packet, av_packet_alloc, av_packet_free,
    av_packet_unref, av_samples_get_buffer_size, avcodec_alloc_context3, avcodec_find_decoder,
    avcodec_free_context, avcodec_open2, avcodec_parameters_to_context, avcodec_receive_frame,
    avcodec_send_packet, sws_freeContext, sws_getCachedContext, sws_scale, swr_alloc_set_opts2,
    swr_convert, swr_free, swr_get_out_samples, swr_init, AVChannelLayout, AVCodecContext,
    AVCodecParameters, AVFrame, AVPacket, SwrContext, SwsContext, AVERROR, AVERROR_EOF,
    AV_CODEC_FLAG_LOW_DELAY, AV_NOPTS_VALUE, AV_PKT_FLAG_KEY, EAGAIN, FF_THREAD_FRAME,
    SWS_BILINEAR,
};

use crate::core::backend::{AudioDecoder, AudioFormat, VideoDecoder, VideoFrame};
use crate::core::packet::Packet;
use crate::error::{DecodeError, ResourceError};
use crate::ffmpeg::av_error_string;

/// Decode context plus reusable frame and packet, shared by both decoders.
struct CodecContext {
    kind: &'static str,
    codec_ctx: *mut AVCodecContext,
    frame: *mut AVFrame,
    pkt: *mut AVPacket,
}

enum Received {
    Frame,
    NeedsInput,
}

impl CodecContext {
    /// # Safety
    /// `codecpar` must point to valid codec parameters for the duration of
    /// the call.
    unsafe fn open(
        kind: &'static str,
        codecpar: *const AVCodecParameters,
        configure: impl FnOnce(&mut AVCodecContext),
    ) -> Result<Self, ResourceError> {
        let codec = avcodec_find_decoder((*codecpar).codec_id);
        if codec.is_null() {
            return Err(ResourceError::DecoderUnavailable(kind));
        }

        let mut codec_ctx = avcodec_alloc_context3(codec);
        if codec_ctx.is_null() {
            return Err(ResourceError::OutOfMemory);
        }
        let ret = avcodec_parameters_to_context(codec_ctx, codecpar);
        if ret < 0 {
            avcodec_free_context(&mut codec_ctx);
            return Err(ResourceError::CodecOpen {
                kind,
                reason: av_error_string(ret),
            });
        }
        configure(&mut *codec_ctx);

        let ret = avcodec_open2(codec_ctx, codec, null_mut());
        if ret < 0 {
            avcodec_free_context(&mut codec_ctx);
            return Err(ResourceError::CodecOpen {
                kind,
                reason: av_error_string(ret),
            });
        }

        let mut frame = av_frame_alloc();
        let mut pkt = av_packet_alloc();
        if frame.is_null() || pkt.is_null() {
            av_frame_free(&mut frame);
            av_packet_free(&mut pkt);
            avcodec_free_context(&mut codec_ctx);
            return Err(ResourceError::FrameAlloc(kind));
        }

        Ok(Self {
            kind,
            codec_ctx,
            frame,
            pkt,
        })
    }

    fn send(&mut self, packet: &Packet) -> Result<(), DecodeError> {
        // SAFETY: pkt and codec_ctx are valid for the lifetime of self.
        // av_new_packet allocates a padded buffer of at least `size` bytes,
        // into which exactly `size` bytes are copied.
        unsafe {
            av_packet_unref(self.pkt);
            let size = packet.size();
            let ret = av_new_packet(self.pkt, size as c_int);
            if ret < 0 {
                return Err(DecodeError::SendPacket(av_error_string(ret)));
            }
            if size > 0 {
                std::ptr::copy_nonoverlapping(packet.data().as_ptr(), (*self.pkt).data, size);
            }
            let pkt = &mut *self.pkt;
            pkt.stream_index = packet.stream_index() as c_int;
            pkt.pts = packet.pts().unwrap_or(AV_NOPTS_VALUE);
            pkt.dts = packet.dts().unwrap_or(AV_NOPTS_VALUE);
            pkt.duration = packet.duration();
            if packet.is_keyframe() {
                pkt.flags |= AV_PKT_FLAG_KEY as c_int;
            }

            let ret = avcodec_send_packet(self.codec_ctx, self.pkt);
            av_packet_unref(self.pkt);
            if ret < 0 && ret != AVERROR_EOF {
                return Err(DecodeError::SendPacket(av_error_string(ret)));
            }
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Received, DecodeError> {
        // SAFETY: frame and codec_ctx are valid for the lifetime of self.
        unsafe {
            av_frame_unref(self.frame);
            let ret = avcodec_receive_frame(self.codec_ctx, self.frame);
            if ret == AVERROR(EAGAIN) || ret == AVERROR_EOF {
                return Ok(Received::NeedsInput);
            }
            if ret < 0 {
                return Err(DecodeError::ReceiveFrame {
                    kind: self.kind,
                    reason: av_error_string(ret),
                });
            }
        }
        Ok(Received::Frame)
    }
}

impl Drop for CodecContext {
    fn drop(&mut self) {
        // SAFETY: all three were allocated in open() and are freed once here.
        unsafe {
            av_frame_free(&mut self.frame);
            av_packet_free(&mut self.pkt);
            avcodec_free_context(&mut self.codec_ctx);
        }
    }
}

/// Low-delay video decoder converting every picture to BGRA at source size.
pub(crate) struct FfmpegVideoDecoder {
    codec: CodecContext,
    sws: *mut SwsContext,
}

// SAFETY: the decoder exclusively owns its codec and scaler contexts. It is
// moved between threads but only used under the pipeline's decode lock.
unsafe impl Send for FfmpegVideoDecoder {}

impl FfmpegVideoDecoder {
    /// # Safety
    /// `codecpar` must point to valid video codec parameters for the
    /// duration of the call.
    pub(crate) unsafe fn open(codecpar: *const AVCodecParameters) -> Result<Self, ResourceError> {
        let codec = CodecContext::open("video", codecpar, |ctx| {
            ctx.flags |= AV_CODEC_FLAG_LOW_DELAY as c_int;
            ctx.thread_type = FF_THREAD_FRAME as c_int;
            ctx.thread_count = 1;
        })?;

        let ctx = &*codec.codec_ctx;
        let sws = sws_getCachedContext(
            null_mut(),
            ctx.width,
            ctx.height,
            ctx.pix_fmt,
            ctx.width,
            ctx.height,
            AV_PIX_FMT_BGRA,
            SWS_BILINEAR as c_int,
            null_mut(),
            null_mut(),
            null(),
        );
        if sws.is_null() {
            return Err(ResourceError::ScalerInit(format!(
                "{}x{} {:?} to BGRA",
                ctx.width, ctx.height, ctx.pix_fmt
            )));
        }

        Ok(Self { codec, sws })
    }

    /// Scales the current frame into a tightly packed BGRA buffer.
    fn convert(&mut self) -> Result<VideoFrame, DecodeError> {
        // SAFETY: frame holds a decoded picture (checked by the caller).
        // sws_getCachedContext returns either the existing context or a new
        // one after freeing the old; the destination buffer holds exactly
        // `stride * height` bytes as announced to sws_scale.
        unsafe {
            let ctx = &*self.codec.codec_ctx;
            let frame = &*self.codec.frame;
            let (width, height) = (frame.width, frame.height);
            if width <= 0 || height <= 0 {
                return Err(DecodeError::Convert {
                    kind: "video",
                    reason: format!("invalid frame size {width}x{height}"),
                });
            }

            self.sws = sws_getCachedContext(
                self.sws,
                width,
                height,
                ctx.pix_fmt,
                width,
                height,
                AV_PIX_FMT_BGRA,
                SWS_BILINEAR as c_int,
                null_mut(),
                null_mut(),
                null(),
            );
            if self.sws.is_null() {
                return Err(DecodeError::Convert {
                    kind: "video",
                    reason: "scaler unavailable for frame format".into(),
                });
            }

            let stride = width as usize * 4;
            let mut buffer = vec![0u8; stride * height as usize];
            let dst_data: [*mut u8; 4] = [buffer.as_mut_ptr(), null_mut(), null_mut(), null_mut()];
            let dst_linesize: [c_int; 4] = [stride as c_int, 0, 0, 0];

            let rows = sws_scale(
                self.sws,
                frame.data.as_ptr() as _,
                frame.linesize.as_ptr(),
                0,
                height,
                dst_data.as_ptr() as _,
                dst_linesize.as_ptr(),
            );
            if rows <= 0 {
                return Err(DecodeError::Convert {
                    kind: "video",
                    reason: av_error_string(rows),
                });
            }

            Ok(VideoFrame::new(
                width as u32,
                height as u32,
                stride,
                Bytes::from(buffer),
            ))
        }
    }
}

impl VideoDecoder for FfmpegVideoDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), DecodeError> {
        self.codec.send(packet)
    }

    fn receive_frame(&mut self) -> Result<Option<VideoFrame>, DecodeError> {
        match self.codec.receive()? {
            Received::NeedsInput => Ok(None),
            Received::Frame => self.convert().map(Some),
        }
    }
}

impl Drop for FfmpegVideoDecoder {
    fn drop(&mut self) {
        // SAFETY: sws was created in open() or replaced by
        // sws_getCachedContext; sws_freeContext accepts null.
        unsafe { sws_freeContext(self.sws) }
    }
}

/// Audio decoder resampling to interleaved S16 at the negotiated output
/// format.
pub(crate) struct FfmpegAudioDecoder {
    codec: CodecContext,
    swr: *mut SwrContext,
    output: AudioFormat,
}

// SAFETY: see FfmpegVideoDecoder.
unsafe impl Send for FfmpegAudioDecoder {}

impl FfmpegAudioDecoder {
    /// # Safety
    /// `codecpar` must point to valid audio codec parameters for the
    /// duration of the call.
    pub(crate) unsafe fn open(
        codecpar: *const AVCodecParameters,
        output: AudioFormat,
    ) -> Result<Self, ResourceError> {
        if !output.is_valid() {
            return Err(ResourceError::ResamplerInit(format!(
                "invalid output format {}Hz/{}ch",
                output.sample_rate, output.channels
            )));
        }
        let codec = CodecContext::open("audio", codecpar, |ctx| {
            ctx.request_sample_fmt = AV_SAMPLE_FMT_S16;
        })?;

        let ctx = &*codec.codec_ctx;
        let mut in_layout: AVChannelLayout = std::mem::zeroed();
        let mut out_layout: AVChannelLayout = std::mem::zeroed();
        if ctx.ch_layout.nb_channels > 0 {
            av_channel_layout_copy(&mut in_layout, &ctx.ch_layout);
        } else {
            av_channel_layout_default(&mut in_layout, output.channels as c_int);
        }
        av_channel_layout_default(&mut out_layout, output.channels as c_int);
        let in_rate = if ctx.sample_rate > 0 {
            ctx.sample_rate
        } else {
            output.sample_rate as c_int
        };

        let mut swr: *mut SwrContext = null_mut();
        let mut ret = swr_alloc_set_opts2(
            &mut swr,
            &out_layout,
            AV_SAMPLE_FMT_S16,
            output.sample_rate as c_int,
            &in_layout,
            ctx.sample_fmt,
            in_rate,
            0,
            null_mut(),
        );
        if ret >= 0 {
            ret = swr_init(swr);
        }
        av_channel_layout_uninit(&mut in_layout);
        av_channel_layout_uninit(&mut out_layout);
        if ret < 0 {
            swr_free(&mut swr);
            return Err(ResourceError::ResamplerInit(av_error_string(ret)));
        }

        Ok(Self { codec, swr, output })
    }

    /// Resamples the current frame. `None` when nothing came out.
    fn convert(&mut self) -> Option<Bytes> {
        let channels = self.output.channels as c_int;
        // SAFETY: frame holds decoded samples (checked by the caller). The
        // output buffer is sized by av_samples_get_buffer_size for
        // `max_samples`, which bounds what swr_convert may write.
        unsafe {
            let frame = &*self.codec.frame;
            let max_samples = swr_get_out_samples(self.swr, frame.nb_samples);
            if max_samples <= 0 {
                return None;
            }
            let size =
                av_samples_get_buffer_size(null_mut(), channels, max_samples, AV_SAMPLE_FMT_S16, 1);
            if size <= 0 {
                return None;
            }

            let mut buffer = vec![0u8; size as usize];
            let mut out: [*mut u8; 1] = [buffer.as_mut_ptr()];
            let converted = swr_convert(
                self.swr,
                out.as_mut_ptr() as _,
                max_samples,
                frame.extended_data as _,
                frame.nb_samples,
            );
            if converted <= 0 {
                return None;
            }
            buffer.truncate(converted as usize * channels as usize * 2);
            Some(Bytes::from(buffer))
        }
    }
}

impl AudioDecoder for FfmpegAudioDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), DecodeError> {
        self.codec.send(packet)
    }

    fn receive_samples(&mut self) -> Result<Option<Bytes>, DecodeError> {
        loop {
            match self.codec.receive()? {
                Received::NeedsInput => return Ok(None),
                Received::Frame => {
                    if let Some(samples) = self.convert() {
                        return Ok(Some(samples));
                    }
                }
            }
        }
    }
}

impl Drop for FfmpegAudioDecoder {
    fn drop(&mut self) {
        // SAFETY: swr was initialised in open(); swr_free nulls the pointer.
        unsafe { swr_free(&mut self.swr) }
    }
}
