use std::collections::HashMap;
use std::ffi::CStr;
use std::ptr::null;

use ffmpeg_sys_next::AVMediaType::{AVMEDIA_TYPE_AUDIO, AVMEDIA_TYPE_VIDEO};
use ffmpeg_sys_next::{
    av_dict_iterate, avcodec_get_name, AVCodecID, AVDictionary, AVDictionaryEntry, AVFormatContext,
    AVRational, AVStream,
};

use crate::core::backend::{audio_frame_duration_ms, video_frame_duration_ms};

/// Metadata of one stream in an opened input.
#[derive(Debug, Clone)]
pub enum StreamInfo {
    Video {
        /// The index of the stream within the input.
        index: usize,
        time_base: AVRational,
        avg_frame_rate: AVRational,
        r_frame_rate: AVRational,
        codec_id: AVCodecID,
        codec_name: String,
        width: i32,
        height: i32,
        metadata: HashMap<String, String>,
    },
    Audio {
        index: usize,
        time_base: AVRational,
        codec_id: AVCodecID,
        codec_name: String,
        sample_rate: i32,
        nb_channels: i32,
        /// Samples per channel in one codec frame, zero when unknown.
        frame_size: i32,
        metadata: HashMap<String, String>,
    },
    /// Subtitle, data, attachment and unknown streams. Never decoded.
    Other {
        index: usize,
        metadata: HashMap<String, String>,
    },
}

impl StreamInfo {
    pub fn index(&self) -> usize {
        match self {
            StreamInfo::Video { index, .. }
            | StreamInfo::Audio { index, .. }
            | StreamInfo::Other { index, .. } => *index,
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, StreamInfo::Video { .. })
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, StreamInfo::Audio { .. })
    }

    pub fn codec_name(&self) -> Option<&str> {
        match self {
            StreamInfo::Video { codec_name, .. } | StreamInfo::Audio { codec_name, .. } => {
                Some(codec_name)
            }
            StreamInfo::Other { .. } => None,
        }
    }

    /// Playback duration of one frame in milliseconds.
    ///
    /// Video tries the average frame rate, then the real base frame rate,
    /// then the inverse time base before settling on 30 fps. Audio uses the
    /// codec frame size, assuming 1024 samples when it is not reported.
    pub fn frame_duration_ms(&self) -> f64 {
        match self {
            StreamInfo::Video {
                avg_frame_rate,
                r_frame_rate,
                time_base,
                ..
            } => {
                let mut fps = q2d(*avg_frame_rate);
                if fps < 1.0 {
                    fps = q2d(*r_frame_rate);
                }
                if fps < 1.0 && time_base.num != 0 && time_base.den != 0 {
                    fps = 1.0 / q2d(*time_base);
                }
                video_frame_duration_ms(fps)
            }
            StreamInfo::Audio {
                frame_size,
                sample_rate,
                ..
            } => audio_frame_duration_ms((*frame_size).max(0) as u32, (*sample_rate).max(0) as u32),
            StreamInfo::Other { .. } => 0.0,
        }
    }
}

fn q2d(rational: AVRational) -> f64 {
    if rational.den == 0 {
        0.0
    } else {
        rational.num as f64 / rational.den as f64
    }
}

/// Extracts a `StreamInfo` from a single raw `AVStream` pointer.
///
/// # Safety
/// The caller must ensure `raw_stream` is a valid, non-null pointer to an `AVStream`.
unsafe fn extract_stream_info_from_stream(raw_stream: *mut AVStream) -> StreamInfo {
    let stream = &*raw_stream;
    let metadata = dict_to_hashmap(stream.metadata);
    let index = stream.index.max(0) as usize;

    if stream.codecpar.is_null() {
        return StreamInfo::Other { index, metadata };
    }

    let codecpar = &*stream.codecpar;
    let codec_id = codecpar.codec_id;

    match codecpar.codec_type {
        AVMEDIA_TYPE_VIDEO => StreamInfo::Video {
            index,
            time_base: stream.time_base,
            avg_frame_rate: stream.avg_frame_rate,
            r_frame_rate: stream.r_frame_rate,
            codec_id,
            codec_name: codec_name(codec_id),
            width: codecpar.width,
            height: codecpar.height,
            metadata,
        },
        AVMEDIA_TYPE_AUDIO => StreamInfo::Audio {
            index,
            time_base: stream.time_base,
            codec_id,
            codec_name: codec_name(codec_id),
            sample_rate: codecpar.sample_rate,
            nb_channels: codecpar.ch_layout.nb_channels,
            frame_size: codecpar.frame_size,
            metadata,
        },
        _ => StreamInfo::Other { index, metadata },
    }
}

/// Collects metadata for every stream of an opened input.
///
/// # Safety
/// `fmt_ctx` must be a valid `AVFormatContext` that has completed
/// `avformat_open_input` and `avformat_find_stream_info`.
pub(crate) unsafe fn extract_stream_infos(fmt_ctx: *const AVFormatContext) -> Vec<StreamInfo> {
    let fmt_ctx = &*fmt_ctx;
    if fmt_ctx.streams.is_null() {
        return Vec::new();
    }
    let mut infos = Vec::with_capacity(fmt_ctx.nb_streams as usize);
    for i in 0..fmt_ctx.nb_streams as usize {
        let raw_stream = *fmt_ctx.streams.add(i);
        if raw_stream.is_null() {
            continue;
        }
        infos.push(extract_stream_info_from_stream(raw_stream));
    }
    infos
}

fn codec_name(id: AVCodecID) -> String {
    // SAFETY: avcodec_get_name is a pure lookup that returns a static string
    // pointer for any AVCodecID value. We null-check before dereferencing.
    unsafe {
        let ptr = avcodec_get_name(id);
        if ptr.is_null() {
            "Unknown codec".into()
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

fn dict_to_hashmap(dict: *mut AVDictionary) -> HashMap<String, String> {
    if dict.is_null() {
        return HashMap::new();
    }
    let mut map = HashMap::new();
    // SAFETY: dict is non-null (checked above). av_dict_iterate returns
    // entries with valid key/value C strings until it returns null.
    unsafe {
        let mut e: *const AVDictionaryEntry = null();
        while {
            e = av_dict_iterate(dict, e);
            !e.is_null()
        } {
            let k = CStr::from_ptr((*e).key).to_string_lossy().into_owned();
            let v = CStr::from_ptr((*e).value).to_string_lossy().into_owned();
            map.insert(k, v);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg_sys_next::AVCodecID::{AV_CODEC_ID_AAC, AV_CODEC_ID_H264};

    fn video(avg: (i32, i32), real: (i32, i32), time_base: (i32, i32)) -> StreamInfo {
        StreamInfo::Video {
            index: 0,
            time_base: AVRational {
                num: time_base.0,
                den: time_base.1,
            },
            avg_frame_rate: AVRational {
                num: avg.0,
                den: avg.1,
            },
            r_frame_rate: AVRational {
                num: real.0,
                den: real.1,
            },
            codec_id: AV_CODEC_ID_H264,
            codec_name: "h264".into(),
            width: 1280,
            height: 720,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_video_frame_duration_fallbacks() {
        assert!((video((25, 1), (0, 0), (1, 90000)).frame_duration_ms() - 40.0).abs() < 1e-9);
        assert!((video((0, 0), (50, 1), (1, 90000)).frame_duration_ms() - 20.0).abs() < 1e-9);
        assert!((video((0, 0), (0, 1), (1, 20)).frame_duration_ms() - 50.0).abs() < 1e-9);
        let fallback = video((0, 0), (0, 0), (1, 90000)).frame_duration_ms();
        assert!((fallback - 1000.0 / 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_audio_frame_duration() {
        let audio = StreamInfo::Audio {
            index: 1,
            time_base: AVRational { num: 1, den: 44100 },
            codec_id: AV_CODEC_ID_AAC,
            codec_name: "aac".into(),
            sample_rate: 44100,
            nb_channels: 2,
            frame_size: 0,
            metadata: HashMap::new(),
        };
        assert!((audio.frame_duration_ms() - 1000.0 * 1024.0 / 44100.0).abs() < 1e-9);
        assert!(audio.is_audio());
        assert_eq!(audio.index(), 1);
        assert_eq!(audio.codec_name(), Some("aac"));
    }

    #[test]
    fn test_codec_name_lookup() {
        assert_eq!(codec_name(AV_CODEC_ID_H264), "h264");
    }
}
