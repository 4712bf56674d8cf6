//! FFmpeg implementation of the [`backend`](crate::core::backend) contracts.
//!
//! [`FfmpegBackend`] opens network inputs through libavformat with
//! low-latency demuxer options and an interrupt callback wired to the
//! pipeline's stop flags. Video is decoded with libavcodec and converted to
//! BGRA with libswscale; audio is resampled to interleaved S16 with
//! libswresample at whatever format the output device negotiated.

mod decoder;
mod source;
mod stream_info;

pub use self::source::FfmpegSource;
pub use self::stream_info::StreamInfo;

use crate::core::backend::{Interrupt, MediaBackend, StreamSource};
use crate::core::config::OpenOptions;
use crate::error::ConnectionError;
use std::ffi::CStr;
use std::os::raw::c_char;

/// Stream source factory backed by libavformat.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        crate::core::initialize();
        Self
    }
}

impl MediaBackend for FfmpegBackend {
    fn open(
        &self,
        address: &str,
        options: &OpenOptions,
        interrupt: Interrupt,
    ) -> Result<Box<dyn StreamSource>, ConnectionError> {
        let source = FfmpegSource::open(address, options, interrupt)?;
        Ok(Box::new(source))
    }
}

pub(crate) fn init_network() {
    ffmpeg_next::format::network::init();
}

/// Human-readable text for a negative FFmpeg return code.
pub(crate) fn av_error_string(code: i32) -> String {
    let mut buf = [0 as c_char; ffmpeg_sys_next::AV_ERROR_MAX_STRING_SIZE as usize];
    // SAFETY: buf is a valid writable buffer of the advertised size and
    // av_strerror always NUL-terminates within it.
    unsafe {
        if ffmpeg_sys_next::av_strerror(code, buf.as_mut_ptr(), buf.len()) < 0 {
            return format!("Unknown error code {code}");
        }
        CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
    }
}
