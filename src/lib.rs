//! # ez-live-player
//!
//! A low-latency pull player core for live network streams (RTSP, RTMP, SRT,
//! HTTP-FLV and anything else the stream source can open).
//!
//! One ingest thread reads packets and routes them into two bounded packet
//! queues that double as jitter buffers. A video and an audio decode thread
//! drain them; decoded frames are delivered as events and decoded audio is
//! paced into the output device. Dropped connections are retried with a
//! configurable budget, and stopping is idempotent and single-flight.
//!
//! ```rust,ignore
//! use ez_live_player::ffmpeg::FfmpegBackend;
//! use ez_live_player::{LivePlayer, PlayerConfig, PlayerEvent};
//!
//! let player = LivePlayer::new(PlayerConfig::default(), FfmpegBackend::new())?;
//! let events = player.events();
//! player.start("rtsp://192.168.1.10:554/live")?;
//!
//! for event in events.iter() {
//!     match event {
//!         PlayerEvent::FrameReady(frame) => { /* draw frame.data() */ }
//!         PlayerEvent::StatusChanged(status) => println!("{status}"),
//!         PlayerEvent::StatsUpdated(stats) => println!("{:.0} kbps", stats.incoming_bitrate_kbps),
//!         PlayerEvent::ErrorOccurred { message, .. } => eprintln!("{message}"),
//!     }
//! }
//! ```
//!
//! ## Features
//!
//! - `ffmpeg`: the FFmpeg-backed stream source and decoders.
//! - `static`: link FFmpeg statically.
//! - `async`: [`ShutdownTicket`] implements `Future`.

pub mod core;
pub mod error;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use self::core::backend::{
    AudioDecoder, AudioFormat, AudioSink, AudioStreamParams, Interrupt, MediaBackend,
    StreamSource, VideoDecoder, VideoFrame, VideoStreamParams,
};
pub use self::core::config::{OpenOptions, PlayerConfig, QueueConfig};
pub use self::core::dispatcher::{
    owner_context, Dispatcher, InlineDispatcher, OwnerContext, QueuedDispatcher,
};
pub use self::core::events::{PlayerEvent, PlayerStatus};
pub use self::core::packet::{Packet, StreamKind};
pub use self::core::packet_queue::{OverflowPolicy, PacketQueue};
pub use self::core::player::{LivePlayer, LivePlayerBuilder};
pub use self::core::single_flight::ShutdownTicket;
pub use self::core::stats::PlayerStats;
pub use self::error::{Error, Result};
