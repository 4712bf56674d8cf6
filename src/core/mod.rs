//! The **Core** module holds the pipeline itself: packet queues, the ingest,
//! decode, pacer and stats workers, reconnect handling and the
//! [`LivePlayer`](player::LivePlayer) facade.
//!
//! The core never links against a codec library. Stream access, decoding and
//! audio output come in through the traits in [`backend`]; the FFmpeg
//! implementation of those traits lives in [`crate::ffmpeg`].
//!
//! # Threads
//!
//! | Thread | Role |
//! |--------|------|
//! | `ingest:<scheme>` | Opens the source, reads packets, routes them, reconnects |
//! | `video-decoder` | Decodes video packets into BGRA frames |
//! | `audio-decoder` | Decodes and resamples audio into PCM chunks |
//! | `audio-pacer` | Hands pending PCM to the output device as space frees up |
//! | `stats` | Publishes a stats snapshot every interval |
//! | `player-shutdown` | Runs a stop requested without blocking |

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod packet;
pub mod packet_queue;
pub mod player;
pub mod reconnect;
pub(crate) mod scheduler;
pub mod single_flight;
pub mod stats;

use std::sync::Once;

static INIT: Once = Once::new();

/// Performs process-wide library initialisation exactly once.
///
/// Safe to call from any thread any number of times. There is no matching
/// teardown; the initialised state lives for the rest of the process.
pub fn initialize() {
    INIT.call_once(|| {
        #[cfg(feature = "ffmpeg")]
        crate::ffmpeg::init_network();
        log::debug!("Live player core initialised");
    });
}
