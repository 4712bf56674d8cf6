use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Worker thread exited unexpectedly")]
    ThreadExited,
}

impl Error {
    /// Connection and decode errors are absorbed by the pipeline (retry or
    /// skip); everything else ends the current attempt or is rejected outright.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Decode(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Failed to open stream: {0}")]
    OpenInput(String),

    #[error("Failed to retrieve stream info: {0}")]
    FindStreamInfo(String),

    #[error("No video stream found")]
    NoVideoStream,

    #[error("Failed to read packet: {0}")]
    ReadPacket(String),

    #[error("End of stream")]
    EndOfStream,

    #[error("Blocking I/O was interrupted")]
    Interrupted,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Failed to submit packet to decoder: {0}")]
    SendPacket(String),

    #[error("Error while decoding {kind} frame: {reason}")]
    ReceiveFrame { kind: &'static str, reason: String },

    #[error("Failed to convert decoded {kind} frame: {reason}")]
    Convert { kind: &'static str, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Failed to allocate {0} frame")]
    FrameAlloc(&'static str),

    #[error("Unsupported {0} codec")]
    DecoderUnavailable(&'static str),

    #[error("Unable to open {kind} codec: {reason}")]
    CodecOpen { kind: &'static str, reason: String },

    #[error("Failed to create scaler context: {0}")]
    ScalerInit(String),

    #[error("Failed to initialise audio resampler: {0}")]
    ResamplerInit(String),

    #[error("Audio output initialisation failed: {0}")]
    AudioOutputUnavailable(String),

    #[error("Out of memory")]
    OutOfMemory,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Stream URL is empty.")]
    EmptyAddress,

    #[error("Stream URL is invalid: {0}")]
    InvalidAddress(String),

    #[error("Queue capacity for {0} packets must be greater than zero")]
    InvalidQueueCapacity(&'static str),
}
