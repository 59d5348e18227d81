//! Error types for the duplex voice link

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Resample error: {0}")]
    Resample(#[from] ResampleError),

    #[error("Processing stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio device errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Device disconnected: {0}")]
    Disconnected(String),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),
}

/// Sample-rate conversion errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResampleError {
    #[error("Unsupported resampling ratio {from} Hz -> {to} Hz")]
    InvalidRatio { from: u32, to: u32 },

    #[error("Input rate {actual} Hz does not match resampler rate {expected} Hz")]
    RateMismatch { expected: u32, actual: u32 },

    #[error("Resampler failed: {0}")]
    Engine(String),
}

/// Processing stage errors
#[derive(Error, Debug)]
pub enum StageError {
    #[error("No backend available for stage {0}")]
    BackendUnavailable(String),

    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Stage output has {actual} samples, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
