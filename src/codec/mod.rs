//! Speech codec for the link
//!
//! Opus in VOIP mode, mono, at the processing rate. One [`SpeechEncoder`]
//! per send pipeline and one [`SpeechDecoder`] per receive pipeline; each
//! packet holds exactly one frame.

pub mod decoder;
pub mod encoder;

pub use decoder::SpeechDecoder;
pub use encoder::SpeechEncoder;

/// Largest packet a single Opus frame can produce
pub const MAX_OPUS_PACKET: usize = 1275;
