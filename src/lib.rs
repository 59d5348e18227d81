//! # Voice Duplex
//!
//! Low-latency two-way speech between two nodes over UDP, with a switchable
//! processing stage on the outgoing audio.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── NODE A ────────────────────────────────┐
//! │                                                                        │
//! │  Microphone ──► CaptureQueue ──► Send pipeline                         │
//! │  (cpal, 48k)    (drop oldest)    ┌──────────┐ ┌───────────┐ ┌───────┐  │
//! │                                  │ resample │►│ active    │►│ Opus  │──┼──► UDP a_to_b
//! │                                  │ 48k→16k  │ │ stage     │ │ enc.  │  │
//! │                                  └──────────┘ └───────────┘ └───────┘  │
//! │                                        ▲                               │
//! │                           ActiveStage ─┘ (toggle: Enter)               │
//! │                                                                        │
//! │  Speaker ◄── PlaybackBuffer ◄── Receive pipeline                       │
//! │  (cpal, 48k)  (jitter, priming)  ┌──────────┐ ┌───────┐ ┌──────────┐   │
//! │                                  │ resample │◄│ Opus  │◄│ sequence │◄──┼─── UDP b_to_a
//! │                                  │ 16k→48k  │ │ dec.  │ │ check    │   │
//! │                                  └──────────┘ └───────┘ └──────────┘   │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Node B is the mirror image: it sends on `b_to_a` and listens on `a_to_b`.
//! The processing stage is one of Bypass, NeuralDenoise or ClassicalFilter;
//! the operator cycles through them at runtime.

pub mod audio;
pub mod codec;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod network;
pub mod protocol;
pub mod stage;

pub use config::AppConfig;
pub use engine::DuplexEngine;
pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Port that always carries A -> B audio
    pub const DEFAULT_A_TO_B_PORT: u16 = 9999;

    /// Port that always carries B -> A audio
    pub const DEFAULT_B_TO_A_PORT: u16 = 9998;

    /// Requested SO_RCVBUF for the receive socket
    pub const DEFAULT_RECV_BUFFER_BYTES: usize = 1024 * 1024;

    /// Sample rate of the audio devices
    pub const DEFAULT_HARDWARE_RATE: u32 = 48000;

    /// Sample rate of the codec and the processing stages
    pub const DEFAULT_PROCESSING_RATE: u32 = 16000;

    pub const DEFAULT_FRAME_MS: f32 = 20.0;

    /// Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 24_000;

    /// Largest datagram we send or accept
    pub const MAX_DATAGRAM_SIZE: usize = 1472; // MTU - IP/UDP headers
}
