//! Configuration loaded once at startup
//!
//! The whole link is described by one immutable [`AppConfig`], read from a
//! TOML file and validated before the engine is built:
//!
//! ```toml
//! [link]
//! role = "A"
//! peer_address = "192.168.4.2"
//!
//! [stages]
//! cycle = ["bypass", "classical_filter"]
//! initial = "bypass"
//! ```

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::frame::frame_len;
use crate::audio::resample::Resampler;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::protocol::{PeerEndpoint, Role};
use crate::stage::StageKind;

/// Frame durations Opus can encode, in milliseconds
pub const OPUS_FRAME_MS: [f32; 6] = [2.5, 5.0, 10.0, 20.0, 40.0, 60.0];

/// Sample rates Opus can run at
pub const OPUS_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Complete node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub link: LinkConfig,
    pub audio: AudioConfig,
    pub codec: CodecConfig,
    pub jitter: JitterConfig,
    pub stages: StageConfig,
    pub stats: StatsConfig,
}

/// Network link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub role: Role,
    pub peer_address: IpAddr,
    /// Local address the receive socket binds to
    pub bind_address: IpAddr,
    /// Port carrying A -> B audio
    pub a_to_b_port: u16,
    /// Port carrying B -> A audio
    pub b_to_a_port: u16,
    /// Requested SO_RCVBUF size
    pub recv_buffer_bytes: usize,
    /// Receive poll timeout; keeps the loop responsive to stop
    pub recv_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            role: Role::A,
            peer_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            a_to_b_port: DEFAULT_A_TO_B_PORT,
            b_to_a_port: DEFAULT_B_TO_A_PORT,
            recv_buffer_bytes: DEFAULT_RECV_BUFFER_BYTES,
            recv_timeout_ms: 10,
        }
    }
}

/// Audio hardware and framing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub hardware_rate: u32,
    pub processing_rate: u32,
    pub frame_ms: f32,
    /// Device channel count; capture keeps channel 0, playback duplicates
    pub channels: u16,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    /// Capture blocks buffered before the oldest is dropped
    pub capture_queue_depth: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            hardware_rate: DEFAULT_HARDWARE_RATE,
            processing_rate: DEFAULT_PROCESSING_RATE,
            frame_ms: DEFAULT_FRAME_MS,
            channels: 2,
            input_device: None,
            output_device: None,
            capture_queue_depth: 32,
        }
    }
}

/// Opus encoder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub bitrate: u32,
    /// Constant bitrate keeps every packet the same size
    pub cbr: bool,
    pub fec: bool,
    pub packet_loss_perc: u8,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            bitrate: DEFAULT_BITRATE,
            cbr: true,
            fec: false,
            packet_loss_perc: 10,
        }
    }
}

/// Playback-side jitter buffer settings, in frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    /// Frames queued before playback starts or resumes
    pub target_depth: usize,
    /// Oldest frames are dropped beyond this depth
    pub max_depth: usize,
    /// Larger sequence gaps are treated as a stream restart
    pub max_gap: u32,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            target_depth: 3,
            max_depth: 8,
            max_gap: 50,
        }
    }
}

/// Processing stage selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Order the toggle command walks through
    pub cycle: Vec<StageKind>,
    pub initial: StageKind,
    /// Also run the active stage on decoded audio
    pub transform_on_receive: bool,
    /// Most a non-bypass stage may lower the frame level, in dB
    pub max_attenuation_db: Option<f32>,
    pub neural_model_path: Option<PathBuf>,
    pub classical: ClassicalConfig,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            cycle: vec![StageKind::Bypass, StageKind::ClassicalFilter],
            initial: StageKind::Bypass,
            transform_on_receive: false,
            max_attenuation_db: Some(30.0),
            neural_model_path: None,
            classical: ClassicalConfig::default(),
        }
    }
}

impl StageConfig {
    /// Use the model at `path`, adding NeuralDenoise after the first stage
    /// of the cycle if it is not there yet
    pub fn enable_neural(&mut self, path: PathBuf) {
        self.neural_model_path = Some(path);
        if !self.cycle.contains(&StageKind::NeuralDenoise) {
            let at = self.cycle.len().min(1);
            self.cycle.insert(at, StageKind::NeuralDenoise);
        }
    }
}

/// Classical filter chain parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassicalConfig {
    pub highpass_hz: f32,
    pub impulse_window: usize,
    pub impulse_threshold: f32,
    /// Deviations below this are never treated as impulses
    pub impulse_floor: f32,
    pub limiter_threshold: f32,
    pub limiter_ratio: f32,
    pub limiter_attack_ms: f32,
    pub limiter_release_ms: f32,
}

impl Default for ClassicalConfig {
    fn default() -> Self {
        Self {
            highpass_hz: 80.0,
            impulse_window: 5,
            impulse_threshold: 3.0,
            impulse_floor: 0.02,
            limiter_threshold: 0.8,
            limiter_ratio: 10.0,
            limiter_attack_ms: 1.0,
            limiter_release_ms: 10.0,
        }
    }
}

/// Periodic statistics report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}

impl AppConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Per-user default location of the configuration file
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "voice-duplex")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject configurations the engine cannot run
    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;

        if audio.hardware_rate == 0 || audio.processing_rate == 0 {
            return Err(Error::Config("sample rates must be non-zero".into()));
        }
        if !OPUS_SAMPLE_RATES.contains(&audio.processing_rate) {
            return Err(Error::Config(format!(
                "processing rate {} Hz is not an Opus rate {:?}",
                audio.processing_rate, OPUS_SAMPLE_RATES
            )));
        }
        Resampler::new(audio.hardware_rate, audio.processing_rate)?;

        if !OPUS_FRAME_MS.iter().any(|ms| (ms - audio.frame_ms).abs() < f32::EPSILON) {
            return Err(Error::Config(format!(
                "frame duration {} ms is not an Opus frame size {:?}",
                audio.frame_ms, OPUS_FRAME_MS
            )));
        }
        for rate in [audio.hardware_rate, audio.processing_rate] {
            let exact = rate as f64 * audio.frame_ms as f64 / 1000.0;
            if exact.fract() != 0.0 {
                return Err(Error::Config(format!(
                    "{} ms is not a whole number of samples at {} Hz",
                    audio.frame_ms, rate
                )));
            }
        }
        if audio.channels == 0 {
            return Err(Error::Config("channel count must be at least 1".into()));
        }
        if audio.capture_queue_depth == 0 {
            return Err(Error::Config("capture queue depth must be at least 1".into()));
        }

        if self.link.a_to_b_port == self.link.b_to_a_port {
            return Err(Error::Config(format!(
                "A->B and B->A ports must differ (both {})",
                self.link.a_to_b_port
            )));
        }

        let jitter = &self.jitter;
        if jitter.max_depth == 0 || jitter.target_depth == 0 {
            return Err(Error::Config("jitter depths must be at least 1".into()));
        }
        if jitter.target_depth > jitter.max_depth {
            return Err(Error::Config(format!(
                "jitter target depth {} exceeds max depth {}",
                jitter.target_depth, jitter.max_depth
            )));
        }

        let stages = &self.stages;
        if stages.cycle.is_empty() {
            return Err(Error::Config("stage cycle is empty".into()));
        }
        for (i, kind) in stages.cycle.iter().enumerate() {
            if stages.cycle[..i].contains(kind) {
                return Err(Error::Config(format!("stage {} appears twice in the cycle", kind)));
            }
        }
        if !stages.cycle.contains(&stages.initial) {
            return Err(Error::Config(format!(
                "initial stage {} is not in the cycle",
                stages.initial
            )));
        }
        if let Some(db) = stages.max_attenuation_db {
            if !(db > 0.0) {
                return Err(Error::Config("max attenuation must be positive".into()));
            }
        }

        Ok(())
    }

    /// This node's endpoint under the per-direction port convention
    pub fn endpoint(&self) -> PeerEndpoint {
        PeerEndpoint::for_role(
            self.link.role,
            self.link.peer_address,
            self.link.a_to_b_port,
            self.link.b_to_a_port,
        )
    }

    /// Samples per frame at the hardware rate
    pub fn hardware_frame_len(&self) -> usize {
        frame_len(self.audio.hardware_rate, self.audio.frame_ms)
    }

    /// Samples per frame at the processing rate
    pub fn processing_frame_len(&self) -> usize {
        frame_len(self.audio.processing_rate, self.audio.frame_ms)
    }

    /// Real-time budget of one frame
    pub fn frame_duration(&self) -> Duration {
        Duration::from_micros((self.audio.frame_ms as f64 * 1000.0) as u64)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.link.recv_timeout_ms.max(1))
    }
}
