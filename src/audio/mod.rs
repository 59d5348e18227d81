//! Audio subsystem: frames, queues, resampling and device I/O

pub mod buffer;
pub mod capture;
pub mod device;
pub mod frame;
pub mod playback;
pub mod resample;

pub use buffer::{CaptureQueue, PlaybackBuffer, SharedCaptureQueue, SharedPlaybackBuffer};
pub use capture::AudioCapture;
pub use device::{list_devices, log_devices, DeviceInfo};
pub use frame::AudioFrame;
pub use playback::AudioPlayback;
pub use resample::{Resampler, ResamplerState};
