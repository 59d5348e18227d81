//! Identity stage

use super::ProcessingStage;
use crate::audio::frame::AudioFrame;

/// Passes frames through untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct Bypass;

impl ProcessingStage for Bypass {
    fn transform(&mut self, frame: AudioFrame) -> AudioFrame {
        frame
    }

    fn name(&self) -> &'static str {
        "Bypass"
    }
}
