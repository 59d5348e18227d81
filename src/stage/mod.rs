//! Swappable audio transform stages
//!
//! The set of stages is closed: [`Bypass`], [`NeuralDenoise`] and
//! [`ClassicalFilter`], wrapped in the [`Stage`] enum. Which one runs is
//! decided by an [`ActiveStage`] selector shared between the operator and
//! the pipelines. Toggling stores a new [`StageKind`] with a single atomic
//! operation; each pipeline loads the selector once per frame, so a frame
//! in flight always finishes on the stage it started with.
//!
//! Stage instances themselves are not shared. Every pipeline owns a
//! [`StageBank`] holding one instance per configured kind, which keeps
//! stateful filters free of locks and of cross-talk between directions.

pub mod bypass;
pub mod classical;
pub mod neural;

pub use bypass::Bypass;
pub use classical::ClassicalFilter;
pub use neural::{DenoiseModel, ModelFactory, NeuralDenoise};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::audio::frame::AudioFrame;
use crate::config::StageConfig;
use crate::error::StageError;

/// Transform applied to one processing-rate frame
pub trait ProcessingStage: Send {
    /// Produce a frame of the same length and rate as `frame`
    fn transform(&mut self, frame: AudioFrame) -> AudioFrame;

    fn name(&self) -> &'static str;

    /// Drop any history carried between frames
    fn reset(&mut self) {}
}

/// Identifies one of the available stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Bypass,
    NeuralDenoise,
    ClassicalFilter,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [
        StageKind::Bypass,
        StageKind::NeuralDenoise,
        StageKind::ClassicalFilter,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Bypass => "Bypass",
            StageKind::NeuralDenoise => "NeuralDenoise",
            StageKind::ClassicalFilter => "ClassicalFilter",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            StageKind::Bypass => 0,
            StageKind::NeuralDenoise => 1,
            StageKind::ClassicalFilter => 2,
        }
    }

    fn from_u8(value: u8) -> StageKind {
        match value {
            1 => StageKind::NeuralDenoise,
            2 => StageKind::ClassicalFilter,
            _ => StageKind::Bypass,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared selector of the active stage.
///
/// Cloning yields another handle to the same selector.
#[derive(Clone)]
pub struct ActiveStage {
    current: Arc<AtomicU8>,
    cycle: Arc<[StageKind]>,
}

impl ActiveStage {
    /// Repeated kinds keep their first position only. `initial` falls back
    /// to the first kind of `cycle` if it is not part of it.
    pub fn new(cycle: Vec<StageKind>, initial: StageKind) -> Self {
        let mut unique = Vec::with_capacity(cycle.len());
        for kind in cycle {
            if !unique.contains(&kind) {
                unique.push(kind);
            }
        }
        let cycle: Arc<[StageKind]> = if unique.is_empty() {
            Arc::from(vec![StageKind::Bypass])
        } else {
            Arc::from(unique)
        };
        let start = if cycle.contains(&initial) {
            initial
        } else {
            cycle[0]
        };
        Self {
            current: Arc::new(AtomicU8::new(start.to_u8())),
            cycle,
        }
    }

    pub fn from_config(config: &StageConfig) -> Self {
        Self::new(config.cycle.clone(), config.initial)
    }

    /// The stage new frames are dispatched to
    pub fn current(&self) -> StageKind {
        StageKind::from_u8(self.current.load(Ordering::Acquire))
    }

    /// Advance to the next stage in the cycle, wrapping after the last
    pub fn toggle(&self) -> StageKind {
        let cycle = &self.cycle;
        let next_of = |value: u8| {
            let kind = StageKind::from_u8(value);
            let pos = cycle.iter().position(|k| *k == kind).unwrap_or(cycle.len() - 1);
            cycle[(pos + 1) % cycle.len()]
        };

        let previous = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                Some(next_of(value).to_u8())
            })
            .unwrap_or_else(|value| value);
        let next = next_of(previous);
        info!("Processing stage: {} -> {}", StageKind::from_u8(previous), next);
        next
    }

    /// Select `kind` directly; ignored if it is not in the cycle
    pub fn set(&self, kind: StageKind) -> bool {
        if !self.cycle.contains(&kind) {
            return false;
        }
        self.current.store(kind.to_u8(), Ordering::Release);
        true
    }

    pub fn cycle(&self) -> &[StageKind] {
        &self.cycle
    }
}

/// One instance of each stage variant
pub enum Stage {
    Bypass(Bypass),
    NeuralDenoise(NeuralDenoise),
    ClassicalFilter(ClassicalFilter),
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Bypass(_) => StageKind::Bypass,
            Stage::NeuralDenoise(_) => StageKind::NeuralDenoise,
            Stage::ClassicalFilter(_) => StageKind::ClassicalFilter,
        }
    }
}

impl ProcessingStage for Stage {
    fn transform(&mut self, frame: AudioFrame) -> AudioFrame {
        match self {
            Stage::Bypass(stage) => stage.transform(frame),
            Stage::NeuralDenoise(stage) => stage.transform(frame),
            Stage::ClassicalFilter(stage) => stage.transform(frame),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Stage::Bypass(stage) => stage.name(),
            Stage::NeuralDenoise(stage) => stage.name(),
            Stage::ClassicalFilter(stage) => stage.name(),
        }
    }

    fn reset(&mut self) {
        match self {
            Stage::Bypass(stage) => stage.reset(),
            Stage::NeuralDenoise(stage) => stage.reset(),
            Stage::ClassicalFilter(stage) => stage.reset(),
        }
    }
}

/// Lower bound on how far a stage may pull the frame level down
#[derive(Debug, Clone, Copy)]
pub struct EnergyFloor {
    min_ratio: f32,
}

impl EnergyFloor {
    pub fn from_db(max_attenuation_db: f32) -> Self {
        Self {
            min_ratio: 10f32.powf(-max_attenuation_db / 20.0),
        }
    }

    /// Rescale `output` so its RMS stays within the floor of `input`'s
    pub fn apply(&self, input: &AudioFrame, output: AudioFrame) -> AudioFrame {
        let input_rms = input.rms();
        if input_rms < 1e-6 {
            return output;
        }
        let floor = input_rms * self.min_ratio;
        let output_rms = output.rms();
        if output_rms >= floor {
            return output;
        }

        let rate = output.sample_rate();
        let samples: Vec<f32> = if output_rms < 1e-9 {
            input.samples().iter().map(|s| s * self.min_ratio).collect()
        } else {
            let gain = floor / output_rms;
            output.samples().iter().map(|s| s * gain).collect()
        };
        AudioFrame::new(samples, rate).clamped()
    }
}

/// The stage instances owned by one pipeline
pub struct StageBank {
    stages: Vec<Stage>,
    floor: Option<EnergyFloor>,
    last_kind: Option<StageKind>,
}

impl StageBank {
    /// Build one instance per kind in the configured cycle.
    ///
    /// Fails if NeuralDenoise is requested without a model backend or the
    /// model cannot be loaded.
    pub fn build(
        config: &StageConfig,
        sample_rate: u32,
        models: Option<&ModelFactory>,
    ) -> Result<Self, StageError> {
        let mut stages = Vec::with_capacity(config.cycle.len());
        for kind in &config.cycle {
            if stages.iter().any(|s: &Stage| s.kind() == *kind) {
                continue;
            }
            let stage = match kind {
                StageKind::Bypass => Stage::Bypass(Bypass),
                StageKind::NeuralDenoise => {
                    let factory = models.ok_or_else(|| {
                        StageError::BackendUnavailable(format!(
                            "{}: no denoising model configured",
                            kind
                        ))
                    })?;
                    Stage::NeuralDenoise(NeuralDenoise::new(factory()?))
                }
                StageKind::ClassicalFilter => {
                    Stage::ClassicalFilter(ClassicalFilter::new(&config.classical, sample_rate))
                }
            };
            debug!("Stage ready: {}", stage.name());
            stages.push(stage);
        }

        Ok(Self {
            stages,
            floor: config.max_attenuation_db.map(EnergyFloor::from_db),
            last_kind: None,
        })
    }

    /// Run `frame` through the stage of `kind`.
    ///
    /// A kind that differs from the previous call's gets its history reset
    /// first. Unknown kinds pass the frame through.
    pub fn run(&mut self, kind: StageKind, frame: AudioFrame) -> AudioFrame {
        let Some(stage) = self.stages.iter_mut().find(|s| s.kind() == kind) else {
            return frame;
        };

        if self.last_kind != Some(kind) {
            stage.reset();
            self.last_kind = Some(kind);
        }

        if kind == StageKind::Bypass {
            return stage.transform(frame);
        }

        match self.floor {
            Some(floor) => {
                let input = frame.clone();
                let output = stage.transform(frame);
                floor.apply(&input, output)
            }
            None => stage.transform(frame),
        }
    }

    pub fn kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(Stage::kind).collect()
    }
}
