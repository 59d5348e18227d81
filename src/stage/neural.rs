//! Learned denoising stage
//!
//! The stage itself only handles dispatch and failure policy: any inference
//! error, or an output of the wrong length, passes the input frame through
//! unchanged. The model behind it is a [`DenoiseModel`] built by a
//! [`ModelFactory`], so every pipeline gets its own instance.

use std::sync::Arc;
use tracing::warn;

use super::ProcessingStage;
use crate::audio::frame::AudioFrame;
use crate::config::StageConfig;
use crate::error::StageError;

#[cfg(feature = "onnx")]
pub use onnx::OnnxDenoiser;

/// A frame-in, frame-out speech enhancement model
pub trait DenoiseModel: Send {
    /// Return a denoised copy of `frame`, same length
    fn denoise(&mut self, frame: &[f32]) -> Result<Vec<f32>, StageError>;

    fn name(&self) -> &str;

    /// Clear any recurrent state
    fn reset(&mut self) {}
}

/// Builds one model instance per pipeline
pub type ModelFactory =
    Arc<dyn Fn() -> Result<Box<dyn DenoiseModel>, StageError> + Send + Sync>;

/// Report the first failure and then one in this many
const FAILURE_LOG_EVERY: u64 = 100;

pub struct NeuralDenoise {
    model: Box<dyn DenoiseModel>,
    failures: u64,
}

impl NeuralDenoise {
    pub fn new(model: Box<dyn DenoiseModel>) -> Self {
        Self { model, failures: 0 }
    }

    /// Frames passed through because the model failed
    pub fn failures(&self) -> u64 {
        self.failures
    }

    fn note_failure(&mut self, reason: &str) {
        if self.failures % FAILURE_LOG_EVERY == 0 {
            warn!(
                "Denoiser {} failed ({}), passing audio through [{} failures]",
                self.model.name(),
                reason,
                self.failures + 1
            );
        }
        self.failures += 1;
    }
}

impl ProcessingStage for NeuralDenoise {
    fn transform(&mut self, frame: AudioFrame) -> AudioFrame {
        match self.model.denoise(frame.samples()) {
            Ok(out) if out.len() == frame.len() => {
                AudioFrame::new(out, frame.sample_rate()).clamped()
            }
            Ok(out) => {
                let err = StageError::LengthMismatch {
                    expected: frame.len(),
                    actual: out.len(),
                };
                self.note_failure(&err.to_string());
                frame
            }
            Err(e) => {
                self.note_failure(&e.to_string());
                frame
            }
        }
    }

    fn name(&self) -> &'static str {
        "NeuralDenoise"
    }

    fn reset(&mut self) {
        self.model.reset();
    }
}

/// Model factory for the configured backend, if one is available
#[cfg(feature = "onnx")]
pub fn model_factory(config: &StageConfig) -> Option<ModelFactory> {
    let path = config.neural_model_path.clone()?;
    Some(Arc::new(move || {
        OnnxDenoiser::load(&path).map(|m| Box::new(m) as Box<dyn DenoiseModel>)
    }))
}

/// Model factory for the configured backend, if one is available
#[cfg(not(feature = "onnx"))]
pub fn model_factory(config: &StageConfig) -> Option<ModelFactory> {
    if config.neural_model_path.is_some() {
        warn!("neural_model_path is set but this build has no ONNX support");
    }
    None
}

#[cfg(feature = "onnx")]
mod onnx {
    use ort::session::{builder::GraphOptimizationLevel, Session};
    use ort::value::Value;
    use std::path::Path;
    use tracing::info;

    use super::DenoiseModel;
    use crate::error::StageError;

    const INPUT_NAME: &str = "input";
    const OUTPUT_NAME: &str = "output";

    /// ONNX model taking and returning a `[1, 1, T]` waveform tensor
    pub struct OnnxDenoiser {
        session: Session,
        label: String,
    }

    impl OnnxDenoiser {
        pub fn load(path: &Path) -> Result<Self, StageError> {
            if !path.exists() {
                return Err(StageError::ModelLoad(format!(
                    "model file not found: {}",
                    path.display()
                )));
            }

            let session = Session::builder()
                .map_err(|e| StageError::ModelLoad(format!("session builder: {}", e)))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|e| StageError::ModelLoad(format!("optimization level: {}", e)))?
                .with_intra_threads(1)
                .map_err(|e| StageError::ModelLoad(format!("threads: {}", e)))?
                .commit_from_file(path)
                .map_err(|e| StageError::ModelLoad(format!("{}: {}", path.display(), e)))?;

            let label = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "onnx".to_string());
            info!("Loaded denoising model {}", path.display());

            Ok(Self { session, label })
        }
    }

    impl DenoiseModel for OnnxDenoiser {
        fn denoise(&mut self, frame: &[f32]) -> Result<Vec<f32>, StageError> {
            let array = ndarray::Array3::from_shape_vec((1, 1, frame.len()), frame.to_vec())
                .map_err(|e| StageError::Inference(format!("input shape: {}", e)))?;
            let input = Value::from_array(array)
                .map_err(|e| StageError::Inference(format!("input tensor: {}", e)))?;

            let outputs = self
                .session
                .run(ort::inputs![INPUT_NAME => input])
                .map_err(|e| StageError::Inference(e.to_string()))?;

            let output = outputs
                .get(OUTPUT_NAME)
                .ok_or_else(|| StageError::Inference(format!("missing '{}' output", OUTPUT_NAME)))?;
            let (_, data) = output
                .try_extract_tensor::<f32>()
                .map_err(|e| StageError::Inference(format!("output tensor: {}", e)))?;

            Ok(data.to_vec())
        }

        fn name(&self) -> &str {
            &self.label
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Halver;

    impl DenoiseModel for Halver {
        fn denoise(&mut self, frame: &[f32]) -> Result<Vec<f32>, StageError> {
            Ok(frame.iter().map(|s| s * 0.5).collect())
        }

        fn name(&self) -> &str {
            "halver"
        }
    }

    struct Broken {
        truncate: bool,
    }

    impl DenoiseModel for Broken {
        fn denoise(&mut self, frame: &[f32]) -> Result<Vec<f32>, StageError> {
            if self.truncate {
                Ok(frame[..frame.len() / 2].to_vec())
            } else {
                Err(StageError::Inference("no runtime".into()))
            }
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    #[test]
    fn test_model_output_used() {
        let mut stage = NeuralDenoise::new(Box::new(Halver));
        let out = stage.transform(AudioFrame::new(vec![0.4; 320], 16000));
        assert_eq!(out.len(), 320);
        assert!((out.samples()[0] - 0.2).abs() < 1e-6);
        assert_eq!(out.sample_rate(), 16000);
        assert_eq!(stage.name(), "NeuralDenoise");
    }

    #[test]
    fn test_failure_passes_input_through() {
        let input = AudioFrame::new(vec![0.3; 320], 16000);

        let mut stage = NeuralDenoise::new(Box::new(Broken { truncate: false }));
        assert_eq!(stage.transform(input.clone()), input);

        let mut stage = NeuralDenoise::new(Box::new(Broken { truncate: true }));
        assert_eq!(stage.transform(input.clone()), input);
        assert_eq!(stage.transform(input.clone()), input);
        assert_eq!(stage.failures(), 2);
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn test_no_backend_without_onnx() {
        let config = StageConfig {
            neural_model_path: Some("model.onnx".into()),
            ..StageConfig::default()
        };
        assert!(model_factory(&config).is_none());
    }
}
