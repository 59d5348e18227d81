//! Rational sample-rate conversion between the hardware and processing rates
//!
//! Built on rubato's FFT resampler. Two modes:
//!
//! - [`Resampler::resample`] is a pure function of one block. It runs a fresh
//!   converter over the zero-padded block and trims the converter delay, so
//!   a down-then-up round trip lines up with the original samples.
//! - [`Resampler::process_stream`] keeps the converter and its overlap
//!   buffers in a caller-owned [`ResamplerState`], giving seamless output
//!   across consecutive frames of one stream. Every call returns exactly
//!   `len * up / down` samples; output the converter has not produced yet
//!   at stream start is pre-filled with silence.

use rubato::{FftFixedIn, Resampler as RubatoResampler};

use crate::audio::frame::AudioFrame;
use crate::error::ResampleError;

/// Largest reduced up or down factor accepted
pub const MAX_FACTOR: usize = 8;

/// Input chunk used by the one-shot converter
const BLOCK_CHUNK: usize = 1024;

/// Fixed-ratio resampler between two rates
#[derive(Debug, Clone)]
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    up: usize,
    down: usize,
}

/// Converter state for one continuous stream
#[derive(Default)]
pub struct ResamplerState {
    engine: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
    ready: Vec<f32>,
    padded: usize,
}

impl ResamplerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all history; the next call starts a new stream
    pub fn reset(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.reset();
        }
        self.pending.clear();
        self.ready.clear();
        self.padded = 0;
    }

    /// Stream delay in output samples, once the converter exists
    pub fn delay(&self) -> Option<usize> {
        self.engine.as_ref().map(|e| e.output_delay() + self.padded)
    }
}

impl Resampler {
    /// Build a resampler for `from_rate -> to_rate`.
    ///
    /// Fails with [`ResampleError::InvalidRatio`] when either rate is zero or
    /// the reduced ratio needs a factor above [`MAX_FACTOR`].
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, ResampleError> {
        let invalid = ResampleError::InvalidRatio {
            from: from_rate,
            to: to_rate,
        };
        if from_rate == 0 || to_rate == 0 {
            return Err(invalid);
        }

        let g = gcd(from_rate, to_rate);
        let up = (to_rate / g) as usize;
        let down = (from_rate / g) as usize;
        if up > MAX_FACTOR || down > MAX_FACTOR {
            return Err(invalid);
        }

        Ok(Self {
            from_rate,
            to_rate,
            up,
            down,
        })
    }

    /// Check whether `from_rate -> to_rate` is a supported ratio
    pub fn is_supported(from_rate: u32, to_rate: u32) -> bool {
        Self::new(from_rate, to_rate).is_ok()
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Reduced `(up, down)` factors
    pub fn factors(&self) -> (usize, usize) {
        (self.up, self.down)
    }

    fn is_identity(&self) -> bool {
        self.up == 1 && self.down == 1
    }

    /// Output length for an input block of `input_len` samples
    pub fn output_len(&self, input_len: usize) -> usize {
        (input_len * self.up).div_ceil(self.down)
    }

    fn engine(&self, chunk: usize) -> Result<FftFixedIn<f32>, ResampleError> {
        FftFixedIn::<f32>::new(self.from_rate as usize, self.to_rate as usize, chunk, 1, 1)
            .map_err(|e| ResampleError::Engine(e.to_string()))
    }

    /// Resample one independent block (delay-compensated, zero-padded edges)
    pub fn resample(&self, input: &[f32]) -> Result<Vec<f32>, ResampleError> {
        if self.is_identity() || input.is_empty() {
            return Ok(input.to_vec());
        }

        let mut engine = self.engine(BLOCK_CHUNK)?;
        let delay = engine.output_delay();
        let wanted = delay + self.output_len(input.len());

        let mut output = Vec::with_capacity(wanted + BLOCK_CHUNK * self.up);
        let mut pos = 0;
        while output.len() < wanted {
            let frames = engine.input_frames_next();
            let mut chunk = vec![0.0f32; frames];
            if pos < input.len() {
                let end = (pos + frames).min(input.len());
                chunk[..end - pos].copy_from_slice(&input[pos..end]);
            }
            pos += frames;

            let out = engine
                .process(&[chunk], None)
                .map_err(|e| ResampleError::Engine(e.to_string()))?;
            output.extend_from_slice(&out[0]);
        }

        output.drain(..delay);
        output.truncate(wanted - delay);
        Ok(output)
    }

    /// Resample a frame produced at this resampler's input rate
    pub fn process(&self, frame: &AudioFrame) -> Result<AudioFrame, ResampleError> {
        self.check_rate(frame)?;
        Ok(AudioFrame::new(self.resample(frame.samples())?, self.to_rate))
    }

    /// Fresh stream state; the converter is built on first use
    pub fn new_state(&self) -> ResamplerState {
        ResamplerState::new()
    }

    /// Resample the next block of a continuous stream.
    ///
    /// Returns exactly [`Self::output_len`] samples for `input`. The
    /// converter is sized from the first block.
    pub fn process_stream(
        &self,
        state: &mut ResamplerState,
        input: &[f32],
    ) -> Result<Vec<f32>, ResampleError> {
        if self.is_identity() || input.is_empty() {
            return Ok(input.to_vec());
        }

        if state.engine.is_none() {
            state.engine = Some(self.engine(input.len())?);
        }
        let Some(engine) = state.engine.as_mut() else {
            return Ok(Vec::new());
        };
        state.pending.extend_from_slice(input);

        loop {
            let frames = engine.input_frames_next();
            if state.pending.len() < frames {
                break;
            }
            let out = engine
                .process(&[&state.pending[..frames]], None)
                .map_err(|e| ResampleError::Engine(e.to_string()))?;
            state.pending.drain(..frames);
            state.ready.extend_from_slice(&out[0]);
        }

        let wanted = self.output_len(input.len());
        if state.ready.len() < wanted {
            let missing = wanted - state.ready.len();
            state.ready.splice(0..0, std::iter::repeat(0.0).take(missing));
            state.padded += missing;
        }
        Ok(state.ready.drain(..wanted).collect())
    }

    /// Streaming counterpart of [`Self::process`]
    pub fn process_frame_stream(
        &self,
        state: &mut ResamplerState,
        frame: &AudioFrame,
    ) -> Result<AudioFrame, ResampleError> {
        self.check_rate(frame)?;
        Ok(AudioFrame::new(
            self.process_stream(state, frame.samples())?,
            self.to_rate,
        ))
    }

    fn check_rate(&self, frame: &AudioFrame) -> Result<(), ResampleError> {
        if frame.sample_rate() != self.from_rate {
            return Err(ResampleError::RateMismatch {
                expected: self.from_rate,
                actual: frame.sample_rate(),
            });
        }
        Ok(())
    }
}

/// One-shot conversion of a frame to `to_rate`
pub fn resample(frame: &AudioFrame, to_rate: u32) -> Result<AudioFrame, ResampleError> {
    Resampler::new(frame.sample_rate(), to_rate)?.process(frame)
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::rms;
    use proptest::prelude::*;
    use std::f32::consts::PI;

    fn sine(freq: f32, rate: u32, len: usize, amp: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amp * (2.0 * PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    fn normalized_error(a: &[f32], b: &[f32]) -> f32 {
        let diff: Vec<f32> = a.iter().zip(b).map(|(x, y)| x - y).collect();
        rms(&diff) / rms(a).max(1e-9)
    }

    #[test]
    fn test_invalid_ratio() {
        assert_eq!(
            Resampler::new(44100, 16000).unwrap_err(),
            ResampleError::InvalidRatio {
                from: 44100,
                to: 16000
            }
        );
        assert!(Resampler::new(0, 16000).is_err());
        assert!(Resampler::new(48000, 0).is_err());
        assert!(Resampler::is_supported(48000, 16000));
        assert!(Resampler::is_supported(32000, 48000));
    }

    #[test]
    fn test_factors_and_lengths() {
        let down = Resampler::new(48000, 16000).unwrap();
        assert_eq!(down.factors(), (1, 3));
        assert_eq!(down.resample(&vec![0.1; 960]).unwrap().len(), 320);

        let up = Resampler::new(16000, 48000).unwrap();
        assert_eq!(up.factors(), (3, 1));
        assert_eq!(up.resample(&vec![0.1; 320]).unwrap().len(), 960);
    }

    #[test]
    fn test_empty_and_silent_blocks() {
        let down = Resampler::new(48000, 16000).unwrap();
        assert!(down.resample(&[]).unwrap().is_empty());

        let out = down.resample(&vec![0.0; 960]).unwrap();
        assert_eq!(out.len(), 320);
        assert!(out.iter().all(|s| s.abs() < 1e-9));

        let mut state = down.new_state();
        assert!(down.process_stream(&mut state, &[]).unwrap().is_empty());
        assert!(state.delay().is_none());
    }

    #[test]
    fn test_frame_rate_checked() {
        let down = Resampler::new(48000, 16000).unwrap();
        let wrong = AudioFrame::silence(320, 16000);
        assert!(matches!(
            down.process(&wrong),
            Err(ResampleError::RateMismatch { .. })
        ));

        let frame = resample(&AudioFrame::silence(960, 48000), 16000).unwrap();
        assert_eq!(frame.sample_rate(), 16000);
        assert_eq!(frame.len(), 320);
    }

    #[test]
    fn test_round_trip_sine() {
        let down = Resampler::new(48000, 16000).unwrap();
        let up = Resampler::new(16000, 48000).unwrap();

        let x = sine(1000.0, 48000, 4800, 0.5);
        let y = up.resample(&down.resample(&x).unwrap()).unwrap();
        assert_eq!(y.len(), x.len());

        let edge = 960;
        let err = normalized_error(&x[edge..x.len() - edge], &y[edge..y.len() - edge]);
        assert!(err < 0.02, "round trip error {err}");
    }

    #[test]
    fn test_downsampling_rejects_aliases() {
        let down = Resampler::new(48000, 16000).unwrap();
        let x = sine(12000.0, 48000, 4800, 0.5);
        let y = down.resample(&x).unwrap();
        let interior = &y[320..y.len() - 320];
        assert!(rms(interior) < 0.05 * rms(&x), "alias leaked: {}", rms(interior));
    }

    #[test]
    fn test_stream_matches_block_after_delay() {
        let down = Resampler::new(48000, 16000).unwrap();
        let x = sine(700.0, 48000, 960 * 8, 0.4);

        let mut state = down.new_state();
        let mut streamed = Vec::new();
        for chunk in x.chunks(960) {
            let out = down.process_stream(&mut state, chunk).unwrap();
            assert_eq!(out.len(), 320);
            streamed.extend(out);
        }
        let delay = state.delay().unwrap();

        let block = down.resample(&x).unwrap();
        let span = 640..streamed.len() - delay - 640;
        let a = &block[span.clone()];
        let b = &streamed[span.start + delay..span.end + delay];
        assert!(normalized_error(a, b) < 0.01);
    }

    #[test]
    fn test_stream_round_trip_keeps_level() {
        let down = Resampler::new(48000, 16000).unwrap();
        let up = Resampler::new(16000, 48000).unwrap();
        let mut down_state = down.new_state();
        let mut up_state = up.new_state();

        let x = sine(1000.0, 48000, 960 * 10, 0.5);
        let mut y = Vec::new();
        for chunk in x.chunks(960) {
            let mid = down.process_stream(&mut down_state, chunk).unwrap();
            y.extend(up.process_stream(&mut up_state, &mid).unwrap());
        }
        assert_eq!(y.len(), x.len());

        let steady = &y[1920..];
        let ratio = rms(steady) / rms(&x[1920..]);
        assert!((ratio - 1.0).abs() < 0.05, "level ratio {ratio}");
    }

    #[test]
    fn test_state_reset() {
        let down = Resampler::new(48000, 16000).unwrap();
        let x = sine(440.0, 48000, 960, 0.5);

        let mut state = down.new_state();
        let first = down.process_stream(&mut state, &x).unwrap();
        state.reset();
        let again = down.process_stream(&mut state, &x).unwrap();
        assert_eq!(first, again);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn prop_round_trip_fidelity(
            tones in prop::collection::vec((100.0f32..3500.0, 0.05f32..0.3, 0.0f32..6.28), 1..4)
        ) {
            let down = Resampler::new(48000, 16000).unwrap();
            let up = Resampler::new(16000, 48000).unwrap();

            let len = 4800;
            let x: Vec<f32> = (0..len)
                .map(|i| {
                    let t = i as f32 / 48000.0;
                    tones.iter().map(|(f, a, ph)| a * (2.0 * PI * f * t + ph).sin()).sum()
                })
                .collect();

            let y = up.resample(&down.resample(&x).unwrap()).unwrap();
            prop_assert_eq!(y.len(), x.len());

            let edge = 960;
            let err = normalized_error(&x[edge..len - edge], &y[edge..len - edge]);
            prop_assert!(err < 0.03, "round trip error {}", err);
        }
    }
}
