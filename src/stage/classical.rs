//! DSP speech cleanup: high-pass, impulse suppression, soft limiting
//!
//! All three filters keep their state between frames so frame boundaries
//! are inaudible.

use std::f32::consts::PI;

use super::ProcessingStage;
use crate::audio::frame::AudioFrame;
use crate::config::ClassicalConfig;

/// Q factors of the two sections of a 4th-order Butterworth
const BUTTERWORTH_Q: [f32; 2] = [0.541_196_1, 1.306_563];

/// Transposed direct form II second-order section
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl Biquad {
    fn highpass(cutoff_hz: f32, q: f32, sample_rate: u32) -> Self {
        let nyquist = sample_rate as f32 / 2.0;
        let cutoff = cutoff_hz.clamp(1.0, nyquist * 0.95);
        let w0 = 2.0 * PI * cutoff / sample_rate as f32;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / (2.0 * q);

        let a0 = 1.0 + alpha;
        Self {
            b0: (1.0 + cos_w0) / 2.0 / a0,
            b1: -(1.0 + cos_w0) / a0,
            b2: (1.0 + cos_w0) / 2.0 / a0,
            a1: -2.0 * cos_w0 / a0,
            a2: (1.0 - alpha) / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }

    fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// 4th-order Butterworth high-pass
#[derive(Debug, Clone)]
pub struct HighPass {
    sections: [Biquad; 2],
}

impl HighPass {
    pub fn new(cutoff_hz: f32, sample_rate: u32) -> Self {
        Self {
            sections: BUTTERWORTH_Q.map(|q| Biquad::highpass(cutoff_hz, q, sample_rate)),
        }
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            let mut y = *s;
            for section in &mut self.sections {
                y = section.process(y);
            }
            *s = y;
        }
    }

    pub fn reset(&mut self) {
        for section in &mut self.sections {
            section.reset();
        }
    }
}

/// Replaces isolated clicks with the local median.
///
/// A sample is an impulse when it deviates from the median of its window by
/// more than `threshold` times the window's median absolute deviation, and
/// by more than `floor`. The window looks back into the previous frame.
#[derive(Debug, Clone)]
pub struct ImpulseSuppressor {
    half: usize,
    threshold: f32,
    floor: f32,
    history: Vec<f32>,
    extended: Vec<f32>,
    window: Vec<f32>,
}

impl ImpulseSuppressor {
    pub fn new(window: usize, threshold: f32, floor: f32) -> Self {
        let half = window.max(3) / 2;
        Self {
            half,
            threshold,
            floor,
            history: Vec::with_capacity(half),
            extended: Vec::new(),
            window: Vec::with_capacity(2 * half + 1),
        }
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        if samples.is_empty() {
            return;
        }

        self.extended.clear();
        self.extended.extend_from_slice(&self.history);
        self.extended.extend_from_slice(samples);
        let offset = self.history.len();

        for i in 0..samples.len() {
            let center = offset + i;
            let start = center.saturating_sub(self.half);
            let end = (center + self.half + 1).min(self.extended.len());

            self.window.clear();
            self.window.extend_from_slice(&self.extended[start..end]);
            let median = median_in_place(&mut self.window);
            for v in self.window.iter_mut() {
                *v = (*v - median).abs();
            }
            let mad = median_in_place(&mut self.window);

            let x = self.extended[center];
            if (x - median).abs() > (self.threshold * mad).max(self.floor) {
                samples[i] = median;
            }
        }

        let keep = self.half.min(self.extended.len());
        self.history.clear();
        self.history
            .extend_from_slice(&self.extended[self.extended.len() - keep..]);
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}

fn median_in_place(values: &mut [f32]) -> f32 {
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n == 0 {
        0.0
    } else if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Envelope-following limiter with a soft knee above `threshold`
#[derive(Debug, Clone)]
pub struct SoftLimiter {
    threshold: f32,
    ratio: f32,
    attack_coeff: f32,
    release_coeff: f32,
    envelope: f32,
}

impl SoftLimiter {
    pub fn new(threshold: f32, ratio: f32, attack_ms: f32, release_ms: f32, sample_rate: u32) -> Self {
        let coeff = |ms: f32| {
            let samples = ms * sample_rate as f32 / 1000.0;
            if samples >= 1.0 {
                (-1.0 / samples).exp()
            } else {
                0.0
            }
        };
        Self {
            threshold,
            ratio: ratio.max(1.0),
            attack_coeff: coeff(attack_ms),
            release_coeff: coeff(release_ms),
            envelope: 0.0,
        }
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            let level = s.abs();
            let coeff = if level > self.envelope {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.envelope = level + (self.envelope - level) * coeff;

            if self.envelope > self.threshold {
                let target = self.threshold + (self.envelope - self.threshold) / self.ratio;
                *s *= target / self.envelope;
            }
        }
    }

    pub fn reset(&mut self) {
        self.envelope = 0.0;
    }
}

/// The full chain in order: high-pass, impulse suppressor, limiter
pub struct ClassicalFilter {
    highpass: HighPass,
    impulse: ImpulseSuppressor,
    limiter: SoftLimiter,
}

impl ClassicalFilter {
    pub fn new(config: &ClassicalConfig, sample_rate: u32) -> Self {
        Self {
            highpass: HighPass::new(config.highpass_hz, sample_rate),
            impulse: ImpulseSuppressor::new(
                config.impulse_window,
                config.impulse_threshold,
                config.impulse_floor,
            ),
            limiter: SoftLimiter::new(
                config.limiter_threshold,
                config.limiter_ratio,
                config.limiter_attack_ms,
                config.limiter_release_ms,
                sample_rate,
            ),
        }
    }
}

impl ProcessingStage for ClassicalFilter {
    fn transform(&mut self, frame: AudioFrame) -> AudioFrame {
        let rate = frame.sample_rate();
        let mut samples = frame.into_samples();
        self.highpass.process(&mut samples);
        self.impulse.process(&mut samples);
        self.limiter.process(&mut samples);
        AudioFrame::new(samples, rate).clamped()
    }

    fn name(&self) -> &'static str {
        "ClassicalFilter"
    }

    fn reset(&mut self) {
        self.highpass.reset();
        self.impulse.reset();
        self.limiter.reset();
    }
}
