//! Mono audio frames tagged with their sample rate

/// A block of mono samples in `[-1.0, 1.0]` produced at `sample_rate`.
///
/// Frames are handed from stage to stage by value. A stage that changes the
/// samples returns a new frame instead of mutating one it no longer owns.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Zero-filled frame of `len` samples
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0.0; len], sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Frame duration in microseconds
    pub fn duration_us(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1_000_000) / self.sample_rate as u64
    }

    /// Largest absolute sample value
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
    }

    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|s| *s == 0.0)
    }

    /// Clamp every sample into `[-1.0, 1.0]`
    pub fn clamped(mut self) -> Self {
        for s in &mut self.samples {
            *s = s.clamp(-1.0, 1.0);
        }
        self
    }
}

/// Root-mean-square level of a sample slice
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|s| (*s as f64) * (*s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Number of samples in one frame of `frame_ms` at `sample_rate`
pub fn frame_len(sample_rate: u32, frame_ms: f32) -> usize {
    (sample_rate as f64 * frame_ms as f64 / 1000.0).round() as usize
}
