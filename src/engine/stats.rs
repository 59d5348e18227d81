//! Per-pipeline counters
//!
//! Each pipeline owns one [`PipelineStats`] and is its only writer. Readers
//! take a [`StatsSnapshot`] with relaxed loads; values are eventually
//! consistent with each other.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::stage::StageKind;

/// Which way a pipeline moves audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => write!(f, "TX"),
            Direction::Receive => write!(f, "RX"),
        }
    }
}

#[derive(Debug)]
pub struct PipelineStats {
    direction: Direction,
    frame_ns: u64,
    frames: AtomicU64,
    bytes: AtomicU64,
    lost: AtomicU64,
    late: AtomicU64,
    invalid: AtomicU64,
    resyncs: AtomicU64,
    decode_errors: AtomicU64,
    encode_errors: AtomicU64,
    send_errors: AtomicU64,
    overruns: AtomicU64,
    last_process_ns: AtomicU64,
    max_process_ns: AtomicU64,
    total_process_ns: AtomicU64,
    processed: AtomicU64,
    /// f32 bit patterns
    peak_in: AtomicU32,
    peak_out: AtomicU32,
}

impl PipelineStats {
    /// `frame_duration` is the real-time budget RTF is measured against
    pub fn new(direction: Direction, frame_duration: Duration) -> Self {
        Self {
            direction,
            frame_ns: frame_duration.as_nanos().max(1) as u64,
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            late: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            encode_errors: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            last_process_ns: AtomicU64::new(0),
            max_process_ns: AtomicU64::new(0),
            total_process_ns: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            peak_in: AtomicU32::new(0),
            peak_out: AtomicU32::new(0),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn record_frame(&self, bytes: usize) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_lost(&self, count: u64) {
        self.lost.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_late(&self) {
        self.late.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encode_error(&self) {
        self.encode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    /// Time spent in the transform stage for one frame
    pub fn record_processing(&self, elapsed: Duration) {
        let ns = elapsed.as_nanos() as u64;
        self.last_process_ns.store(ns, Ordering::Relaxed);
        self.max_process_ns.fetch_max(ns, Ordering::Relaxed);
        self.total_process_ns.fetch_add(ns, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_levels(&self, peak_in: f32, peak_out: f32) {
        self.peak_in.store(peak_in.to_bits(), Ordering::Relaxed);
        self.peak_out.store(peak_out.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let total_ns = self.total_process_ns.load(Ordering::Relaxed);
        let last_ns = self.last_process_ns.load(Ordering::Relaxed);
        let max_ns = self.max_process_ns.load(Ordering::Relaxed);
        let avg_ns = if processed > 0 { total_ns / processed } else { 0 };

        StatsSnapshot {
            direction: self.direction,
            frames: self.frames.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            last_process: Duration::from_nanos(last_ns),
            max_process: Duration::from_nanos(max_ns),
            rtf_avg: avg_ns as f64 / self.frame_ns as f64,
            rtf_max: max_ns as f64 / self.frame_ns as f64,
            peak_in: f32::from_bits(self.peak_in.load(Ordering::Relaxed)),
            peak_out: f32::from_bits(self.peak_out.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of one pipeline's counters
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub direction: Direction,
    pub frames: u64,
    pub bytes: u64,
    /// Frames missing from the sequence, replaced by silence
    pub lost: u64,
    /// Stale or duplicate packets dropped
    pub late: u64,
    pub invalid: u64,
    pub resyncs: u64,
    pub decode_errors: u64,
    pub encode_errors: u64,
    pub send_errors: u64,
    pub overruns: u64,
    pub last_process: Duration,
    pub max_process: Duration,
    pub rtf_avg: f64,
    pub rtf_max: f64,
    pub peak_in: f32,
    pub peak_out: f32,
}

impl StatsSnapshot {
    /// Lost frames as a fraction of expected frames
    pub fn loss_rate(&self) -> f64 {
        let expected = self.frames + self.lost;
        if expected == 0 {
            0.0
        } else {
            self.lost as f64 / expected as f64
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames={} bytes={} lost={} ({:.1}%) late={} invalid={} decode_err={} send_err={} overruns={} proc={:.2}ms max={:.2}ms rtf={:.3}/{:.3} peak in={:.2} out={:.2}",
            self.direction,
            self.frames,
            self.bytes,
            self.lost,
            self.loss_rate() * 100.0,
            self.late,
            self.invalid,
            self.decode_errors,
            self.send_errors,
            self.overruns,
            self.last_process.as_secs_f64() * 1000.0,
            self.max_process.as_secs_f64() * 1000.0,
            self.rtf_avg,
            self.rtf_max,
            self.peak_in,
            self.peak_out,
        )
    }
}

/// Whole-engine report
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStats {
    pub tx: StatsSnapshot,
    pub rx: StatsSnapshot,
    pub active_stage: StageKind,
    /// Capture blocks dropped because the send pipeline fell behind
    pub capture_drops: u64,
    pub jitter_depth: usize,
    /// Playback frames dropped to bound latency
    pub playback_drops: u64,
    pub underruns: u64,
}

impl EngineStats {
    /// Frames per second in each direction since `previous`
    pub fn rates_since(&self, previous: &EngineStats, elapsed: Duration) -> (f64, f64) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return (0.0, 0.0);
        }
        (
            self.tx.frames.saturating_sub(previous.tx.frames) as f64 / secs,
            self.rx.frames.saturating_sub(previous.rx.frames) as f64 / secs,
        )
    }
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "stage={}", self.active_stage)?;
        writeln!(f, "  {} capture_drops={}", self.tx, self.capture_drops)?;
        write!(
            f,
            "  {} jitter={} playback_drops={} underruns={}",
            self.rx, self.jitter_depth, self.playback_drops, self.underruns
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_rtf() {
        let stats = PipelineStats::new(Direction::Send, Duration::from_millis(20));
        stats.record_processing(Duration::from_millis(2));
        stats.record_processing(Duration::from_millis(6));

        let snap = stats.snapshot();
        assert_eq!(snap.last_process, Duration::from_millis(6));
        assert_eq!(snap.max_process, Duration::from_millis(6));
        assert!((snap.rtf_avg - 0.2).abs() < 1e-9);
        assert!((snap.rtf_max - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_counters_and_loss_rate() {
        let stats = PipelineStats::new(Direction::Receive, Duration::from_millis(20));
        for _ in 0..9 {
            stats.record_frame(64);
        }
        stats.record_lost(1);
        stats.record_late();
        stats.record_levels(0.5, 0.25);

        let snap = stats.snapshot();
        assert_eq!(snap.frames, 9);
        assert_eq!(snap.bytes, 576);
        assert_eq!(snap.late, 1);
        assert!((snap.loss_rate() - 0.1).abs() < 1e-9);
        assert_eq!(snap.peak_in, 0.5);
        assert!(snap.to_string().starts_with("RX frames=9"));
    }
}
