//! Receive pipeline: poll -> order check -> decode -> resample up -> jitter buffer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::stats::PipelineStats;
use crate::audio::buffer::SharedPlaybackBuffer;
use crate::audio::frame::AudioFrame;
use crate::audio::resample::{Resampler, ResamplerState};
use crate::codec::SpeechDecoder;
use crate::error::{NetworkError, Result};
use crate::network::FrameReceiver;
use crate::protocol::{seq_distance, seq_newer, EncodedPacket};
use crate::stage::{ActiveStage, StageBank};

/// Far-behind packets without an accepted one in between that mean the
/// peer restarted
const RESTART_CONFIRM: u32 = 3;

/// What the sequence check decided for an arriving packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Next expected packet, preceded by this many missing ones
    InOrder { missing: u32 },
    /// Not newer than the last accepted packet
    Stale,
    /// More than the gap limit behind, but not numbered like a restart
    FarBehind,
    /// Jump too large to fill; stream restarted
    Resync,
}

/// Classify `sequence` relative to the last accepted one
pub fn classify(last: Option<u32>, sequence: u32, max_gap: u32) -> Arrival {
    let Some(last) = last else {
        return Arrival::InOrder { missing: 0 };
    };
    if seq_newer(sequence, last) {
        let missing = seq_distance(last, sequence) - 1;
        if missing > max_gap {
            Arrival::Resync
        } else {
            Arrival::InOrder { missing }
        }
    } else if seq_distance(sequence, last) <= max_gap {
        Arrival::Stale
    } else if sequence <= max_gap {
        // A restarted peer counts from zero again
        Arrival::Resync
    } else {
        Arrival::FarBehind
    }
}

/// Sequence state of the incoming stream
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    last: Option<u32>,
    max_gap: u32,
    far_behind: u32,
}

impl SequenceTracker {
    pub fn new(max_gap: u32) -> Self {
        Self {
            last: None,
            max_gap,
            far_behind: 0,
        }
    }

    /// Last accepted sequence number
    pub fn last(&self) -> Option<u32> {
        self.last
    }

    /// Decide on `sequence`, moving past it unless it is dropped.
    ///
    /// Never returns [`Arrival::FarBehind`]: such packets are stale until
    /// enough of them arrive in a row to count as a restart.
    pub fn accept(&mut self, sequence: u32) -> Arrival {
        let arrival = match classify(self.last, sequence, self.max_gap) {
            Arrival::FarBehind => {
                self.far_behind += 1;
                if self.far_behind >= RESTART_CONFIRM {
                    Arrival::Resync
                } else {
                    Arrival::Stale
                }
            }
            other => other,
        };
        if arrival != Arrival::Stale {
            self.far_behind = 0;
            self.last = Some(sequence);
        }
        arrival
    }
}

pub struct ReceivePipeline {
    receiver: FrameReceiver,
    decoder: SpeechDecoder,
    resampler: Resampler,
    resampler_state: ResamplerState,
    stages: Option<StageBank>,
    active: ActiveStage,
    playback: SharedPlaybackBuffer,
    stats: Arc<PipelineStats>,
    sequence: SequenceTracker,
    in_decode_failure: bool,
}

impl ReceivePipeline {
    /// `stages` is only given when received audio should be transformed too
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        receiver: FrameReceiver,
        decoder: SpeechDecoder,
        resampler: Resampler,
        stages: Option<StageBank>,
        active: ActiveStage,
        playback: SharedPlaybackBuffer,
        stats: Arc<PipelineStats>,
        max_gap: u32,
    ) -> Self {
        let resampler_state = resampler.new_state();
        Self {
            receiver,
            decoder,
            resampler,
            resampler_state,
            stages,
            active,
            playback,
            stats,
            sequence: SequenceTracker::new(max_gap),
            in_decode_failure: false,
        }
    }

    pub fn run(mut self, stop: Arc<AtomicBool>) -> Result<()> {
        info!(
            "Receive pipeline started on {}",
            self.receiver
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default()
        );
        while !stop.load(Ordering::Acquire) {
            self.step()?;
        }
        info!(
            "Receive pipeline stopped after {} frames",
            self.decoder.frames_decoded()
        );
        Ok(())
    }

    /// Wait up to the receive timeout for one packet and handle it
    pub fn step(&mut self) -> Result<()> {
        match self.receiver.receive_timeout() {
            Ok(Some(packet)) => self.handle_packet(packet),
            Ok(None) => Ok(()),
            Err(NetworkError::InvalidPacket(reason)) => {
                self.stats.record_invalid();
                debug!("Ignoring datagram: {}", reason);
                Ok(())
            }
            Err(NetworkError::PacketTooLarge(len)) => {
                self.stats.record_invalid();
                debug!("Ignoring oversize datagram of {} bytes", len);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply the sequence check, then decode and queue for playback
    pub fn handle_packet(&mut self, packet: EncodedPacket) -> Result<()> {
        let last = self.sequence.last();
        match self.sequence.accept(packet.sequence) {
            Arrival::Stale | Arrival::FarBehind => {
                self.stats.record_late();
                debug!("Dropping stale packet #{} (last #{:?})", packet.sequence, last);
                return Ok(());
            }
            Arrival::Resync => {
                self.stats.record_resync();
                info!("Sequence jumped from {:?} to #{}, resyncing", last, packet.sequence);
                if let Err(e) = self.decoder.reset() {
                    warn!("Decoder reset failed: {}", e);
                }
            }
            Arrival::InOrder { missing } => {
                if missing > 0 {
                    self.stats.record_lost(missing as u64);
                    debug!("{} packets missing before #{}", missing, packet.sequence);
                    for _ in 0..missing {
                        let silence = self.decoder.silence();
                        self.deliver(silence)?;
                    }
                }
            }
        }

        let frame = match self.decoder.decode(&packet) {
            Ok(frame) => {
                self.in_decode_failure = false;
                frame
            }
            Err(e) => {
                self.stats.record_decode_error();
                if !self.in_decode_failure {
                    warn!("Packet #{} undecodable, playing silence: {}", packet.sequence, e);
                    self.in_decode_failure = true;
                }
                self.decoder.silence()
            }
        };
        self.stats.record_frame(packet.wire_len());
        self.deliver(frame)
    }

    fn deliver(&mut self, frame: AudioFrame) -> Result<()> {
        let peak_in = frame.peak();
        let frame = match self.stages.as_mut() {
            Some(stages) => {
                let kind = self.active.current();
                let started = Instant::now();
                let out = stages.run(kind, frame);
                self.stats.record_processing(started.elapsed());
                out
            }
            None => frame,
        };

        let frame = self
            .resampler
            .process_frame_stream(&mut self.resampler_state, &frame)?;
        self.stats.record_levels(peak_in, frame.peak());
        self.playback.push_frame(frame);
        Ok(())
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_sequences() {
        assert_eq!(classify(None, 42, 50), Arrival::InOrder { missing: 0 });
        assert_eq!(classify(Some(1), 2, 50), Arrival::InOrder { missing: 0 });
        assert_eq!(classify(Some(1), 5, 50), Arrival::InOrder { missing: 3 });
        assert_eq!(classify(Some(5), 5, 50), Arrival::Stale);
        assert_eq!(classify(Some(5), 3, 50), Arrival::Stale);
        assert_eq!(classify(Some(1), 100, 50), Arrival::Resync);
        // Peer restarted from zero
        assert_eq!(classify(Some(5000), 0, 50), Arrival::Resync);
    }

    #[test]
    fn test_classify_wraps() {
        assert_eq!(classify(Some(u32::MAX), 0, 50), Arrival::InOrder { missing: 0 });
        assert_eq!(classify(Some(u32::MAX - 1), 1, 50), Arrival::InOrder { missing: 2 });
        assert_eq!(classify(Some(0), u32::MAX, 50), Arrival::Stale);
    }

    #[test]
    fn test_very_late_duplicate_is_dropped() {
        assert_eq!(classify(Some(5000), 4000, 50), Arrival::FarBehind);

        let mut seq = SequenceTracker::new(50);
        assert_eq!(seq.accept(5000), Arrival::InOrder { missing: 0 });
        assert_eq!(seq.accept(4000), Arrival::Stale);
        assert_eq!(seq.last(), Some(5000));
        // The stream carries on and its gaps are still filled
        assert_eq!(seq.accept(5001), Arrival::InOrder { missing: 0 });
        assert_eq!(seq.accept(5003), Arrival::InOrder { missing: 1 });
    }

    #[test]
    fn test_restart_detected() {
        let mut seq = SequenceTracker::new(50);
        seq.accept(5000);
        assert_eq!(seq.accept(3), Arrival::Resync);
        assert_eq!(seq.accept(4), Arrival::InOrder { missing: 0 });

        // Restart whose first packets were lost
        let mut seq = SequenceTracker::new(50);
        seq.accept(5000);
        assert_eq!(seq.accept(900), Arrival::Stale);
        assert_eq!(seq.accept(901), Arrival::Stale);
        assert_eq!(seq.accept(902), Arrival::Resync);
        assert_eq!(seq.accept(903), Arrival::InOrder { missing: 0 });
        assert_eq!(seq.last(), Some(903));
    }

    #[test]
    fn test_far_behind_count_clears_on_accept() {
        let mut seq = SequenceTracker::new(50);
        seq.accept(5000);
        assert_eq!(seq.accept(900), Arrival::Stale);
        assert_eq!(seq.accept(901), Arrival::Stale);
        assert_eq!(seq.accept(5001), Arrival::InOrder { missing: 0 });
        assert_eq!(seq.accept(902), Arrival::Stale);
    }
}
