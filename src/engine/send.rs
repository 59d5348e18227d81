//! Send pipeline: capture -> resample down -> transform -> encode -> send

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::stats::PipelineStats;
use crate::audio::buffer::{SampleAccumulator, SharedCaptureQueue};
use crate::audio::frame::AudioFrame;
use crate::audio::resample::{Resampler, ResamplerState};
use crate::codec::SpeechEncoder;
use crate::error::Result;
use crate::network::FrameSender;
use crate::stage::{ActiveStage, StageBank};

pub struct SendPipeline {
    queue: SharedCaptureQueue,
    accumulator: SampleAccumulator,
    hardware_rate: u32,
    resampler: Resampler,
    resampler_state: ResamplerState,
    stages: StageBank,
    active: ActiveStage,
    encoder: SpeechEncoder,
    sender: FrameSender,
    stats: Arc<PipelineStats>,
    frame_budget: Duration,
    poll_timeout: Duration,
    seen_overflows: u64,
    in_overrun: bool,
    in_send_failure: bool,
}

impl SendPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: SharedCaptureQueue,
        hardware_frame_len: usize,
        resampler: Resampler,
        stages: StageBank,
        active: ActiveStage,
        encoder: SpeechEncoder,
        sender: FrameSender,
        stats: Arc<PipelineStats>,
        frame_budget: Duration,
    ) -> Self {
        let resampler_state = resampler.new_state();
        Self {
            queue,
            accumulator: SampleAccumulator::new(hardware_frame_len),
            hardware_rate: resampler.from_rate(),
            resampler,
            resampler_state,
            stages,
            active,
            encoder,
            sender,
            stats,
            frame_budget,
            poll_timeout: frame_budget,
            seen_overflows: 0,
            in_overrun: false,
            in_send_failure: false,
        }
    }

    /// Loop until `stop` is raised, finishing the frame in flight
    pub fn run(mut self, stop: Arc<AtomicBool>) -> Result<()> {
        info!("Send pipeline started -> {}", self.sender.target());
        while !stop.load(Ordering::Acquire) {
            self.step()?;
        }
        info!(
            "Send pipeline stopped after {} packets",
            self.sender.packets_sent()
        );
        Ok(())
    }

    /// Wait briefly for captured audio and send every complete frame.
    /// Returns the number of frames sent.
    pub fn step(&mut self) -> Result<usize> {
        let Some(block) = self.queue.pop_timeout(self.poll_timeout) else {
            return Ok(0);
        };
        self.accumulator.push(&block);
        self.queue.recycle(block);

        let overflows = self.queue.overflow_count();
        if overflows > self.seen_overflows {
            warn!(
                "Send pipeline behind real time: dropped {} oldest capture blocks",
                overflows - self.seen_overflows
            );
            self.seen_overflows = overflows;
        }

        let mut sent = 0;
        while let Some(samples) = self.accumulator.next_frame() {
            self.process_frame(AudioFrame::new(samples, self.hardware_rate))?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Run one hardware-rate frame through the whole chain
    pub fn process_frame(&mut self, frame: AudioFrame) -> Result<()> {
        let peak_in = frame.peak();
        let frame = self
            .resampler
            .process_frame_stream(&mut self.resampler_state, &frame)?;

        // One load per frame; a toggle only affects the next frame
        let kind = self.active.current();
        let started = Instant::now();
        let processed = self.stages.run(kind, frame);
        let elapsed = started.elapsed();
        self.stats.record_processing(elapsed);
        self.stats.record_levels(peak_in, processed.peak());

        if elapsed > self.frame_budget {
            self.stats.record_overrun();
            if !self.in_overrun {
                warn!(
                    "{} took {:.1} ms, over the {:.1} ms frame budget",
                    kind,
                    elapsed.as_secs_f64() * 1000.0,
                    self.frame_budget.as_secs_f64() * 1000.0
                );
            }
            self.in_overrun = true;
        } else {
            self.in_overrun = false;
        }

        let packet = match self.encoder.encode(&processed) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.record_encode_error();
                warn!("Dropping frame: {}", e);
                return Ok(());
            }
        };

        match self.sender.send(&packet) {
            Ok(()) => {
                self.stats.record_frame(packet.wire_len());
                if self.in_send_failure {
                    info!("Sending to {} again", self.sender.target());
                    self.in_send_failure = false;
                }
            }
            Err(e) => {
                self.stats.record_send_error();
                if self.in_send_failure {
                    debug!("Send failed: {}", e);
                } else {
                    warn!("Send failed: {}", e);
                    self.in_send_failure = true;
                }
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }
}
