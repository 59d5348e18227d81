//! Full-duplex engine
//!
//! Owns the two pipelines and the state they share:
//!
//! ```text
//!  mic callback -> CaptureQueue -> [send thread] resample/transform/encode -> UDP
//!  UDP -> [recv thread] order/decode/resample -> PlaybackBuffer -> speaker callback
//! ```
//!
//! The only state both pipelines see is the [`ActiveStage`] selector and the
//! stop flag. Everything that can fail at setup (config, sockets, codecs,
//! models) fails in [`DuplexEngine::new`], before any thread runs.

pub mod receive;
pub mod send;
pub mod stats;

pub use receive::ReceivePipeline;
pub use send::SendPipeline;
pub use stats::{Direction, EngineStats, PipelineStats, StatsSnapshot};

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

use crate::audio::buffer::{CaptureQueue, PlaybackBuffer, SharedCaptureQueue, SharedPlaybackBuffer};
use crate::audio::resample::Resampler;
use crate::codec::{SpeechDecoder, SpeechEncoder};
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::network::FrameTransport;
use crate::stage::{ActiveStage, ModelFactory, StageBank, StageKind};

/// Raises the stop flag when a pipeline thread exits for any reason
struct StopOnExit(Arc<AtomicBool>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

enum Lifecycle {
    Ready(Box<(SendPipeline, ReceivePipeline)>),
    Running(Vec<(&'static str, JoinHandle<Result<()>>)>),
    Stopped,
}

pub struct DuplexEngine {
    config: AppConfig,
    active: ActiveStage,
    capture_queue: SharedCaptureQueue,
    playback: SharedPlaybackBuffer,
    tx_stats: Arc<PipelineStats>,
    rx_stats: Arc<PipelineStats>,
    local_addr: Option<SocketAddr>,
    stop_flag: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
}

impl DuplexEngine {
    /// Validate `config`, bind the link and build both pipelines.
    ///
    /// `models` is required when the stage cycle contains NeuralDenoise.
    pub fn new(config: AppConfig, models: Option<ModelFactory>) -> Result<Self> {
        config.validate()?;

        let hw_rate = config.audio.hardware_rate;
        let proc_rate = config.audio.processing_rate;
        let proc_len = config.processing_frame_len();
        let frame_duration = config.frame_duration();

        let active = ActiveStage::from_config(&config.stages);
        let send_stages = StageBank::build(&config.stages, proc_rate, models.as_ref())?;
        let recv_stages = if config.stages.transform_on_receive {
            Some(StageBank::build(&config.stages, proc_rate, models.as_ref())?)
        } else {
            None
        };

        let encoder = SpeechEncoder::new(proc_rate, proc_len, &config.codec)?;
        let decoder = SpeechDecoder::new(proc_rate, proc_len)?;

        let transport = FrameTransport::bind(&config)?;
        let local_addr = transport.local_addr();
        let (sender, receiver) = transport.split();

        let capture_queue = Arc::new(CaptureQueue::new(config.audio.capture_queue_depth));
        let playback = Arc::new(PlaybackBuffer::new(
            config.jitter.target_depth,
            config.jitter.max_depth,
        ));
        let tx_stats = Arc::new(PipelineStats::new(Direction::Send, frame_duration));
        let rx_stats = Arc::new(PipelineStats::new(Direction::Receive, frame_duration));

        let send = SendPipeline::new(
            capture_queue.clone(),
            config.hardware_frame_len(),
            Resampler::new(hw_rate, proc_rate)?,
            send_stages,
            active.clone(),
            encoder,
            sender,
            tx_stats.clone(),
            frame_duration,
        );
        let receive = ReceivePipeline::new(
            receiver,
            decoder,
            Resampler::new(proc_rate, hw_rate)?,
            recv_stages,
            active.clone(),
            playback.clone(),
            rx_stats.clone(),
            config.jitter.max_gap,
        );

        info!(
            "Engine ready: node {}, {} Hz hardware / {} Hz processing, {} ms frames, stage {}",
            config.link.role,
            hw_rate,
            proc_rate,
            config.audio.frame_ms,
            active.current()
        );

        Ok(Self {
            config,
            active,
            capture_queue,
            playback,
            tx_stats,
            rx_stats,
            local_addr,
            stop_flag: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(Lifecycle::Ready(Box::new((send, receive)))),
        })
    }

    /// Spawn the send and receive pipeline threads
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        let pipelines = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Ready(pipelines) => pipelines,
            other => {
                *lifecycle = other;
                return Err(Error::Engine("engine already started".into()));
            }
        };
        let (send, receive) = *pipelines;

        let send_handle = self.spawn("send-pipeline", move |stop| send.run(stop))?;
        let recv_handle = match self.spawn("recv-pipeline", move |stop| receive.run(stop)) {
            Ok(handle) => handle,
            Err(e) => {
                self.stop_flag.store(true, Ordering::Release);
                let _ = send_handle.join();
                return Err(e);
            }
        };

        *lifecycle = Lifecycle::Running(vec![("send", send_handle), ("receive", recv_handle)]);
        info!("Engine started");
        Ok(())
    }

    fn spawn<F>(&self, name: &str, body: F) -> Result<JoinHandle<Result<()>>>
    where
        F: FnOnce(Arc<AtomicBool>) -> Result<()> + Send + 'static,
    {
        let stop = self.stop_flag.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = StopOnExit(stop.clone());
                let result = body(stop);
                if let Err(e) = &result {
                    error!("Pipeline failed: {}", e);
                }
                result
            })
            .map_err(|e| Error::Engine(format!("cannot spawn {}: {}", name, e)))
    }

    /// Advance to the next processing stage; returns the new one
    pub fn toggle(&self) -> StageKind {
        self.active.toggle()
    }

    pub fn active_stage(&self) -> StageKind {
        self.active.current()
    }

    pub fn active_stage_name(&self) -> &'static str {
        self.active.current().name()
    }

    /// Shared selector, for control surfaces
    pub fn stage_selector(&self) -> ActiveStage {
        self.active.clone()
    }

    /// True while both pipelines run; false once either one has exited
    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
            && !self.stop_flag.load(Ordering::Acquire)
    }

    /// Signal both pipelines, wait for them to finish their current frame
    /// and exit, and report the first failure. Calling it again is a no-op.
    pub fn stop(&self) -> Result<()> {
        self.stop_flag.store(true, Ordering::Release);

        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        let handles = match previous {
            Lifecycle::Running(handles) => handles,
            Lifecycle::Ready(_) | Lifecycle::Stopped => return Ok(()),
        };

        let mut first_error = None;
        for (name, handle) in handles {
            let outcome = match handle.join() {
                Ok(result) => result,
                Err(_) => Err(Error::Engine(format!("{} pipeline panicked", name))),
            };
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }

        info!("Engine stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Where the capture callback pushes hardware-rate mono blocks
    pub fn capture_queue(&self) -> SharedCaptureQueue {
        self.capture_queue.clone()
    }

    /// Where the playback callback pulls hardware-rate frames from
    pub fn playback_buffer(&self) -> SharedPlaybackBuffer {
        self.playback.clone()
    }

    /// Bound receive address
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            tx: self.tx_stats.snapshot(),
            rx: self.rx_stats.snapshot(),
            active_stage: self.active.current(),
            capture_drops: self.capture_queue.overflow_count(),
            jitter_depth: self.playback.depth(),
            playback_drops: self.playback.dropped_count(),
            underruns: self.playback.underrun_count(),
        }
    }
}

impl Drop for DuplexEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
