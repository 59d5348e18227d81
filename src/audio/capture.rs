//! Microphone capture
//!
//! The cpal input callback copies channel 0 of every block into a buffer
//! taken from the capture queue's pool and pushes it. It never blocks or
//! logs, and only allocates if the pool has run dry. The stream lives on its
//! own thread because cpal streams are not `Send` on every platform.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::info;

use crate::audio::buffer::SharedCaptureQueue;
use crate::audio::device::{input_device, stream_config, Direction};
use crate::error::AudioError;

/// How long to wait for the stream thread to report it is running
const STARTUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Append the first channel of an interleaved block to `out`
pub fn first_channel_into(data: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(data);
    } else {
        out.extend(data.iter().step_by(channels).copied());
    }
}

/// Running input stream feeding a capture queue
pub struct AudioCapture {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Receiver<AudioError>,
    samples_captured: Arc<AtomicU64>,
    channels: u16,
    sample_rate: u32,
}

impl AudioCapture {
    /// Open the named (or default) input device and start streaming
    pub fn start(
        device_name: Option<&str>,
        sample_rate: u32,
        channels: u16,
        queue: SharedCaptureQueue,
    ) -> Result<Self, AudioError> {
        let device = input_device(device_name)?;
        let config = stream_config(&device, Direction::Input, sample_rate, channels)?;
        let device_label = device.name().unwrap_or_else(|_| "unknown".to_string());

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let running = Arc::new(AtomicBool::new(true));
        let samples_captured = Arc::new(AtomicU64::new(0));
        let stream_channels = config.channels;

        let handle = {
            let running = running.clone();
            let samples_captured = samples_captured.clone();
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || {
                    run_stream(device, config, queue, running, samples_captured, error_tx, ready_tx)
                })
                .map_err(|e| AudioError::StreamError(e.to_string()))?
        };

        let mut capture = Self {
            running,
            thread_handle: Some(handle),
            error_rx,
            samples_captured,
            channels: stream_channels,
            sample_rate,
        };

        match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(())) => {
                info!(
                    "Capture started: {} @ {} Hz, {} ch (using channel 0)",
                    device_label, sample_rate, stream_channels
                );
                Ok(capture)
            }
            Ok(Err(e)) => {
                capture.stop();
                Err(e)
            }
            Err(_) => {
                capture.stop();
                Err(AudioError::StreamError("capture stream did not start".into()))
            }
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Mono samples delivered so far
    pub fn samples_captured(&self) -> u64 {
        self.samples_captured.load(Ordering::Relaxed)
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Next error reported by the stream, if any
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_stream(
    device: cpal::Device,
    config: cpal::StreamConfig,
    queue: SharedCaptureQueue,
    running: Arc<AtomicBool>,
    samples_captured: Arc<AtomicU64>,
    error_tx: Sender<AudioError>,
    ready_tx: Sender<Result<(), AudioError>>,
) {
    let channels = config.channels as usize;
    let callback_running = running.clone();

    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            if !callback_running.load(Ordering::Relaxed) {
                return;
            }
            let mut mono = queue.take_block();
            first_channel_into(data, channels, &mut mono);
            samples_captured.fetch_add(mono.len() as u64, Ordering::Relaxed);
            queue.push(mono);
        },
        move |err| {
            let _ = error_tx.try_send(AudioError::Disconnected(err.to_string()));
        },
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(10));
    }
    // Dropping the stream closes the device
}
