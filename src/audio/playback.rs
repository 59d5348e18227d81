//! Speaker playback
//!
//! The cpal output callback drains the jitter buffer through a
//! [`PlaybackCursor`] and copies the mono signal onto every device channel.
//! When the buffer is dry it writes silence instead of waiting.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::info;

use crate::audio::buffer::{PlaybackCursor, SharedPlaybackBuffer};
use crate::audio::device::{output_device, stream_config, Direction};
use crate::error::AudioError;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Copy each mono sample onto all `channels` of an interleaved buffer
pub fn fan_out(mono: &[f32], out: &mut [f32], channels: usize) {
    let channels = channels.max(1);
    for (slot, sample) in out.chunks_mut(channels).zip(mono.iter()) {
        slot.fill(*sample);
    }
}

/// Running output stream draining a playback buffer
pub struct AudioPlayback {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Receiver<AudioError>,
    silent_samples: Arc<AtomicU64>,
    channels: u16,
    sample_rate: u32,
}

impl AudioPlayback {
    /// Open the named (or default) output device and start streaming
    pub fn start(
        device_name: Option<&str>,
        sample_rate: u32,
        channels: u16,
        buffer: SharedPlaybackBuffer,
    ) -> Result<Self, AudioError> {
        let device = output_device(device_name)?;
        let config = stream_config(&device, Direction::Output, sample_rate, channels)?;
        let device_label = device.name().unwrap_or_else(|_| "unknown".to_string());

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let running = Arc::new(AtomicBool::new(true));
        let silent_samples = Arc::new(AtomicU64::new(0));
        let stream_channels = config.channels;

        let handle = {
            let running = running.clone();
            let silent_samples = silent_samples.clone();
            thread::Builder::new()
                .name("audio-playback".into())
                .spawn(move || {
                    run_stream(device, config, buffer, running, silent_samples, error_tx, ready_tx)
                })
                .map_err(|e| AudioError::StreamError(e.to_string()))?
        };

        let mut playback = Self {
            running,
            thread_handle: Some(handle),
            error_rx,
            silent_samples,
            channels: stream_channels,
            sample_rate,
        };

        match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(())) => {
                info!(
                    "Playback started: {} @ {} Hz, {} ch",
                    device_label, sample_rate, stream_channels
                );
                Ok(playback)
            }
            Ok(Err(e)) => {
                playback.stop();
                Err(e)
            }
            Err(_) => {
                playback.stop();
                Err(AudioError::StreamError("playback stream did not start".into()))
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

    /// Mono samples of silence written because the buffer was dry
    pub fn silent_samples(&self) -> u64 {
        self.silent_samples.load(Ordering::Relaxed)
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_stream(
    device: cpal::Device,
    config: cpal::StreamConfig,
    buffer: SharedPlaybackBuffer,
    running: Arc<AtomicBool>,
    silent_samples: Arc<AtomicU64>,
    error_tx: Sender<AudioError>,
    ready_tx: Sender<Result<(), AudioError>>,
) {
    let channels = config.channels as usize;
    let mut cursor = PlaybackCursor::new();
    let mut mono: Vec<f32> = Vec::new();

    let stream = device.build_output_stream(
        &config,
        move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let frames = out.len() / channels.max(1);
            // Grows to the device period once, then stays
            if mono.len() < frames {
                mono.resize(frames, 0.0);
            }
            let before = cursor.silent_samples();
            cursor.fill(&buffer, &mut mono[..frames]);
            let silent = cursor.silent_samples() - before;
            if silent > 0 {
                silent_samples.fetch_add(silent, Ordering::Relaxed);
            }
            fan_out(&mono[..frames], out, channels);
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
}
