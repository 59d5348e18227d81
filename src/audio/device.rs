//! Audio device lookup and enumeration

use cpal::traits::{DeviceTrait, HostTrait};
use tracing::info;

use crate::error::AudioError;

/// Rates worth reporting when listing devices
const PROBE_RATES: [u32; 5] = [8000, 16000, 44100, 48000, 96000];

/// Summary of one device for listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Direction of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Open an input device by name, or the default one
pub fn input_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    find_device(Direction::Input, name)
}

/// Open an output device by name, or the default one
pub fn output_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    find_device(Direction::Output, name)
}

fn find_device(direction: Direction, name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(wanted) = name else {
        let device = match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        };
        return device.ok_or_else(|| {
            AudioError::DeviceNotFound(format!("no default {:?} device", direction).to_lowercase())
        });
    };

    let devices = match direction {
        Direction::Input => host.input_devices(),
        Direction::Output => host.output_devices(),
    }
    .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == wanted).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(AudioError::DeviceNotFound(wanted.to_string()))
}

/// Pick a stream config at `sample_rate`, preferring `channels`.
///
/// Falls back to any channel count the device supports at that rate.
pub fn stream_config(
    device: &cpal::Device,
    direction: Direction,
    sample_rate: u32,
    channels: u16,
) -> Result<cpal::StreamConfig, AudioError> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = match direction {
        Direction::Input => device.supported_input_configs().map(|it| it.collect()),
        Direction::Output => device.supported_output_configs().map(|it| it.collect()),
    }
    .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?;

    let rate = cpal::SampleRate(sample_rate);
    let supports_rate =
        |r: &&cpal::SupportedStreamConfigRange| r.min_sample_rate() <= rate && rate <= r.max_sample_rate();

    let chosen = ranges
        .iter()
        .filter(supports_rate)
        .find(|r| r.channels() == channels)
        .or_else(|| ranges.iter().find(supports_rate))
        .ok_or_else(|| {
            AudioError::UnsupportedFormat(format!("{} Hz not supported by device", sample_rate))
        })?;

    Ok(cpal::StreamConfig {
        channels: chosen.channels(),
        sample_rate: rate,
        buffer_size: cpal::BufferSize::Default,
    })
}

/// Enumerate input and output devices of the default host
pub fn list_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let mut devices: Vec<DeviceInfo> = Vec::new();

    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            let Ok(name) = device.name() else { continue };
            let (sample_rates, channels) = capabilities(&device, Direction::Input);
            devices.push(DeviceInfo {
                is_default: default_input.as_ref() == Some(&name),
                name,
                is_input: true,
                is_output: false,
                sample_rates,
                channels,
            });
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            let Ok(name) = device.name() else { continue };
            let is_default = default_output.as_ref() == Some(&name);
            if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                existing.is_output = true;
                existing.is_default |= is_default;
                continue;
            }
            let (sample_rates, channels) = capabilities(&device, Direction::Output);
            devices.push(DeviceInfo {
                name,
                is_input: false,
                is_output: true,
                is_default,
                sample_rates,
                channels,
            });
        }
    }

    devices
}

fn capabilities(device: &cpal::Device, direction: Direction) -> (Vec<u32>, Vec<u16>) {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = match direction {
        Direction::Input => device.supported_input_configs().map(|it| it.collect()),
        Direction::Output => device.supported_output_configs().map(|it| it.collect()),
    }
    .unwrap_or_default();

    let mut rates = Vec::new();
    let mut channels = Vec::new();
    for range in &ranges {
        for rate in PROBE_RATES {
            let r = cpal::SampleRate(rate);
            if range.min_sample_rate() <= r && r <= range.max_sample_rate() && !rates.contains(&rate) {
                rates.push(rate);
            }
        }
        if !channels.contains(&range.channels()) {
            channels.push(range.channels());
        }
    }
    rates.sort_unstable();
    channels.sort_unstable();
    (rates, channels)
}

/// Log the device list at startup
pub fn log_devices() {
    let devices = list_devices();
    if devices.is_empty() {
        info!("No audio devices found");
        return;
    }
    for d in devices {
        let kind = match (d.is_input, d.is_output) {
            (true, true) => "in/out",
            (true, false) => "in",
            _ => "out",
        };
        info!(
            "Audio device [{}]{} {} rates={:?} channels={:?}",
            kind,
            if d.is_default { " (default)" } else { "" },
            d.name,
            d.sample_rates,
            d.channels
        );
    }
}
