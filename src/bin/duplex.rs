//! Full-duplex voice node. See `duplex --help` for options.
//!
//! Press Enter to cycle the processing stage, `q` then Enter to quit.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_duplex::{
    audio::{device::log_devices, AudioCapture, AudioPlayback},
    config::AppConfig,
    control::{self, ListenerExit},
    engine::DuplexEngine,
    protocol::Role,
    stage::neural::model_factory,
};

/// How often device and pipeline health is checked
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(200);

/// Full-duplex voice node
#[derive(Parser, Debug)]
#[command(name = "duplex")]
#[command(about = "Two-way speech over UDP with a switchable denoising stage", long_about = None)]
struct CliArgs {
    /// Configuration file (defaults to the per-user config if present)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Which end of the link this node is
    #[arg(long, value_name = "A|B", value_parser = parse_role)]
    role: Option<Role>,

    /// Address of the other node
    #[arg(long, value_name = "ADDR")]
    peer_ip: Option<IpAddr>,

    /// Input device name
    #[arg(long, value_name = "NAME")]
    mic_device: Option<String>,

    /// Output device name
    #[arg(long, value_name = "NAME")]
    speaker_device: Option<String>,

    /// Denoising model file; adds the neural stage to the cycle
    #[arg(long, value_name = "FILE")]
    model: Option<PathBuf>,

    /// Log the audio devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn parse_role(value: &str) -> std::result::Result<Role, String> {
    match value {
        "A" | "a" => Ok(Role::A),
        "B" | "b" => Ok(Role::B),
        other => Err(format!("role must be A or B, got {}", other)),
    }
}

impl CliArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(role) = self.role {
            config.link.role = role;
        }
        if let Some(ip) = self.peer_ip {
            config.link.peer_address = ip;
        }
        if self.mic_device.is_some() {
            config.audio.input_device = self.mic_device.clone();
        }
        if self.speaker_device.is_some() {
            config.audio.output_device = self.speaker_device.clone();
        }
        if let Some(path) = &self.model {
            config.stages.enable_neural(path.clone());
        }
    }
}

fn load_config(cli: &CliArgs) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => match AppConfig::default_path().filter(|p| p.exists()) {
            Some(path) => {
                info!("Using configuration {}", path.display());
                AppConfig::load(&path)?
            }
            None => {
                info!("No configuration file, using defaults");
                AppConfig::default()
            }
        },
    };
    cli.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = CliArgs::parse();
    if cli.list_devices {
        log_devices();
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let result = runtime.block_on(run(cli));
    // A pending console read must not hold up exit
    runtime.shutdown_timeout(Duration::from_millis(250));
    result
}

async fn run(cli: CliArgs) -> Result<()> {
    let config = load_config(&cli)?;
    info!("Starting voice duplex node {}", config.link.role);
    log_devices();

    let models = model_factory(&config.stages);
    let engine = Arc::new(DuplexEngine::new(config.clone(), models)?);

    let mut capture = AudioCapture::start(
        config.audio.input_device.as_deref(),
        config.audio.hardware_rate,
        config.audio.channels,
        engine.capture_queue(),
    )?;
    let mut playback = AudioPlayback::start(
        config.audio.output_device.as_deref(),
        config.audio.hardware_rate,
        config.audio.channels,
        engine.playback_buffer(),
    )?;

    engine.start()?;
    info!(
        "Running with stage {}. Enter toggles {:?}, q quits",
        engine.active_stage_name(),
        config.stages.cycle.iter().map(|k| k.name()).collect::<Vec<_>>()
    );

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut console = tokio::spawn(control::listen(stdin, engine.stage_selector()));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let report_every = Duration::from_secs(config.stats.interval_secs.max(1));
    let mut report = tokio::time::interval_at(tokio::time::Instant::now() + report_every, report_every);
    let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);

    let started = Instant::now();
    let mut last_stats = engine.stats();
    let mut last_report = Instant::now();

    loop {
        tokio::select! {
            exit = &mut console => {
                match exit {
                    Ok(Ok(ListenerExit::Quit)) => info!("Quit requested"),
                    Ok(Ok(ListenerExit::Eof)) => info!("Console closed"),
                    Ok(Err(e)) => warn!("Console read failed: {}", e),
                    Err(e) => warn!("Console task failed: {}", e),
                }
                break;
            }
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            _ = report.tick() => {
                let stats = engine.stats();
                let (tx_fps, rx_fps) = stats.rates_since(&last_stats, last_report.elapsed());
                info!("[{:.0}s] tx {:.1} f/s, rx {:.1} f/s, {}", started.elapsed().as_secs_f64(), tx_fps, rx_fps, stats);
                last_stats = stats;
                last_report = Instant::now();
            }
            _ = watchdog.tick() => {
                if let Some(e) = capture.check_errors() {
                    error!("Input device failed: {}", e);
                    break;
                }
                if let Some(e) = playback.check_errors() {
                    error!("Output device failed: {}", e);
                    break;
                }
                if !engine.is_running() {
                    error!("A pipeline stopped unexpectedly");
                    break;
                }
            }
        }
    }

    capture.stop();
    let outcome = engine.stop();
    playback.stop();

    let stats = engine.stats();
    info!(
        "Session summary after {:.0}s: {}",
        started.elapsed().as_secs_f64(),
        stats
    );

    outcome?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use voice_duplex::stage::StageKind;

    fn parse(args: &[&str]) -> std::result::Result<CliArgs, clap::Error> {
        CliArgs::try_parse_from(std::iter::once("duplex").chain(args.iter().copied()))
    }

    #[test]
    fn test_parse_overrides() {
        let cli = parse(&["--role", "B", "--peer-ip", "10.0.0.3", "--mic-device", "USB Mic"]).unwrap();
        let mut config = AppConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.link.role, Role::B);
        assert_eq!(config.link.peer_address.to_string(), "10.0.0.3");
        assert_eq!(config.audio.input_device.as_deref(), Some("USB Mic"));
        assert_eq!(config.audio.output_device, None);
    }

    #[test]
    fn test_model_adds_neural_stage() {
        let mut config = AppConfig::default();
        parse(&[]).unwrap().apply(&mut config);
        assert!(!config.stages.cycle.contains(&StageKind::NeuralDenoise));

        parse(&["--model", "dn.onnx"]).unwrap().apply(&mut config);
        assert!(config.stages.cycle.contains(&StageKind::NeuralDenoise));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(&["--role", "C"]).is_err());
        assert!(parse(&["--peer-ip"]).is_err());
        assert!(parse(&["--peer-ip", "not-an-ip"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
        assert!(parse(&["--list-devices"]).unwrap().list_devices);
    }
}
