//! Two engines talking over localhost UDP, with audio injected into the
//! capture queue and read back from the playback buffer.

use bytes::Bytes;
use std::f32::consts::PI;
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use voice_duplex::audio::AudioFrame;
use voice_duplex::codec::SpeechEncoder;
use voice_duplex::config::{AppConfig, CodecConfig};
use voice_duplex::error::StageError;
use voice_duplex::protocol::{EncodedPacket, Role};
use voice_duplex::stage::{DenoiseModel, ModelFactory, StageKind};
use voice_duplex::DuplexEngine;

const HW_RATE: u32 = 48000;
const HW_FRAME: usize = 960;

fn free_port() -> u16 {
    UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn node_config(role: Role, a_to_b: u16, b_to_a: u16) -> AppConfig {
    let mut config = AppConfig::default();
    config.link.role = role;
    config.link.peer_address = Ipv4Addr::LOCALHOST.into();
    config.link.bind_address = Ipv4Addr::LOCALHOST.into();
    config.link.a_to_b_port = a_to_b;
    config.link.b_to_a_port = b_to_a;
    config.audio.capture_queue_depth = 128;
    config.jitter.target_depth = 1;
    config.jitter.max_depth = 128;
    config.stages.cycle = vec![StageKind::Bypass, StageKind::ClassicalFilter];
    config.stages.initial = StageKind::Bypass;
    config
}

fn pair() -> (DuplexEngine, DuplexEngine) {
    let (a_to_b, b_to_a) = (free_port(), free_port());
    let a = DuplexEngine::new(node_config(Role::A, a_to_b, b_to_a), None).unwrap();
    let b = DuplexEngine::new(node_config(Role::B, a_to_b, b_to_a), None).unwrap();
    (a, b)
}

fn sine_block(index: usize, freq: f32, amplitude: f32) -> Vec<f32> {
    (0..HW_FRAME)
        .map(|i| {
            let t = (index * HW_FRAME + i) as f32 / HW_RATE as f32;
            amplitude * (2.0 * PI * freq * t).sin()
        })
        .collect()
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn zero_crossings(samples: &[f32]) -> usize {
    samples
        .windows(2)
        .filter(|w| (w[0] < 0.0) != (w[1] < 0.0))
        .count()
}

#[test]
fn sine_crosses_link_through_bypass() {
    let (a, b) = pair();
    a.start().unwrap();
    b.start().unwrap();

    let queue = a.capture_queue();
    for n in 0..60 {
        queue.push(sine_block(n, 1000.0, 0.5));
        thread::sleep(Duration::from_millis(2));
    }

    let playback = b.playback_buffer();
    assert!(wait_until(Duration::from_secs(3), || playback.depth() >= 55));

    let mut received = Vec::new();
    while let Some(frame) = playback.pop_frame() {
        assert_eq!(frame.len(), HW_FRAME);
        assert_eq!(frame.sample_rate(), HW_RATE);
        received.extend_from_slice(frame.samples());
    }

    // Skip codec and filter warm-up
    let tail = &received[HW_FRAME * 10..];
    let level = voice_duplex::audio::frame::rms(tail) / (0.5 / 2f32.sqrt());
    assert!(level > 0.5 && level < 1.5, "level ratio {level}");

    let expected = 2.0 * 1000.0 * tail.len() as f32 / HW_RATE as f32;
    let crossings = zero_crossings(tail) as f32;
    assert!((crossings - expected).abs() / expected < 0.05, "{crossings} vs {expected}");

    let stats = b.stats();
    assert_eq!(stats.rx.lost, 0);
    assert_eq!(stats.rx.decode_errors, 0);
    assert!(a.stats().tx.frames >= 55);

    a.stop().unwrap();
    b.stop().unwrap();
}

#[test]
fn toggle_cycles_while_audio_flows() {
    let (a, b) = pair();
    a.start().unwrap();
    b.start().unwrap();

    let queue = a.capture_queue();
    let playback = b.playback_buffer();

    assert_eq!(a.active_stage_name(), "Bypass");
    for n in 0..10 {
        queue.push(sine_block(n, 440.0, 0.3));
    }
    assert!(wait_until(Duration::from_secs(3), || playback.depth() >= 10));

    assert_eq!(a.toggle(), StageKind::ClassicalFilter);
    assert_eq!(a.active_stage_name(), "ClassicalFilter");
    for n in 10..20 {
        queue.push(sine_block(n, 440.0, 0.3));
    }
    assert!(wait_until(Duration::from_secs(3), || playback.depth() >= 20));

    assert_eq!(a.toggle(), StageKind::Bypass);
    // The other node's selector is independent
    assert_eq!(b.active_stage(), StageKind::Bypass);

    let stats = a.stats();
    assert_eq!(stats.tx.frames, 20);
    assert_eq!(stats.tx.send_errors, 0);

    a.stop().unwrap();
    b.stop().unwrap();
}

#[test]
fn receiver_fills_gaps_and_drops_stale_packets() {
    let (a_to_b, b_to_a) = (free_port(), free_port());
    let b = DuplexEngine::new(node_config(Role::B, a_to_b, b_to_a), None).unwrap();
    b.start().unwrap();

    let mut encoder = SpeechEncoder::new(16000, 320, &CodecConfig::default()).unwrap();
    let packets: Vec<EncodedPacket> = (0..6)
        .map(|_| encoder.encode(&AudioFrame::silence(320, 16000)).unwrap())
        .collect();

    let raw = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let target = (Ipv4Addr::LOCALHOST, a_to_b);
    let send = |packet: &EncodedPacket| {
        raw.send_to(&packet.to_datagram(), target).unwrap();
        thread::sleep(Duration::from_millis(5));
    };

    // 0, 1, 2, [3, 4 lost], 5, stale 2, garbage 6
    send(&packets[0]);
    send(&packets[1]);
    send(&packets[2]);
    send(&packets[5]);
    send(&packets[2]);
    send(&EncodedPacket::new(6, Bytes::from_static(&[0xFF])));

    assert!(wait_until(Duration::from_secs(3), || {
        let rx = b.stats().rx;
        rx.late == 1 && rx.decode_errors == 1
    }));

    let stats = b.stats();
    assert_eq!(stats.rx.lost, 2);
    assert_eq!(stats.rx.frames, 5);
    // Four real frames, two gap fills and one undecodable frame played as silence
    assert_eq!(b.playback_buffer().depth(), 7);

    b.stop().unwrap();
}

struct SlowModel {
    delay: Duration,
}

impl DenoiseModel for SlowModel {
    fn denoise(&mut self, frame: &[f32]) -> Result<Vec<f32>, StageError> {
        thread::sleep(self.delay);
        Ok(frame.to_vec())
    }

    fn name(&self) -> &str {
        "slow"
    }
}

#[test]
fn slow_stage_counts_overruns_and_stops_cleanly() {
    let (a_to_b, b_to_a) = (free_port(), free_port());
    let mut config = node_config(Role::A, a_to_b, b_to_a);
    config.stages.cycle = vec![StageKind::NeuralDenoise, StageKind::Bypass];
    config.stages.initial = StageKind::NeuralDenoise;

    let factory: ModelFactory = Arc::new(|| {
        Ok(Box::new(SlowModel {
            delay: Duration::from_millis(40),
        }) as Box<dyn DenoiseModel>)
    });
    let a = DuplexEngine::new(config, Some(factory)).unwrap();
    a.start().unwrap();

    let queue = a.capture_queue();
    for n in 0..5 {
        queue.push(sine_block(n, 300.0, 0.3));
    }
    assert!(wait_until(Duration::from_secs(3), || a.stats().tx.overruns >= 2));
    assert!(a.stats().tx.rtf_max > 1.0);

    // Stop lands while frames are still queued behind the slow stage
    let stopping = Instant::now();
    a.stop().unwrap();
    assert!(stopping.elapsed() < Duration::from_secs(1));
    assert!(!a.is_running());
}

#[test]
fn neural_stage_requires_backend() {
    let (a_to_b, b_to_a) = (free_port(), free_port());
    let mut config = node_config(Role::A, a_to_b, b_to_a);
    config.stages.cycle = StageKind::ALL.to_vec();
    assert!(DuplexEngine::new(config, None).is_err());
}
