//! Per-frame cost of each pipeline step.
//!
//! One 20 ms frame is the real-time budget, so a step's real-time factor is
//! its mean time divided by 20 ms.
//!
//! ```bash
//! cargo bench --bench realtime
//! open target/criterion/report/index.html
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::f32::consts::PI;
use std::time::Duration;

use voice_duplex::audio::{AudioFrame, Resampler};
use voice_duplex::codec::{SpeechDecoder, SpeechEncoder};
use voice_duplex::config::{ClassicalConfig, CodecConfig};
use voice_duplex::stage::classical::ClassicalFilter;
use voice_duplex::stage::ProcessingStage;

const HW_RATE: u32 = 48000;
const PROC_RATE: u32 = 16000;

/// Speech-like test signal: two tones plus a little noise
fn voice_frame(rate: u32, len: usize) -> AudioFrame {
    let mut seed = 0x2545_f491u32;
    let samples = (0..len)
        .map(|i| {
            let t = i as f32 / rate as f32;
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let noise = (seed as f32 / u32::MAX as f32 - 0.5) * 0.02;
            0.3 * (2.0 * PI * 220.0 * t).sin() + 0.15 * (2.0 * PI * 1100.0 * t).sin() + noise
        })
        .collect();
    AudioFrame::new(samples, rate)
}

fn bench_resample(c: &mut Criterion) {
    let mut group = c.benchmark_group("resample");
    group.measurement_time(Duration::from_secs(5));

    for (from, to) in [(HW_RATE, PROC_RATE), (PROC_RATE, HW_RATE)] {
        let resampler = Resampler::new(from, to).unwrap();
        let frame = voice_frame(from, from as usize / 50);
        group.throughput(Throughput::Elements(frame.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("stream", format!("{}->{}", from, to)),
            &frame,
            |b, frame| {
                let mut state = resampler.new_state();
                b.iter(|| {
                    let out = resampler.process_frame_stream(&mut state, black_box(frame));
                    black_box(out)
                });
            },
        );
    }

    group.finish();
}

fn bench_classical(c: &mut Criterion) {
    let mut group = c.benchmark_group("stage");
    let frame = voice_frame(PROC_RATE, 320);
    let mut filter = ClassicalFilter::new(&ClassicalConfig::default(), PROC_RATE);

    group.bench_function("classical_filter", |b| {
        b.iter(|| black_box(filter.transform(black_box(frame.clone()))));
    });

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let frame = voice_frame(PROC_RATE, 320);
    let config = CodecConfig::default();

    let mut encoder = SpeechEncoder::new(PROC_RATE, 320, &config).unwrap();
    group.bench_function("encode", |b| {
        b.iter(|| black_box(encoder.encode(black_box(&frame))));
    });

    let mut encoder = SpeechEncoder::new(PROC_RATE, 320, &config).unwrap();
    let packet = encoder.encode(&frame).unwrap();
    let mut decoder = SpeechDecoder::new(PROC_RATE, 320).unwrap();
    group.bench_function("decode", |b| {
        b.iter(|| black_box(decoder.decode(black_box(&packet))));
    });

    group.finish();
}

criterion_group!(benches, bench_resample, bench_classical, bench_codec);
criterion_main!(benches);
