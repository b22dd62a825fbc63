use std::f32::consts::PI;

use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use istftnet_rs::audio::{MelExtractor, Stft, Synthesizer};
use istftnet_rs::Hyperparameters;

// iSTFTNet V1 synthesis: n_fft 16, hop 4, one second of 22.05 kHz audio.
const FRAMES: usize = 5513;

fn spectral_frame(bins: usize, frames: usize) -> (Tensor, Tensor) {
    let device = Device::Cpu;
    let magnitude = Tensor::rand(0.0f32, 1.0, (1, bins, frames), &device).unwrap();
    let phase = Tensor::rand(-PI, PI, (1, bins, frames), &device).unwrap();
    (magnitude, phase)
}

fn bench_inverse_reference(c: &mut Criterion) {
    let synthesizer = Synthesizer::new(16, 4, 16, &Device::Cpu).unwrap();
    let (magnitude, phase) = spectral_frame(synthesizer.bins(), FRAMES);

    c.bench_function("istft_v1_one_second", |b| {
        b.iter(|| {
            let waveform = synthesizer
                .inverse(black_box(&magnitude), black_box(&phase))
                .unwrap();
            black_box(waveform);
        });
    });
}

fn bench_inverse_filter_lengths(c: &mut Criterion) {
    let mut group = c.benchmark_group("istft_filter_length");
    for n_fft in [16usize, 64, 256, 800] {
        let hop = n_fft / 4;
        let synthesizer = Synthesizer::new(n_fft, hop, n_fft, &Device::Cpu).unwrap();
        let frames = 22050 / hop + 1;
        let (magnitude, phase) = spectral_frame(synthesizer.bins(), frames);
        group.bench_with_input(BenchmarkId::from_parameter(n_fft), &n_fft, |b, _| {
            b.iter(|| black_box(synthesizer.inverse(&magnitude, &phase).unwrap()));
        });
    }
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let stft = Stft::new(16, 4, 16, &Device::Cpu).unwrap();
    let synthesizer = Synthesizer::new(16, 4, 16, &Device::Cpu).unwrap();
    let waveform = Tensor::rand(-1.0f32, 1.0, (1, 22050), &Device::Cpu).unwrap();

    c.bench_function("stft_istft_round_trip", |b| {
        b.iter(|| {
            let frame = stft.analyze(black_box(&waveform)).unwrap();
            black_box(synthesizer.synthesize(&frame).unwrap());
        });
    });
}

fn bench_loss_mel(c: &mut Criterion) {
    let hparams = Hyperparameters::reference_v1();
    let mel = MelExtractor::loss(&hparams, &Device::Cpu).unwrap();
    let waveform = Tensor::zeros((16, 1, hparams.segment_size), DType::F32, &Device::Cpu).unwrap();

    c.bench_function("loss_mel_batch_16", |b| {
        b.iter(|| black_box(mel.forward(black_box(&waveform)).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_inverse_reference,
    bench_inverse_filter_lengths,
    bench_round_trip,
    bench_loss_mel,
);
criterion_main!(benches);
