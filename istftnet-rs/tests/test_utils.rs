//! Shared fixtures for the istftnet-rs integration tests.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod test_utils;
//! use test_utils::*;
//!
//! let dir = tempfile::TempDir::new().unwrap();
//! let options = write_corpus(dir.path(), 6, 1);
//! ```

#![allow(dead_code)]

use std::path::Path;

use istftnet_rs::audio::wav::write_wav;
use istftnet_rs::{Hyperparameters, RunOptions};

/// Sampling rate of the synthetic corpus.
pub const SAMPLING_RATE: u32 = 1600;

/// A configuration small enough to train on the CPU in a test.
pub fn tiny_hparams() -> Hyperparameters {
    Hyperparameters {
        batch_size: 2,
        upsample_rates: vec![2, 2],
        upsample_kernel_sizes: vec![4, 4],
        upsample_initial_channel: 8,
        resblock_kernel_sizes: vec![3, 5],
        resblock_dilation_sizes: vec![vec![1, 3], vec![1, 3]],
        segment_size: 256,
        num_mels: 8,
        n_fft: 64,
        hop_size: 16,
        win_size: 64,
        sampling_rate: SAMPLING_RATE,
        fmax: 800.0,
        num_workers: 0,
        qualitative_batches: 2,
        mpd_periods: vec![2, 3],
        mpd_channels: vec![4, 8, 8],
        msd_channels: vec![4, 4, 8, 8, 8, 8, 8],
        msd_groups: vec![1, 2, 2, 2, 2, 2, 1],
        ..Hyperparameters::reference_v1()
    }
}

/// Write `train + validation` chirps under `dir/wavs` with LJSpeech-style
/// file lists, and return run options pointing at them.
pub fn write_corpus(dir: &Path, train: usize, validation: usize) -> RunOptions {
    let wavs = dir.join("wavs");
    std::fs::create_dir_all(&wavs).unwrap();
    let mut lines = Vec::new();
    for i in 0..train + validation {
        let audio: Vec<f32> = (0..400 + 24 * i)
            .map(|n| ((n as f32) * (0.05 + 0.01 * i as f32)).sin() * 0.5)
            .collect();
        write_wav(&wavs.join(format!("utt{i}.wav")), &audio, SAMPLING_RATE).unwrap();
        lines.push(format!("utt{i}|synthetic utterance {i}"));
    }
    std::fs::write(dir.join("training.txt"), lines[..train].join("\n")).unwrap();
    std::fs::write(dir.join("validation.txt"), lines[train..].join("\n")).unwrap();

    RunOptions {
        input_wavs_dir: wavs,
        input_mels_dir: dir.join("mels"),
        input_training_file: dir.join("training.txt"),
        input_validation_file: dir.join("validation.txt"),
        checkpoint_path: dir.join("cp"),
        training_epochs: 1,
        stdout_interval: 1,
        checkpoint_interval: 1000,
        summary_interval: 1,
        validation_interval: 1000,
        progress: false,
        ..RunOptions::default()
    }
}
