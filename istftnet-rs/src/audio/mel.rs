//! Log-mel spectrogram extraction.
//!
//! Reproduces the HiFi-GAN/iSTFTNet `mel_spectrogram` feature: reflect padding
//! by `(n_fft - hop) / 2`, non-centered Hann STFT, magnitude with a `1e-9`
//! floor inside the square root, Slaney mel projection and natural-log
//! compression clamped at `1e-5`.

use candle_core::{Device, Tensor};

use super::{matrix_tensor, reflect_pad_last, Stft};
use crate::config::Hyperparameters;
use crate::error::{Result, VocoderError};

const MAGNITUDE_FLOOR: f64 = 1e-9;
const LOG_CLAMP: f64 = 1e-5;

/// Slaney-style Hz to mel conversion (linear below 1 kHz, logarithmic above).
#[must_use]
pub fn hz_to_mel(hz: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;
    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / logstep
    } else {
        hz / F_SP
    }
}

/// Inverse of [`hz_to_mel`].
#[must_use]
pub fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;
    if mel >= min_log_mel {
        MIN_LOG_HZ * (logstep * (mel - min_log_mel)).exp()
    } else {
        F_SP * mel
    }
}

/// Slaney-normalized triangular mel filterbank, row-major `[n_mels, n_fft / 2 + 1]`.
///
/// Same weights as `librosa.filters.mel(sr, n_fft, n_mels, fmin, fmax)`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mel_filterbank(sampling_rate: u32, n_fft: usize, n_mels: usize, fmin: f64, fmax: f64) -> Vec<f64> {
    let bins = n_fft / 2 + 1;
    let sr = f64::from(sampling_rate);
    let fft_freqs: Vec<f64> = (0..bins).map(|i| i as f64 * sr / n_fft as f64).collect();

    let min_mel = hz_to_mel(fmin);
    let max_mel = hz_to_mel(fmax);
    let mel_f: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(min_mel + (max_mel - min_mel) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut weights = vec![0.0; n_mels * bins];
    for m in 0..n_mels {
        let lower_width = mel_f[m + 1] - mel_f[m];
        let upper_width = mel_f[m + 2] - mel_f[m + 1];
        let enorm = 2.0 / (mel_f[m + 2] - mel_f[m]);
        for (k, &f) in fft_freqs.iter().enumerate() {
            let lower = (f - mel_f[m]) / lower_width;
            let upper = (mel_f[m + 2] - f) / upper_width;
            weights[m * bins + k] = lower.min(upper).max(0.0) * enorm;
        }
    }
    weights
}

/// Differentiable waveform to log-mel transform.
#[derive(Debug, Clone)]
pub struct MelExtractor {
    stft: Stft,
    /// `[n_mels, bins]`
    filterbank: Tensor,
    n_fft: usize,
    hop_size: usize,
    num_mels: usize,
}

impl MelExtractor {
    /// Create an extractor.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid window configuration or frequency range.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        n_fft: usize,
        num_mels: usize,
        sampling_rate: u32,
        hop_size: usize,
        win_size: usize,
        fmin: f64,
        fmax: f64,
        device: &Device,
    ) -> Result<Self> {
        if fmin < 0.0 || fmin >= fmax || fmax > f64::from(sampling_rate) / 2.0 {
            return Err(VocoderError::Audio(format!(
                "invalid mel range [{fmin}, {fmax}] at {sampling_rate} Hz"
            )));
        }
        let stft = Stft::new(n_fft, hop_size, win_size, device)?;
        let bins = stft.bins();
        let filterbank = mel_filterbank(sampling_rate, n_fft, num_mels, fmin, fmax);
        Ok(Self {
            stft,
            filterbank: matrix_tensor(&filterbank, num_mels, bins, device)?,
            n_fft,
            hop_size,
            num_mels,
        })
    }

    /// Extractor with the upper edge `fmax`, used for conditioning and display.
    ///
    /// # Errors
    ///
    /// See [`MelExtractor::new`].
    pub fn conditioning(hparams: &Hyperparameters, device: &Device) -> Result<Self> {
        Self::new(
            hparams.n_fft,
            hparams.num_mels,
            hparams.sampling_rate,
            hparams.hop_size,
            hparams.win_size,
            hparams.fmin,
            hparams.fmax,
            device,
        )
    }

    /// Extractor with the upper edge `fmax_for_loss`, used for reconstruction targets.
    ///
    /// # Errors
    ///
    /// See [`MelExtractor::new`].
    pub fn loss(hparams: &Hyperparameters, device: &Device) -> Result<Self> {
        Self::new(
            hparams.n_fft,
            hparams.num_mels,
            hparams.sampling_rate,
            hparams.hop_size,
            hparams.win_size,
            hparams.fmin,
            hparams.loss_fmax(),
            device,
        )
    }

    /// Number of mel filters.
    #[must_use]
    pub fn num_mels(&self) -> usize {
        self.num_mels
    }

    /// Frames produced for a waveform of `samples` samples.
    #[must_use]
    pub fn frames(&self, samples: usize) -> usize {
        let padded = samples + 2 * ((self.n_fft - self.hop_size) / 2);
        if padded < self.n_fft {
            return 0;
        }
        (padded - self.n_fft) / self.hop_size + 1
    }

    /// Log-mel spectrogram `[batch, num_mels, frames]` of a `[batch, samples]` waveform.
    ///
    /// # Errors
    ///
    /// Returns an error if the waveform is too short to pad and frame.
    pub fn forward(&self, waveform: &Tensor) -> Result<Tensor> {
        let waveform = match waveform.rank() {
            1 => waveform.unsqueeze(0)?,
            3 => waveform.squeeze(1)?,
            _ => waveform.clone(),
        };
        let pad = (self.n_fft - self.hop_size) / 2;
        let padded = reflect_pad_last(&waveform, pad, pad)?;
        let (real, imag) = self.stft.complex(&padded)?;
        let magnitude = ((real.sqr()? + imag.sqr()?)? + MAGNITUDE_FLOOR)?.sqrt()?;
        let mel = self.filterbank.broadcast_matmul(&magnitude)?;
        Ok(mel.maximum(LOG_CLAMP)?.log()?)
    }
}
