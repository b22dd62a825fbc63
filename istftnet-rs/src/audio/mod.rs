//! Signal processing: windows, STFT analysis/synthesis, mel features and WAV IO.

pub mod mel;
pub mod stft;
pub mod wav;

pub use mel::{mel_filterbank, MelExtractor};
pub use stft::{Stft, Synthesizer};

use candle_core::{Device, Tensor};

use crate::error::{Result, VocoderError};

/// Periodic Hann window of `win_length` samples, zero-padded (centered) to `n_fft`.
///
/// Matches `scipy.signal.get_window("hann", win_length, fftbins=True)` and
/// `torch.hann_window(win_length)`, including the centered padding that
/// `torch.stft`/`torch.istft` apply when `win_length < n_fft`.
///
/// # Errors
///
/// Returns an error if `win_length` is zero or exceeds `n_fft`.
pub fn hann_window(win_length: usize, n_fft: usize) -> Result<Vec<f64>> {
    if win_length == 0 || win_length > n_fft {
        return Err(VocoderError::Audio(format!(
            "window length {win_length} must be in (0, {n_fft}]"
        )));
    }
    let mut window = vec![0.0; n_fft];
    let offset = (n_fft - win_length) / 2;
    #[allow(clippy::cast_precision_loss)]
    let len = win_length as f64;
    for (i, w) in window[offset..offset + win_length].iter_mut().enumerate() {
        #[allow(clippy::cast_precision_loss)]
        let phase = 2.0 * std::f64::consts::PI * i as f64 / len;
        *w = 0.5 - 0.5 * phase.cos();
    }
    Ok(window)
}

/// Source index of every sample of a signal of `len` samples reflect-padded by
/// `left` and `right` (edge sample not repeated, as `torch.nn.functional.pad`
/// with `mode="reflect"`).
pub(crate) fn reflect_indices(len: usize, left: usize, right: usize) -> Result<Vec<u32>> {
    if len == 0 || left >= len || right >= len {
        return Err(VocoderError::Audio(format!(
            "reflect padding ({left}, {right}) needs a signal longer than both, got {len}"
        )));
    }
    let last = len - 1;
    let indices = (0..left + len + right)
        .map(|p| {
            let src = if p < left {
                left - p
            } else if p - left > last {
                2 * last - (p - left)
            } else {
                p - left
            };
            u32::try_from(src).map_err(|_| VocoderError::Audio("signal too long".into()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(indices)
}

/// Reflect-pad the last dimension of a `[B, L]` or `[B, C, L]` tensor.
///
/// Built on `index_select`, so gradients flow back to the unpadded samples.
///
/// # Errors
///
/// Returns an error if a pad amount is not smaller than the signal length.
pub fn reflect_pad_last(x: &Tensor, left: usize, right: usize) -> Result<Tensor> {
    if left == 0 && right == 0 {
        return Ok(x.clone());
    }
    let dim = x.rank() - 1;
    let len = x.dim(dim)?;
    let indices = reflect_indices(len, left, right)?;
    let n = indices.len();
    let indices = Tensor::from_vec(indices, n, x.device())?;
    Ok(x.contiguous()?.index_select(&indices, dim)?)
}

/// Build an `f32` tensor of shape `(rows, cols)` from row-major `f64` values.
pub(crate) fn matrix_tensor(values: &[f64], rows: usize, cols: usize, device: &Device) -> Result<Tensor> {
    #[allow(clippy::cast_possible_truncation)]
    let data: Vec<f32> = values.iter().map(|&v| v as f32).collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}
