//! Short-time Fourier analysis and inverse-STFT synthesis on candle tensors.
//!
//! Both directions are expressed as dense matrix products against
//! precomputed real DFT bases so that they run on any candle device and stay
//! differentiable. The window is folded into the bases once at construction.

use candle_core::{Device, Tensor};

use super::{hann_window, matrix_tensor, reflect_pad_last};
use crate::error::{Result, VocoderError};

/// Smallest admissible overlap-added squared window value (NOLA check).
const NOLA_EPS: f64 = 1e-11;

/// A magnitude/phase pair over `[batch, n_fft / 2 + 1, frames]`.
///
/// Magnitude is non-negative; phase is in radians and unconstrained.
#[derive(Debug, Clone)]
pub struct SpectralFrame {
    /// Spectral magnitude.
    pub magnitude: Tensor,
    /// Spectral phase in radians.
    pub phase: Tensor,
}

impl SpectralFrame {
    /// Pair a magnitude and a phase grid.
    #[must_use]
    pub fn new(magnitude: Tensor, phase: Tensor) -> Self {
        Self { magnitude, phase }
    }
}

#[allow(clippy::cast_precision_loss)]
fn twiddle(k: usize, n: usize, n_fft: usize) -> f64 {
    2.0 * std::f64::consts::PI * ((k * n) % n_fft) as f64 / n_fft as f64
}

/// Deterministic inverse STFT turning a [`SpectralFrame`] into a waveform.
///
/// Follows `torch.istft(..., center=True, normalized=False, onesided=True)`:
/// the one-sided spectrum `magnitude * exp(i * phase)` is inverted per frame,
/// multiplied by the synthesis window, overlap-added, divided by the
/// overlap-added squared window and trimmed by `n_fft / 2` at both ends. A
/// `T`-frame input yields `hop_length * (T - 1)` samples.
#[derive(Debug, Clone)]
pub struct Synthesizer {
    n_fft: usize,
    hop_length: usize,
    window: Vec<f64>,
    /// `[n_fft, 2 * bins]`; columns are the windowed cosine then sine bases.
    basis: Tensor,
}

impl Synthesizer {
    /// Create a synthesizer with a periodic Hann window.
    ///
    /// # Errors
    ///
    /// Returns an error if the window does not fit the filter length or the
    /// hop is zero.
    pub fn new(
        filter_length: usize,
        hop_length: usize,
        win_length: usize,
        device: &Device,
    ) -> Result<Self> {
        if hop_length == 0 {
            return Err(VocoderError::Audio("hop length must be > 0".into()));
        }
        let window = hann_window(win_length, filter_length)?;
        let n_fft = filter_length;
        let bins = n_fft / 2 + 1;
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / n_fft as f64;

        let mut basis = vec![0.0; n_fft * 2 * bins];
        for n in 0..n_fft {
            for k in 0..bins {
                let weight = if k == 0 || (n_fft % 2 == 0 && k == n_fft / 2) {
                    1.0
                } else {
                    2.0
                };
                let angle = twiddle(k, n, n_fft);
                let row = n * 2 * bins;
                basis[row + k] = window[n] * weight * angle.cos() * scale;
                basis[row + bins + k] = -window[n] * weight * angle.sin() * scale;
            }
        }

        Ok(Self {
            n_fft,
            hop_length,
            basis: matrix_tensor(&basis, n_fft, 2 * bins, device)?,
            window,
        })
    }

    /// FFT size.
    #[must_use]
    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    /// Hop size.
    #[must_use]
    pub fn hop_length(&self) -> usize {
        self.hop_length
    }

    /// Number of one-sided frequency bins expected on input.
    #[must_use]
    pub fn bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Waveform length produced for `frames` input frames:
    /// `n_fft + hop_length * (frames - 1) - 2 * (n_fft / 2)`.
    ///
    /// Centre trimming removes `n_fft / 2` samples from each end, so a single
    /// frame (and zero frames) yields an empty waveform. [`Synthesizer::inverse`]
    /// returns a `[batch, 1, 0]` tensor in the single-frame case.
    #[must_use]
    pub fn output_len(&self, frames: usize) -> usize {
        if frames == 0 {
            return 0;
        }
        self.n_fft + self.hop_length * (frames - 1) - 2 * (self.n_fft / 2)
    }

    /// Resynthesize a waveform `[batch, 1, samples]` from magnitude and phase
    /// grids of shape `[batch, n_fft / 2 + 1, frames]`.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch, on an empty frame axis, or when the
    /// squared-window envelope vanishes inside the output (NOLA violation).
    pub fn inverse(&self, magnitude: &Tensor, phase: &Tensor) -> Result<Tensor> {
        let (batch, bins, frames) = magnitude.dims3()?;
        if phase.dims() != magnitude.dims() {
            return Err(VocoderError::Audio(format!(
                "magnitude {:?} and phase {:?} shapes differ",
                magnitude.dims(),
                phase.dims()
            )));
        }
        if bins != self.bins() {
            return Err(VocoderError::Audio(format!(
                "expected {} frequency bins for n_fft {}, got {bins}",
                self.bins(),
                self.n_fft
            )));
        }
        if frames == 0 {
            return Err(VocoderError::Audio("cannot synthesize zero frames".into()));
        }

        let out_len = self.output_len(frames);
        let start = self.n_fft / 2;
        let envelope = self.envelope(frames);
        let kept = &envelope[start..start + out_len];
        if let Some(pos) = kept.iter().position(|&e| e.abs() < NOLA_EPS) {
            return Err(VocoderError::Audio(format!(
                "window overlap-add vanishes at sample {pos} (NOLA condition violated)"
            )));
        }
        if out_len == 0 {
            return Ok(Tensor::zeros(
                (batch, 1, 0),
                magnitude.dtype(),
                magnitude.device(),
            )?);
        }

        let real = (magnitude * phase.cos()?)?;
        let imag = (magnitude * phase.sin()?)?;
        let spectrum = Tensor::cat(&[&real, &imag], 1)?;

        // [B, n_fft, T] -> [B, T, n_fft]
        let segments = self
            .basis
            .broadcast_matmul(&spectrum)?
            .transpose(1, 2)?
            .contiguous()?;
        let signal = self.overlap_add(&segments, batch, frames)?;
        let signal = signal.narrow(1, start, out_len)?;

        #[allow(clippy::cast_possible_truncation)]
        let norm: Vec<f32> = kept.iter().map(|&e| e as f32).collect();
        let norm = Tensor::from_vec(norm, (1, out_len), magnitude.device())?;
        Ok(signal.broadcast_div(&norm)?.unsqueeze(1)?)
    }

    /// [`Synthesizer::inverse`] on a [`SpectralFrame`].
    ///
    /// # Errors
    ///
    /// See [`Synthesizer::inverse`].
    pub fn synthesize(&self, frame: &SpectralFrame) -> Result<Tensor> {
        self.inverse(&frame.magnitude, &frame.phase)
    }

    /// Sum `[B, T, n_fft]` frames placed every `hop_length` samples into a
    /// `[B, n_fft + hop * (T - 1)]` signal.
    fn overlap_add(&self, segments: &Tensor, batch: usize, frames: usize) -> Result<Tensor> {
        let hop = self.hop_length;
        let chunks = self.n_fft.div_ceil(hop);
        let segments = segments
            .pad_with_zeros(2, 0, chunks * hop - self.n_fft)?
            .reshape((batch, frames, chunks, hop))?;

        let mut acc: Option<Tensor> = None;
        for k in 0..chunks {
            let chunk = segments
                .narrow(2, k, 1)?
                .squeeze(2)?
                .pad_with_zeros(1, k, chunks - 1 - k)?;
            acc = Some(match acc {
                Some(sum) => (sum + chunk)?,
                None => chunk,
            });
        }
        let acc = acc.ok_or_else(|| VocoderError::Audio("empty overlap-add".into()))?;
        let total = self.n_fft + hop * (frames - 1);
        Ok(acc
            .reshape((batch, (frames + chunks - 1) * hop))?
            .narrow(1, 0, total)?)
    }

    fn envelope(&self, frames: usize) -> Vec<f64> {
        let total = self.n_fft + self.hop_length * (frames - 1);
        let mut envelope = vec![0.0; total];
        for t in 0..frames {
            let offset = t * self.hop_length;
            for (n, w) in self.window.iter().enumerate() {
                envelope[offset + n] += w * w;
            }
        }
        envelope
    }
}

/// Windowed forward STFT producing the one-sided complex spectrum.
#[derive(Debug, Clone)]
pub struct Stft {
    n_fft: usize,
    hop_length: usize,
    /// `[n_fft, 2 * bins]`; columns are the windowed cosine then negated sine bases.
    basis: Tensor,
}

impl Stft {
    /// Create an analysis transform with a periodic Hann window.
    ///
    /// # Errors
    ///
    /// Returns an error if the window does not fit the FFT size or the hop is zero.
    pub fn new(n_fft: usize, hop_length: usize, win_length: usize, device: &Device) -> Result<Self> {
        if hop_length == 0 {
            return Err(VocoderError::Audio("hop length must be > 0".into()));
        }
        let window = hann_window(win_length, n_fft)?;
        let bins = n_fft / 2 + 1;
        let mut basis = vec![0.0; n_fft * 2 * bins];
        for n in 0..n_fft {
            for k in 0..bins {
                let angle = twiddle(k, n, n_fft);
                let row = n * 2 * bins;
                basis[row + k] = window[n] * angle.cos();
                basis[row + bins + k] = -window[n] * angle.sin();
            }
        }
        Ok(Self {
            n_fft,
            hop_length,
            basis: matrix_tensor(&basis, n_fft, 2 * bins, device)?,
        })
    }

    /// Number of one-sided frequency bins.
    #[must_use]
    pub fn bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Non-centered STFT of a `[batch, samples]` signal.
    ///
    /// Returns `(real, imag)`, each `[batch, bins, frames]` with
    /// `frames = (samples - n_fft) / hop + 1`.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal is shorter than one FFT frame.
    pub fn complex(&self, signal: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, samples) = signal.dims2()?;
        if samples < self.n_fft {
            return Err(VocoderError::Audio(format!(
                "signal of {samples} samples is shorter than n_fft {}",
                self.n_fft
            )));
        }
        let frames = (samples - self.n_fft) / self.hop_length + 1;
        let indices = (0..frames)
            .flat_map(|t| (0..self.n_fft).map(move |n| t * self.hop_length + n))
            .map(|i| u32::try_from(i).map_err(|_| VocoderError::Audio("signal too long".into())))
            .collect::<Result<Vec<_>>>()?;
        let indices = Tensor::from_vec(indices, frames * self.n_fft, signal.device())?;

        let segments = signal
            .contiguous()?
            .index_select(&indices, 1)?
            .reshape((batch, frames, self.n_fft))?;
        // [B, T, 2 * bins] -> [B, 2 * bins, T]
        let spectrum = segments.broadcast_matmul(&self.basis)?.transpose(1, 2)?;
        let bins = self.bins();
        Ok((spectrum.narrow(1, 0, bins)?, spectrum.narrow(1, bins, bins)?))
    }

    /// Centered STFT of a `[batch, samples]` or `[batch, 1, samples]` waveform,
    /// reflect-padded by `n_fft / 2` on both sides, as magnitude and phase.
    ///
    /// The phase is computed on the host, so the result carries no gradient.
    /// [`Synthesizer::inverse`] of the result reproduces the input.
    ///
    /// # Errors
    ///
    /// Returns an error if the waveform is too short to reflect-pad.
    pub fn analyze(&self, waveform: &Tensor) -> Result<SpectralFrame> {
        let waveform = match waveform.rank() {
            3 => waveform.squeeze(1)?,
            _ => waveform.clone(),
        };
        let pad = self.n_fft / 2;
        let padded = reflect_pad_last(&waveform, pad, pad)?;
        let (real, imag) = self.complex(&padded)?;

        let magnitude = (real.sqr()? + imag.sqr()?)?.sqrt()?.detach();
        let shape = real.dims().to_vec();
        let re = real.flatten_all()?.to_vec1::<f32>()?;
        let im = imag.flatten_all()?.to_vec1::<f32>()?;
        let phase: Vec<f32> = re.iter().zip(&im).map(|(r, i)| i.atan2(*r)).collect();
        let phase = Tensor::from_vec(phase, shape, waveform.device())?;
        Ok(SpectralFrame::new(magnitude, phase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impulse_phase(bins: usize, frames: usize) -> Tensor {
        // -pi * k, wrapped: 0 for even bins, pi for odd ones.
        let row: Vec<f32> = (0..bins)
            .map(|k| if k % 2 == 0 { 0.0 } else { std::f32::consts::PI })
            .collect();
        let data: Vec<f32> = row
            .iter()
            .flat_map(|&p| std::iter::repeat(p).take(frames))
            .collect();
        Tensor::from_vec(data, (1, bins, frames), &Device::Cpu).unwrap()
    }

    fn test_signal(len: usize) -> Tensor {
        let data: Vec<f32> = (0..len)
            .map(|i| {
                let t = i as f32;
                0.5 * (t * 0.07).sin() + 0.25 * (t * 0.31 + 1.0).cos() - 0.1 * (t * 1.3).sin()
            })
            .collect();
        Tensor::from_vec(data, (1, len), &Device::Cpu).unwrap()
    }

    // ========================================================================
    // Tests for Synthesizer
    // ========================================================================

    #[test]
    fn test_output_length_rule() {
        let synth = Synthesizer::new(16, 4, 16, &Device::Cpu).unwrap();
        assert_eq!(synth.output_len(1), 0);
        assert_eq!(synth.output_len(65), 256);
        let out = synth
            .inverse(
                &Tensor::ones((2, 9, 65), candle_core::DType::F32, &Device::Cpu).unwrap(),
                &Tensor::zeros((2, 9, 65), candle_core::DType::F32, &Device::Cpu).unwrap(),
            )
            .unwrap();
        assert_eq!(out.dims(), &[2, 1, 256]);
    }

    #[test]
    fn test_single_frame_is_empty() {
        let synth = Synthesizer::new(800, 200, 800, &Device::Cpu).unwrap();
        assert_eq!(synth.output_len(1), 0);
        assert_eq!(synth.output_len(2), 200);
        let mag = Tensor::ones((1, 401, 1), candle_core::DType::F32, &Device::Cpu).unwrap();
        let phase = mag.zeros_like().unwrap();
        let out = synth.inverse(&mag, &phase).unwrap();
        assert_eq!(out.dims(), &[1, 1, 0]);
    }

    #[test]
    fn test_flat_zero_phase_spectrum_is_silent() {
        // A flat zero-phase spectrum is an impulse at the frame start, where
        // the periodic Hann window is zero.
        let synth = Synthesizer::new(800, 200, 800, &Device::Cpu).unwrap();
        let mag = Tensor::ones((1, 401, 5), candle_core::DType::F32, &Device::Cpu).unwrap();
        let phase = mag.zeros_like().unwrap();
        let out = synth.inverse(&mag, &phase).unwrap();
        assert_eq!(out.dims(), &[1, 1, 800]);
        let samples = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(samples.iter().all(|s| s.abs() < 1e-4));
    }

    #[test]
    fn test_golden_centered_impulses() {
        let synth = Synthesizer::new(800, 200, 800, &Device::Cpu).unwrap();
        let mag = Tensor::ones((1, 401, 5), candle_core::DType::F32, &Device::Cpu).unwrap();
        let out = synth.inverse(&mag, &impulse_phase(401, 5)).unwrap();
        let samples = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(samples.len(), 800);

        // Edge pulse: w(400)^2 + w(200)^2 = 1.25 in the envelope.
        assert!((samples[0] - 0.8).abs() < 1e-4, "got {}", samples[0]);
        // Interior pulses see the full 4x overlap envelope of 1.5.
        for i in [200, 400, 600] {
            assert!((samples[i] - 2.0 / 3.0).abs() < 1e-4, "y[{i}] = {}", samples[i]);
        }
        for (i, s) in samples.iter().enumerate() {
            if i % 200 != 0 {
                assert!(s.abs() < 1e-4, "y[{i}] = {s}");
            }
        }
    }

    #[test]
    fn test_deterministic() {
        let synth = Synthesizer::new(16, 4, 16, &Device::Cpu).unwrap();
        let stft = Stft::new(16, 4, 16, &Device::Cpu).unwrap();
        let frame = stft.analyze(&test_signal(128)).unwrap();
        let a = synth.synthesize(&frame).unwrap().flatten_all().unwrap();
        let b = synth.synthesize(&frame).unwrap().flatten_all().unwrap();
        assert_eq!(a.to_vec1::<f32>().unwrap(), b.to_vec1::<f32>().unwrap());
    }

    #[test]
    fn test_roundtrip_reconstructs_waveform() {
        let synth = Synthesizer::new(16, 4, 16, &Device::Cpu).unwrap();
        let stft = Stft::new(16, 4, 16, &Device::Cpu).unwrap();
        let signal = test_signal(256);

        let frame = stft.analyze(&signal).unwrap();
        assert_eq!(frame.magnitude.dims(), &[1, 9, 65]);
        let rebuilt = synth.synthesize(&frame).unwrap();
        assert_eq!(rebuilt.dims(), &[1, 1, 256]);

        let diff = (rebuilt.squeeze(1).unwrap() - &signal)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4, "max reconstruction error {diff}");
    }

    #[test]
    fn test_roundtrip_with_short_window() {
        let synth = Synthesizer::new(32, 8, 24, &Device::Cpu).unwrap();
        let stft = Stft::new(32, 8, 24, &Device::Cpu).unwrap();
        let signal = test_signal(160);
        let rebuilt = synth.synthesize(&stft.analyze(&signal).unwrap()).unwrap();
        let diff = (rebuilt.squeeze(1).unwrap() - &signal)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4, "max reconstruction error {diff}");
    }

    #[test]
    fn test_nola_violation_is_rejected() {
        // Hop equal to n_fft leaves the periodic Hann envelope at zero between frames.
        let synth = Synthesizer::new(16, 16, 16, &Device::Cpu).unwrap();
        let mag = Tensor::ones((1, 9, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let err = synth.inverse(&mag, &mag.zeros_like().unwrap()).unwrap_err();
        assert!(err.to_string().contains("NOLA"));
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let synth = Synthesizer::new(16, 4, 16, &Device::Cpu).unwrap();
        let mag = Tensor::ones((1, 9, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let phase = Tensor::ones((1, 9, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(synth.inverse(&mag, &phase).is_err());
        let wrong_bins = Tensor::ones((1, 8, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(synth.inverse(&wrong_bins, &wrong_bins).is_err());
    }

    #[test]
    fn test_gradient_reaches_magnitude_and_phase() {
        let synth = Synthesizer::new(16, 4, 16, &Device::Cpu).unwrap();
        let mag = candle_core::Var::ones((1, 9, 6), candle_core::DType::F32, &Device::Cpu).unwrap();
        let phase = candle_core::Var::zeros((1, 9, 6), candle_core::DType::F32, &Device::Cpu).unwrap();
        let out = synth.inverse(mag.as_tensor(), &(phase.as_tensor() + 0.3).unwrap()).unwrap();
        let loss = out.sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(mag.as_tensor()).is_some());
        assert!(grads.get(phase.as_tensor()).is_some());
    }

    // ========================================================================
    // Tests for Stft
    // ========================================================================

    #[test]
    fn test_complex_frame_count() {
        let stft = Stft::new(64, 16, 64, &Device::Cpu).unwrap();
        let (re, im) = stft.complex(&test_signal(304)).unwrap();
        assert_eq!(re.dims(), &[1, 33, 16]);
        assert_eq!(im.dims(), &[1, 33, 16]);
        assert!(stft.complex(&test_signal(32)).is_err());
    }

    #[test]
    fn test_dc_signal_concentrates_in_bin_zero() {
        let stft = Stft::new(16, 4, 16, &Device::Cpu).unwrap();
        let ones = Tensor::ones((1, 64), candle_core::DType::F32, &Device::Cpu).unwrap();
        let (re, _) = stft.complex(&ones).unwrap();
        let re = re.to_vec3::<f32>().unwrap();
        // Sum of a 16-point periodic Hann window.
        assert!((re[0][0][0] - 8.0).abs() < 1e-4);
        assert!(re[0][3][0].abs() < 1e-4);
    }
}
