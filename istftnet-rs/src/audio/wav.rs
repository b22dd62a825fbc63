//! WAV file IO.

use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::error::{Result, VocoderError};

/// Full scale of 16-bit PCM.
pub const MAX_WAV_VALUE: f32 = 32768.0;

/// Read a mono WAV file as samples in `[-1, 1]` plus its sampling rate.
///
/// Integer PCM is divided by `2^(bits - 1)`; float WAVs are returned as stored.
///
/// # Errors
///
/// Returns an error if the file cannot be decoded or has more than one channel.
pub fn load_wav<P: AsRef<Path>>(path: P) -> Result<(Vec<f32>, u32)> {
    let path = path.as_ref();
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    if spec.channels != 1 {
        return Err(VocoderError::Dataset(format!(
            "{} has {} channels, expected mono",
            path.display(),
            spec.channels
        )));
    }
    let samples = match spec.sample_format {
        SampleFormat::Float => reader.into_samples::<f32>().collect::<std::result::Result<Vec<_>, _>>()?,
        SampleFormat::Int => {
            #[allow(clippy::cast_precision_loss)]
            let scale = if spec.bits_per_sample == 16 {
                MAX_WAV_VALUE
            } else {
                (1u64 << (spec.bits_per_sample - 1)) as f32
            };
            reader
                .into_samples::<i32>()
                .map(|s| {
                    #[allow(clippy::cast_precision_loss)]
                    let v = s? as f32 / scale;
                    Ok(v)
                })
                .collect::<Result<Vec<_>>>()?
        }
    };
    Ok((samples, spec.sample_rate))
}

/// Write mono samples in `[-1, 1]` as 16-bit PCM, clipping out-of-range values.
///
/// # Errors
///
/// Returns an error if the file cannot be created or written.
pub fn write_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for &s in samples {
        #[allow(clippy::cast_possible_truncation)]
        let v = (s.clamp(-1.0, 1.0) * (MAX_WAV_VALUE - 1.0)).round() as i16;
        writer.write_sample(v)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Scale `samples` so that the peak magnitude equals `peak`. Silence is left untouched.
pub fn normalize_peak(samples: &mut [f32], peak: f32) {
    let max = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    if max > 0.0 {
        let gain = peak / max;
        for s in samples.iter_mut() {
            *s *= gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<f32> = (0..100).map(|i| (i as f32 * 0.1).sin() * 0.5).collect();
        write_wav(&path, &samples, 16000).unwrap();

        let (loaded, sr) = load_wav(&path).unwrap();
        assert_eq!(sr, 16000);
        assert_eq!(loaded.len(), 100);
        for (a, b) in loaded.iter().zip(&samples) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_load_rejects_stereo() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..8 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let err = load_wav(&path).unwrap_err();
        assert!(err.to_string().contains("mono"));
    }

    #[test]
    fn test_normalize_peak() {
        let mut samples = vec![0.1, -0.5, 0.25];
        normalize_peak(&mut samples, 0.95);
        assert!((samples[1] + 0.95).abs() < 1e-6);
        assert!((samples[0] - 0.19).abs() < 1e-6);

        let mut silence = vec![0.0; 4];
        normalize_peak(&mut silence, 0.95);
        assert!(silence.iter().all(|&s| s == 0.0));
    }
}
