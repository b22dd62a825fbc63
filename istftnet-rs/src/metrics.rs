//! Scalar, audio and figure emission.
//!
//! Training and validation report through the [`MetricsSink`] trait. The
//! on-disk [`EventFileSink`] appends scalars to `scalars.jsonl` and writes
//! audio as WAV and spectrograms as PNG under the log directory;
//! [`MemorySink`] keeps everything in memory.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use candle_core::{DType, Tensor};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::audio::wav::write_wav;
use crate::error::{Result, VocoderError};

/// A 2-D grid of values, `bins` rows by `frames` columns, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    /// Number of rows (frequency or mel bins).
    pub bins: usize,
    /// Number of columns (frames).
    pub frames: usize,
    /// `bins * frames` values.
    pub values: Vec<f32>,
}

impl Spectrogram {
    /// Copy a `[bins, frames]` tensor (leading unit dimensions are squeezed).
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor is not two-dimensional after squeezing.
    pub fn from_tensor(t: &Tensor) -> Result<Self> {
        let mut t = t.clone();
        while t.rank() > 2 && t.dim(0)? == 1 {
            t = t.squeeze(0)?;
        }
        let (bins, frames) = t.dims2().map_err(|_| {
            VocoderError::Metrics(format!("expected a 2-D spectrogram, got {:?}", t.dims()))
        })?;
        let values = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self {
            bins,
            frames,
            values,
        })
    }

    /// Render with row 0 at the bottom and a viridis-like colormap.
    #[must_use]
    pub fn render(&self) -> RgbImage {
        let (lo, hi) = self
            .values
            .iter()
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = if hi > lo { hi - lo } else { 1.0 };

        #[allow(clippy::cast_possible_truncation)]
        let (width, height) = (self.frames.max(1) as u32, self.bins.max(1) as u32);
        RgbImage::from_fn(width, height, |x, y| {
            let row = self.bins.saturating_sub(1 + y as usize);
            let v = self
                .values
                .get(row * self.frames + x as usize)
                .copied()
                .filter(|v| v.is_finite())
                .map_or(0.0, |v| (v - lo) / range);
            colormap(v)
        })
    }
}

const VIRIDIS: [[f32; 3]; 5] = [
    [68.0, 1.0, 84.0],
    [59.0, 82.0, 139.0],
    [33.0, 145.0, 140.0],
    [94.0, 201.0, 98.0],
    [253.0, 231.0, 37.0],
];

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn colormap(t: f32) -> Rgb<u8> {
    let t = t.clamp(0.0, 1.0) * (VIRIDIS.len() - 1) as f32;
    let i = (t.floor() as usize).min(VIRIDIS.len() - 2);
    let f = t - i as f32;
    let (a, b) = (VIRIDIS[i], VIRIDIS[i + 1]);
    Rgb([0, 1, 2].map(|c| (a[c] + (b[c] - a[c]) * f).round() as u8))
}

/// Destination of training and validation summaries.
pub trait MetricsSink: Send {
    /// Record a scalar of series `tag` at `step`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()>;

    /// Record an audio clip.
    ///
    /// # Errors
    ///
    /// Returns an error if the clip cannot be persisted.
    fn add_audio(&mut self, tag: &str, samples: &[f32], step: u64, sample_rate: u32) -> Result<()>;

    /// Record a spectrogram rendering.
    ///
    /// # Errors
    ///
    /// Returns an error if the figure cannot be persisted.
    fn add_figure(&mut self, tag: &str, spectrogram: &Spectrogram, step: u64) -> Result<()>;

    /// Flush buffered records.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One line of `scalars.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    /// Series name.
    pub tag: String,
    /// Global step.
    pub step: u64,
    /// Value.
    pub value: f64,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub wall_time: f64,
}

/// Writes summaries below a log directory.
pub struct EventFileSink {
    dir: PathBuf,
    scalars: BufWriter<File>,
}

impl EventFileSink {
    /// Sink writing to `dir`, created if needed. Existing scalars are kept.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory or scalar file cannot be opened.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let scalars = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("scalars.jsonl"))?;
        Ok(Self {
            dir,
            scalars: BufWriter::new(scalars),
        })
    }

    /// Log directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the artifact for `tag` at `step` under `kind`.
    fn artifact_path(&self, kind: &str, tag: &str, step: u64, extension: &str) -> Result<PathBuf> {
        let mut dir = self.dir.join(kind);
        for part in tag.split('/').filter(|p| !p.is_empty() && *p != "." && *p != "..") {
            dir.push(part);
        }
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{step:08}.{extension}")))
    }
}

impl MetricsSink for EventFileSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let record = ScalarRecord {
            tag: tag.to_string(),
            step,
            value,
            wall_time,
        };
        serde_json::to_writer(&mut self.scalars, &record)
            .map_err(|e| VocoderError::Metrics(format!("cannot encode scalar {tag}: {e}")))?;
        self.scalars.write_all(b"\n")?;
        self.scalars.flush()?;
        Ok(())
    }

    fn add_audio(&mut self, tag: &str, samples: &[f32], step: u64, sample_rate: u32) -> Result<()> {
        let path = self.artifact_path("audio", tag, step, "wav")?;
        write_wav(path, samples, sample_rate)
    }

    fn add_figure(&mut self, tag: &str, spectrogram: &Spectrogram, step: u64) -> Result<()> {
        let path = self.artifact_path("figures", tag, step, "png")?;
        spectrogram.render().save(path)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.scalars.flush()?;
        Ok(())
    }
}

/// Everything a [`MemorySink`] received.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecords {
    /// Scalars in emission order.
    pub scalars: Vec<ScalarRecord>,
    /// `(tag, step, samples)` of each audio clip.
    pub audio: Vec<(String, u64, Vec<f32>)>,
    /// `(tag, step, spectrogram)` of each figure.
    pub figures: Vec<(String, u64, Spectrogram)>,
}

/// In-memory sink; clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<MemoryRecords>>,
}

impl MemorySink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    #[must_use]
    pub fn records(&self) -> MemoryRecords {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// `(step, value)` pairs of series `tag`.
    #[must_use]
    pub fn series(&self, tag: &str) -> Vec<(u64, f64)> {
        self.records()
            .scalars
            .iter()
            .filter(|r| r.tag == tag)
            .map(|r| (r.step, r.value))
            .collect()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MemoryRecords) -> R) -> Result<R> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| VocoderError::Metrics(format!("record store poisoned: {e}")))?;
        Ok(f(&mut records))
    }
}

impl MetricsSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        self.with(|r| {
            r.scalars.push(ScalarRecord {
                tag: tag.to_string(),
                step,
                value,
                wall_time: 0.0,
            });
        })
    }

    fn add_audio(&mut self, tag: &str, samples: &[f32], step: u64, _sample_rate: u32) -> Result<()> {
        self.with(|r| r.audio.push((tag.to_string(), step, samples.to_vec())))
    }

    fn add_figure(&mut self, tag: &str, spectrogram: &Spectrogram, step: u64) -> Result<()> {
        self.with(|r| r.figures.push((tag.to_string(), step, spectrogram.clone())))
    }
}
