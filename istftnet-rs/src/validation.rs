//! Held-out evaluation of the generator.

use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::audio::{MelExtractor, Synthesizer};
use crate::config::Hyperparameters;
use crate::dataset::{Batch, DataLoader, LoaderConfig, MelDataset};
use crate::error::Result;
use crate::loss::mel_loss;
use crate::metrics::{MetricsSink, Spectrogram};
use crate::models::SpectralGenerator;

/// Series carrying the mean validation mel error.
pub const VALIDATION_SERIES: &str = "validation/mel_spec_error";

/// Runs the generator over the validation set and reports the mean L1 mel error.
///
/// The first `qualitative_batches` batches additionally emit the generated
/// audio and its mel rendering on every pass, plus the ground-truth audio and
/// conditioning mel on the pass at step 0.
pub struct ValidationRunner {
    dataset: Arc<MelDataset>,
    loader: LoaderConfig,
    target_mel: MelExtractor,
    display_mel: MelExtractor,
    qualitative_batches: usize,
    sampling_rate: u32,
    device: Device,
}

impl ValidationRunner {
    /// Runner over `dataset`, one utterance per batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the mel extractors cannot be built.
    pub fn new(dataset: Arc<MelDataset>, hparams: &Hyperparameters, device: &Device) -> Result<Self> {
        Ok(Self {
            dataset,
            loader: LoaderConfig::validation(hparams),
            target_mel: MelExtractor::loss(hparams, device)?,
            display_mel: MelExtractor::conditioning(hparams, device)?,
            qualitative_batches: hparams.qualitative_batches,
            sampling_rate: hparams.sampling_rate,
            device: device.clone(),
        })
    }

    /// Number of validation utterances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    /// Whether the validation set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Evaluate `generator` at `step`.
    ///
    /// Returns the mean mel error, or `None` for an empty validation set (no
    /// scalar is emitted then). The generator is in evaluation mode for the
    /// duration of the pass and back in training mode afterwards, also when
    /// the pass fails.
    ///
    /// # Errors
    ///
    /// Returns an error if a batch cannot be loaded, a forward pass fails or
    /// the sink rejects a record.
    pub fn run(
        &self,
        generator: &mut dyn SpectralGenerator,
        synthesizer: &Synthesizer,
        step: u64,
        sink: &mut dyn MetricsSink,
    ) -> Result<Option<f64>> {
        generator.eval();
        let result = self.evaluate(&*generator, synthesizer, step, sink);
        generator.train();

        let mean = result?;
        match mean {
            Some(error) => {
                sink.add_scalar(VALIDATION_SERIES, error, step)?;
                tracing::info!("Validation at step {step}: mel error {error:.4}");
            }
            None => tracing::warn!("Validation set is empty; skipping validation at step {step}"),
        }
        Ok(mean)
    }

    fn evaluate(
        &self,
        generator: &dyn SpectralGenerator,
        synthesizer: &Synthesizer,
        step: u64,
        sink: &mut dyn MetricsSink,
    ) -> Result<Option<f64>> {
        let loader = DataLoader::new(Arc::clone(&self.dataset), self.loader, 0, 0, &self.device);
        let mut total = 0.0;
        let mut batches = 0usize;
        for (j, batch) in loader.enumerate() {
            let batch = batch?;
            let generated = synthesizer.synthesize(&generator.forward(&batch.mel)?)?.detach();
            let generated_mel = self.target_mel.forward(&generated)?;
            total += f64::from(mel_loss(&batch.mel_loss, &generated_mel)?.to_scalar::<f32>()?);
            batches += 1;

            if j < self.qualitative_batches {
                self.emit_artifacts(j, &batch, &generated, step, sink)?;
            }
        }
        if batches == 0 {
            return Ok(None);
        }
        #[allow(clippy::cast_precision_loss)]
        let mean = total / batches as f64;
        Ok(Some(mean))
    }

    fn emit_artifacts(
        &self,
        j: usize,
        batch: &Batch,
        generated: &Tensor,
        step: u64,
        sink: &mut dyn MetricsSink,
    ) -> Result<()> {
        if step == 0 {
            let audio = batch.audio.get(0)?.flatten_all()?.to_vec1::<f32>()?;
            sink.add_audio(&format!("gt/y_{j}"), &audio, step, self.sampling_rate)?;
            let mel = Spectrogram::from_tensor(&batch.mel.get(0)?)?;
            sink.add_figure(&format!("gt/y_spec_{j}"), &mel, step)?;
        }
        let audio = generated.get(0)?.flatten_all()?.to_vec1::<f32>()?;
        sink.add_audio(&format!("generated/y_hat_{j}"), &audio, step, self.sampling_rate)?;
        let mel = self.display_mel.forward(&generated.get(0)?)?;
        sink.add_figure(&format!("generated/y_hat_spec_{j}"), &Spectrogram::from_tensor(&mel)?, step)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::write_wav;
    use crate::config::test_hparams;
    use crate::metrics::MemorySink;
    use crate::models::{IstftGenerator, Trainable};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn corpus(dir: &Path, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("val{i}.wav"));
                #[allow(clippy::cast_precision_loss)]
                let audio: Vec<f32> = (0..320 + 16 * i).map(|n| (n as f32 * 0.2).sin() * 0.3).collect();
                write_wav(&path, &audio, 1600).unwrap();
                path
            })
            .collect()
    }

    fn setup(count: usize) -> (TempDir, ValidationRunner, IstftGenerator, Synthesizer) {
        let dir = TempDir::new().unwrap();
        let h = test_hparams();
        let dataset = Arc::new(MelDataset::new(corpus(dir.path(), count), &h, false, None).unwrap());
        let runner = ValidationRunner::new(dataset, &h, &Device::Cpu).unwrap();
        let generator = IstftGenerator::new(&h, &Device::Cpu).unwrap();
        let synthesizer = Synthesizer::new(
            h.gen_istft_n_fft,
            h.gen_istft_hop_size,
            h.gen_istft_n_fft,
            &Device::Cpu,
        )
        .unwrap();
        (dir, runner, generator, synthesizer)
    }

    #[test]
    fn test_mean_error_and_artifacts_at_step_zero() {
        let (_dir, runner, mut generator, synth) = setup(3);
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        let error = runner.run(&mut generator, &synth, 0, &mut writer).unwrap().unwrap();
        assert!(error.is_finite() && error > 0.0);
        assert!(generator.is_training());

        let records = sink.records();
        assert_eq!(sink.series(VALIDATION_SERIES), vec![(0, error)]);
        // qualitative_batches = 2 in the small configuration
        let audio: Vec<&str> = records.audio.iter().map(|(t, _, _)| t.as_str()).collect();
        assert_eq!(audio, vec!["gt/y_0", "generated/y_hat_0", "gt/y_1", "generated/y_hat_1"]);
        let figures: Vec<&str> = records.figures.iter().map(|(t, _, _)| t.as_str()).collect();
        assert_eq!(
            figures,
            vec!["gt/y_spec_0", "generated/y_hat_spec_0", "gt/y_spec_1", "generated/y_hat_spec_1"]
        );
        assert_eq!(records.figures[0].2.bins, 8);
    }

    #[test]
    fn test_ground_truth_only_on_first_pass() {
        let (_dir, runner, mut generator, synth) = setup(1);
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        runner.run(&mut generator, &synth, 1000, &mut writer).unwrap();
        let records = sink.records();
        assert!(records.audio.iter().all(|(t, _, _)| t.starts_with("generated/")));
        assert_eq!(records.figures.len(), 1);
        assert_eq!(records.audio[0].1, 1000);
    }

    #[test]
    fn test_empty_validation_set() {
        let (_dir, runner, mut generator, synth) = setup(0);
        assert!(runner.is_empty());
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        assert_eq!(runner.run(&mut generator, &synth, 0, &mut writer).unwrap(), None);
        assert!(sink.records().scalars.is_empty());
        assert!(generator.is_training());
    }

    #[test]
    fn test_failure_restores_training_mode() {
        let dir = TempDir::new().unwrap();
        let h = test_hparams();
        let missing = vec![dir.path().join("missing.wav")];
        let dataset = Arc::new(MelDataset::new(missing, &h, false, None).unwrap());
        let runner = ValidationRunner::new(dataset, &h, &Device::Cpu).unwrap();
        let mut generator = IstftGenerator::new(&h, &Device::Cpu).unwrap();
        let synth = Synthesizer::new(16, 4, 16, &Device::Cpu).unwrap();
        let mut sink = MemorySink::new();
        assert!(runner.run(&mut generator, &synth, 0, &mut sink).is_err());
        assert!(generator.is_training());
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let (_dir, runner, mut generator, synth) = setup(2);
        let mut sink = MemorySink::new();
        let a = runner.run(&mut generator, &synth, 5, &mut sink).unwrap();
        let b = runner.run(&mut generator, &synth, 5, &mut sink).unwrap();
        assert_eq!(a, b);
    }
}
