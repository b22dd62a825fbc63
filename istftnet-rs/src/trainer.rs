//! Adversarial training loop.

use std::sync::Arc;
use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use indicatif::{ProgressBar, ProgressStyle};

use crate::audio::{MelExtractor, Synthesizer};
use crate::checkpoint::{CheckpointManager, GeneratorSnapshot, TrainingSnapshot};
use crate::config::{Hyperparameters, RunOptions};
use crate::dataset::{dataset_filelist, Batch, DataLoader, LoaderConfig, MelDataset};
use crate::error::{Result, VocoderError};
use crate::loss::{DiscriminatorLoss, LossComposer, LossTerms};
use crate::metrics::MetricsSink;
use crate::models::{
    parameter_count, Discriminator, IstftGenerator, MultiPeriodDiscriminator,
    MultiScaleDiscriminator, SpectralGenerator, Trainable,
};
use crate::optimizer::{AdamW, AdamWConfig};
use crate::scheduler::ExponentialLr;
use crate::validation::ValidationRunner;

/// Series of the generator total.
pub const GEN_LOSS_SERIES: &str = "training/gen_loss_total";
/// Series of the unscaled training mel error.
pub const MEL_ERROR_SERIES: &str = "training/mel_spec_error";

/// Position of a run: the global step and the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingState {
    /// Index of the next step to run.
    pub steps: u64,
    /// Current epoch, `-1` before the first epoch starts.
    pub epoch: i64,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            steps: 0,
            epoch: -1,
        }
    }
}

impl TrainingState {
    /// State after restoring a checkpoint saved at step `steps` during `epoch`.
    ///
    /// The saved step has completed, so the run continues with the next one.
    #[must_use]
    pub fn resumed(steps: u64, epoch: i64) -> Self {
        Self {
            steps: steps + 1,
            epoch,
        }
    }
}

/// Pick the training device.
///
/// CUDA is used when the crate is built with the `cuda` feature and a device
/// is available. `ISTFTNET_FORCE_CPU=1` forces the CPU and
/// `ISTFTNET_CUDA_DEVICE` selects the CUDA ordinal.
#[must_use]
pub fn select_device() -> Device {
    let force_cpu = std::env::var("ISTFTNET_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let cuda_device = std::env::var("ISTFTNET_CUDA_DEVICE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    if !force_cpu && cfg!(feature = "cuda") {
        match Device::cuda_if_available(cuda_device) {
            Ok(device @ Device::Cuda(_)) => {
                tracing::info!("Training device: CUDA (device {})", cuda_device);
                device
            }
            Ok(_) => {
                tracing::warn!("CUDA not available; falling back to CPU.");
                Device::Cpu
            }
            Err(err) => {
                tracing::warn!("CUDA init failed ({err}); falling back to CPU.");
                Device::Cpu
            }
        }
    } else {
        if force_cpu {
            tracing::warn!("CPU mode forced via ISTFTNET_FORCE_CPU=1.");
        } else {
            tracing::info!("CUDA feature disabled; training on CPU. Enable with --features cuda.");
        }
        Device::Cpu
    }
}

/// Fail with [`VocoderError::NonFiniteLoss`] when `loss` is NaN or infinite.
fn ensure_finite(enabled: bool, step: u64, term: &'static str, loss: &Tensor) -> Result<()> {
    if !enabled {
        return Ok(());
    }
    let value = loss.to_scalar::<f32>()?;
    if value.is_finite() {
        Ok(())
    } else {
        Err(VocoderError::NonFiniteLoss { step, term, value })
    }
}

fn prefixed(prefix: &str, params: Vec<(String, Var)>) -> Vec<(String, Var)> {
    params
        .into_iter()
        .map(|(name, var)| (format!("{prefix}.{name}"), var))
        .collect()
}

/// Drives the generator and both discriminator ensembles through the
/// alternating update protocol, with periodic logging, checkpointing and
/// validation.
///
/// On construction the newest complete checkpoint pair in the checkpoint
/// directory is restored, if there is one.
///
/// # Example
///
/// ```no_run
/// use istftnet_rs::config::RunOptions;
/// use istftnet_rs::metrics::EventFileSink;
/// use istftnet_rs::{Hyperparameters, TrainingOrchestrator};
///
/// # fn main() -> istftnet_rs::Result<()> {
/// let hparams = Hyperparameters::from_file("config_v1.json")?;
/// let options = RunOptions::default();
/// let sink = EventFileSink::new(options.checkpoint_path.join("logs"))?;
///
/// let mut orchestrator = TrainingOrchestrator::new(hparams, options, Box::new(sink))?;
/// orchestrator.fit()?;
/// # Ok(())
/// # }
/// ```
pub struct TrainingOrchestrator {
    hparams: Hyperparameters,
    options: RunOptions,
    device: Device,
    generator: Box<dyn SpectralGenerator>,
    mpd: Box<dyn Discriminator>,
    msd: Box<dyn Discriminator>,
    synthesizer: Synthesizer,
    /// Mel transform applied to generated audio; matches the dataset's loss mel.
    target_mel: MelExtractor,
    composer: LossComposer,
    optim_g: AdamW,
    optim_d: AdamW,
    scheduler_g: ExponentialLr,
    scheduler_d: ExponentialLr,
    checkpoints: CheckpointManager,
    train_set: Arc<MelDataset>,
    validation: ValidationRunner,
    sink: Box<dyn MetricsSink>,
    state: TrainingState,
}

impl TrainingOrchestrator {
    /// Build a run on the device chosen by [`select_device`].
    ///
    /// # Errors
    ///
    /// See [`TrainingOrchestrator::with_device`].
    pub fn new(
        hparams: Hyperparameters,
        options: RunOptions,
        sink: Box<dyn MetricsSink>,
    ) -> Result<Self> {
        Self::with_device(hparams, options, sink, &select_device())
    }

    /// Build a run on `device`, resuming from the checkpoint directory when it
    /// holds a complete pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, a file list cannot be
    /// read, or a checkpoint pair is present but cannot be restored.
    pub fn with_device(
        hparams: Hyperparameters,
        options: RunOptions,
        sink: Box<dyn MetricsSink>,
        device: &Device,
    ) -> Result<Self> {
        hparams.validate()?;
        options.validate()?;
        std::fs::create_dir_all(&options.checkpoint_path)?;

        let generator = IstftGenerator::new(&hparams, device)?;
        let mpd = MultiPeriodDiscriminator::new(&hparams, hparams.seed + 1, device)?;
        let msd = MultiScaleDiscriminator::new(&hparams, hparams.seed + 2, device)?;
        tracing::info!(
            "Generator: {} parameters, MPD: {} parameters, MSD: {} parameters",
            parameter_count(&generator)?,
            parameter_count(&mpd)?,
            parameter_count(&msd)?
        );

        let adam = AdamWConfig::from_hparams(&hparams);
        let mut optim_g = AdamW::new(generator.parameters()?, adam);
        let mut d_params = prefixed("mpd", mpd.parameters()?);
        d_params.extend(prefixed("msd", msd.parameters()?));
        let mut optim_d = AdamW::new(d_params, adam);

        let checkpoints = CheckpointManager::new(&options.checkpoint_path);
        let state = match checkpoints.load_latest(device)? {
            Some(point) => {
                generator.load_state_dict(&point.generator.generator)?;
                mpd.load_state_dict(&point.training.mpd)?;
                msd.load_state_dict(&point.training.msd)?;
                optim_g.load_state_tensors(&point.training.optim_g)?;
                optim_d.load_state_tensors(&point.training.optim_d)?;
                tracing::info!(
                    "Resumed from checkpoint pair at step {} (epoch {})",
                    point.step,
                    point.training.epoch
                );
                TrainingState::resumed(point.training.steps, point.training.epoch)
            }
            None => {
                tracing::info!(
                    "No complete checkpoint pair in {}; starting fresh",
                    options.checkpoint_path.display()
                );
                TrainingState::default()
            }
        };
        let scheduler_g = ExponentialLr::resume(&mut optim_g, hparams.lr_decay, state.epoch);
        let scheduler_d = ExponentialLr::resume(&mut optim_d, hparams.lr_decay, state.epoch);

        let (train_files, validation_files) = dataset_filelist(&options)?;
        let mels_dir = options.fine_tuning.then(|| options.input_mels_dir.clone());
        let train_set = Arc::new(MelDataset::new(train_files, &hparams, true, mels_dir.clone())?);
        let validation_set = Arc::new(MelDataset::new(validation_files, &hparams, false, mels_dir)?);
        tracing::info!(
            "Loaded {} training and {} validation utterances",
            train_set.len(),
            validation_set.len()
        );
        let validation = ValidationRunner::new(validation_set, &hparams, device)?;

        let synthesizer = Synthesizer::new(
            hparams.gen_istft_n_fft,
            hparams.gen_istft_hop_size,
            hparams.gen_istft_n_fft,
            device,
        )?;

        let mut generator: Box<dyn SpectralGenerator> = Box::new(generator);
        let mut mpd: Box<dyn Discriminator> = Box::new(mpd);
        let mut msd: Box<dyn Discriminator> = Box::new(msd);
        generator.train();
        mpd.train();
        msd.train();

        Ok(Self {
            target_mel: MelExtractor::loss(&hparams, device)?,
            composer: LossComposer::from_hparams(&hparams),
            hparams,
            options,
            device: device.clone(),
            generator,
            mpd,
            msd,
            synthesizer,
            optim_g,
            optim_d,
            scheduler_g,
            scheduler_d,
            checkpoints,
            train_set,
            validation,
            sink,
            state,
        })
    }

    /// Current step and epoch.
    #[must_use]
    pub fn state(&self) -> TrainingState {
        self.state
    }

    /// The generator being trained.
    #[must_use]
    pub fn generator(&self) -> &dyn SpectralGenerator {
        self.generator.as_ref()
    }

    /// The multi-period ensemble.
    #[must_use]
    pub fn mpd(&self) -> &dyn Discriminator {
        self.mpd.as_ref()
    }

    /// The multi-scale ensemble.
    #[must_use]
    pub fn msd(&self) -> &dyn Discriminator {
        self.msd.as_ref()
    }

    /// Generator optimizer.
    #[must_use]
    pub fn optimizer_g(&self) -> &AdamW {
        &self.optim_g
    }

    /// Optimizer of both discriminator ensembles.
    #[must_use]
    pub fn optimizer_d(&self) -> &AdamW {
        &self.optim_d
    }

    /// Current generator and discriminator learning rates.
    #[must_use]
    pub fn learning_rates(&self) -> (f64, f64) {
        (self.optim_g.learning_rate(), self.optim_d.learning_rate())
    }

    /// Device the networks live on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Train until `training_epochs` is reached.
    ///
    /// # Errors
    ///
    /// Returns the first error of any step; the last saved checkpoint pair is
    /// the recovery point.
    pub fn fit(&mut self) -> Result<()> {
        self.fit_until(None)
    }

    /// Train until `training_epochs` is reached or, with `max_steps`, until
    /// the step counter reaches `max_steps`.
    ///
    /// A resumed run continues inside the restored epoch: the batches that
    /// epoch already consumed are skipped, so the run sees the same batch
    /// sequence as an uninterrupted one.
    ///
    /// # Errors
    ///
    /// Returns an error if the training set yields no batch or a step fails.
    pub fn fit_until(&mut self, max_steps: Option<u64>) -> Result<()> {
        let loader = LoaderConfig::training(&self.hparams);
        let per_epoch = loader.batches_per_epoch(self.train_set.len());
        if per_epoch == 0 {
            return Err(VocoderError::Training(format!(
                "training set of {} utterances holds no complete batch of {}",
                self.train_set.len(),
                self.hparams.batch_size
            )));
        }
        let reached = |state: TrainingState| max_steps.is_some_and(|m| state.steps >= m);

        tracing::info!("Starting training");
        tracing::info!("  Batches per epoch: {}", per_epoch);
        tracing::info!("  Epochs: {}", self.options.training_epochs);

        for epoch in self.state.epoch.max(0)..self.options.training_epochs {
            if reached(self.state) {
                break;
            }
            self.state.epoch = epoch;
            let skip = self.resume_offset(epoch, per_epoch);
            tracing::info!("Epoch: {}", epoch + 1);
            let started = Instant::now();

            let pb = self.progress_bar(per_epoch)?;
            pb.set_position(skip as u64);
            let batches = DataLoader::new(
                Arc::clone(&self.train_set),
                loader,
                epoch.unsigned_abs(),
                skip,
                &self.device,
            );
            let mut interrupted = false;
            for batch in batches {
                if reached(self.state) {
                    interrupted = true;
                    break;
                }
                let losses = self.process_batch(&batch?)?;
                pb.set_message(format!("{:.4}", losses.generator_total));
                pb.inc(1);
            }
            if interrupted {
                pb.abandon_with_message("stopped");
                break;
            }
            pb.finish_and_clear();

            self.end_epoch();
            tracing::info!(
                "Time taken for epoch {} is {:.1} sec",
                epoch + 1,
                started.elapsed().as_secs_f64()
            );
        }

        self.sink.flush()?;
        tracing::info!("Training stopped at step {}", self.state.steps);
        Ok(())
    }

    /// Batches of `epoch` already consumed according to the step counter.
    #[allow(clippy::cast_possible_truncation)]
    fn resume_offset(&self, epoch: i64, per_epoch: usize) -> usize {
        let epoch_start = epoch.unsigned_abs() * per_epoch as u64;
        match self.state.steps.checked_sub(epoch_start) {
            Some(offset) if offset <= per_epoch as u64 => offset as usize,
            _ => {
                tracing::warn!(
                    "Step {} does not fall inside epoch {} of {} batches; replaying the whole epoch",
                    self.state.steps,
                    epoch,
                    per_epoch
                );
                0
            }
        }
    }

    fn progress_bar(&self, len: usize) -> Result<ProgressBar> {
        if !self.options.progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("#>-"),
        );
        Ok(pb)
    }

    /// Run one step on `batch` and fire the cadence hooks due at it.
    ///
    /// The step counter advances by exactly one per call, whatever the hooks do.
    ///
    /// # Errors
    ///
    /// Returns an error if a forward pass, the finite-loss guard, a
    /// checkpoint save or validation fails. The counter does not advance then.
    pub fn process_batch(&mut self, batch: &Batch) -> Result<LossTerms> {
        let started = Instant::now();
        let losses = self.optimize(batch)?;
        let step = self.state.steps;

        if step % self.options.stdout_interval == 0 {
            tracing::info!(
                "Steps : {}, Gen Loss Total : {:4.3}, Mel-Spec. Error : {:4.3}, s/b : {:4.3}",
                step,
                losses.generator_total,
                losses.mel_error,
                started.elapsed().as_secs_f64()
            );
        }
        tracing::debug!(
            "step {step}: d_mpd {:.4} d_msd {:.4} g_mpd {:.4} g_msd {:.4} fm_mpd {:.4} fm_msd {:.4}",
            losses.discriminator_mpd,
            losses.discriminator_msd,
            losses.adversarial_mpd,
            losses.adversarial_msd,
            losses.feature_mpd,
            losses.feature_msd
        );
        if step % self.options.summary_interval == 0 {
            self.sink
                .add_scalar(GEN_LOSS_SERIES, f64::from(losses.generator_total), step)?;
            self.sink
                .add_scalar(MEL_ERROR_SERIES, f64::from(losses.mel_error), step)?;
        }
        if step % self.options.checkpoint_interval == 0 && step != 0 {
            self.save_checkpoint()?;
        }
        if step % self.options.validation_interval == 0 {
            self.validation.run(
                self.generator.as_mut(),
                &self.synthesizer,
                step,
                self.sink.as_mut(),
            )?;
        }

        self.state.steps += 1;
        Ok(losses)
    }

    /// Discriminator update followed by the generator update.
    fn optimize(&mut self, batch: &Batch) -> Result<LossTerms> {
        let step = self.state.steps;
        let generated = self
            .synthesizer
            .synthesize(&self.generator.forward(&batch.mel)?)?;
        let generated_mel = self.target_mel.forward(&generated)?;

        let (d_loss, d_grads) = self.discriminator_phase(&batch.audio, &generated)?;
        ensure_finite(self.options.check_finite, step, "discriminator", &d_loss.total)?;
        self.optim_d.step(&d_grads)?;

        // Second pass sees the updated discriminator weights.
        let mpd = self.mpd.forward(&batch.audio, &generated)?;
        let msd = self.msd.forward(&batch.audio, &generated)?;
        let g_loss = self
            .composer
            .generator(&mpd, &msd, &batch.mel_loss, &generated_mel)?;
        ensure_finite(self.options.check_finite, step, "generator", &g_loss.total)?;
        let g_grads = g_loss.total.backward()?;
        self.optim_g.step(&g_grads)?;

        LossTerms::collect(&d_loss, &g_loss)
    }

    /// Discriminator loss and its gradients on a detached copy of `generated`.
    fn discriminator_phase(
        &self,
        audio: &Tensor,
        generated: &Tensor,
    ) -> Result<(DiscriminatorLoss, GradStore)> {
        let generated = generated.detach();
        let mpd = self.mpd.forward(audio, &generated)?;
        let msd = self.msd.forward(audio, &generated)?;
        let loss = self.composer.discriminator(&mpd, &msd)?;
        let grads = loss.total.backward()?;
        Ok((loss, grads))
    }

    /// Decay both learning rates; called once after every full epoch.
    pub fn end_epoch(&mut self) {
        self.scheduler_g.step(&mut self.optim_g);
        self.scheduler_d.step(&mut self.optim_d);
        tracing::debug!(
            "Learning rates after epoch {}: g {:.3e}, d {:.3e}",
            self.scheduler_g.last_epoch(),
            self.optim_g.learning_rate(),
            self.optim_d.learning_rate()
        );
    }

    /// Save the checkpoint pair for the current step.
    ///
    /// # Errors
    ///
    /// Returns an error if a snapshot cannot be taken or written.
    pub fn save_checkpoint(&self) -> Result<()> {
        let generator = GeneratorSnapshot {
            generator: self.generator.state_dict()?,
        };
        let training = TrainingSnapshot {
            mpd: self.mpd.state_dict()?,
            msd: self.msd.state_dict()?,
            optim_g: self.optim_g.state_tensors()?,
            optim_d: self.optim_d.state_tensors()?,
            steps: self.state.steps,
            epoch: self.state.epoch,
        };
        let (g_path, do_path) = self.checkpoints.save(&generator, &training)?;
        tracing::info!(
            "Saving checkpoint to {} and {}",
            g_path.display(),
            do_path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::write_wav;
    use crate::config::test_hparams;
    use crate::dataset::collate;
    use crate::metrics::MemorySink;
    use std::path::Path;
    use tempfile::TempDir;

    fn create_test_corpus(dir: &Path, train: usize, validation: usize) -> RunOptions {
        let wavs = dir.join("wavs");
        std::fs::create_dir_all(&wavs).unwrap();
        let mut lines = Vec::new();
        for i in 0..train + validation {
            #[allow(clippy::cast_precision_loss)]
            let audio: Vec<f32> = (0..400 + 24 * i)
                .map(|n| ((n as f32) * (0.05 + 0.01 * i as f32)).sin() * 0.5)
                .collect();
            write_wav(&wavs.join(format!("utt{i}.wav")), &audio, 1600).unwrap();
            lines.push(format!("utt{i}|transcript {i}"));
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

    fn create_orchestrator(options: RunOptions, sink: &MemorySink) -> TrainingOrchestrator {
        TrainingOrchestrator::with_device(
            test_hparams(),
            options,
            Box::new(sink.clone()),
            &Device::Cpu,
        )
        .unwrap()
    }

    fn first_batch(orchestrator: &TrainingOrchestrator) -> Batch {
        let samples = [
            orchestrator.train_set.get(0, 0).unwrap(),
            orchestrator.train_set.get(1, 0).unwrap(),
        ];
        collate(&samples).unwrap()
    }

    #[test]
    fn test_fresh_state() {
        assert_eq!(
            TrainingState::default(),
            TrainingState {
                steps: 0,
                epoch: -1
            }
        );
        assert_eq!(
            TrainingState::resumed(499, 3),
            TrainingState {
                steps: 500,
                epoch: 3
            }
        );
    }

    #[test]
    fn test_discriminator_phase_leaves_generator_without_gradients() {
        let dir = TempDir::new().unwrap();
        let sink = MemorySink::new();
        let orchestrator = create_orchestrator(create_test_corpus(dir.path(), 2, 1), &sink);
        let batch = first_batch(&orchestrator);

        let generated = orchestrator
            .synthesizer
            .synthesize(&orchestrator.generator.forward(&batch.mel).unwrap())
            .unwrap();
        let (_, grads) = orchestrator
            .discriminator_phase(&batch.audio, &generated)
            .unwrap();

        for (name, var) in orchestrator.generator.parameters().unwrap() {
            assert!(grads.get(var.as_tensor()).is_none(), "{name} received a gradient");
        }
        let reached = orchestrator
            .mpd
            .parameters()
            .unwrap()
            .iter()
            .filter(|(_, var)| grads.get(var.as_tensor()).is_some())
            .count();
        assert!(reached > 0);
    }

    #[test]
    fn test_step_counter_advances_once_per_batch() {
        let dir = TempDir::new().unwrap();
        let mut options = create_test_corpus(dir.path(), 2, 1);
        options.checkpoint_interval = 1;
        options.validation_interval = 1;
        let sink = MemorySink::new();
        let mut orchestrator = create_orchestrator(options, &sink);
        let batch = first_batch(&orchestrator);

        for expected in 1..=3 {
            let losses = orchestrator.process_batch(&batch).unwrap();
            assert!(losses.generator_total.is_finite());
            assert_eq!(orchestrator.state().steps, expected);
        }
        assert_eq!(orchestrator.optimizer_g().step_count(), 3);
        assert_eq!(orchestrator.optimizer_d().step_count(), 3);
        assert_eq!(sink.series(GEN_LOSS_SERIES).len(), 3);
        assert_eq!(sink.series(crate::validation::VALIDATION_SERIES).len(), 3);
        // step 0 never checkpoints
        assert_eq!(
            crate::checkpoint::steps(&dir.path().join("cp"), "g_").unwrap(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_discriminator_optimizer_covers_both_ensembles() {
        let dir = TempDir::new().unwrap();
        let sink = MemorySink::new();
        let orchestrator = create_orchestrator(create_test_corpus(dir.path(), 2, 1), &sink);
        let names: Vec<&str> = orchestrator.optimizer_d().parameter_names().collect();
        assert!(names.iter().any(|n| n.starts_with("mpd.")));
        assert!(names.iter().any(|n| n.starts_with("msd.")));
        assert_eq!(
            names.len(),
            orchestrator.mpd().parameters().unwrap().len()
                + orchestrator.msd().parameters().unwrap().len()
        );
    }

    #[test]
    fn test_non_finite_guard() {
        let nan = Tensor::new(f32::NAN, &Device::Cpu).unwrap();
        let err = ensure_finite(true, 7, "generator", &nan).unwrap_err();
        assert!(matches!(
            err,
            VocoderError::NonFiniteLoss {
                step: 7,
                term: "generator",
                ..
            }
        ));
        assert!(ensure_finite(false, 7, "generator", &nan).is_ok());
        let inf = Tensor::new(f32::INFINITY, &Device::Cpu).unwrap();
        assert!(ensure_finite(true, 0, "discriminator", &inf).is_err());
        let finite = Tensor::new(1.5f32, &Device::Cpu).unwrap();
        assert!(ensure_finite(true, 0, "discriminator", &finite).is_ok());
    }

    #[test]
    fn test_resume_offset() {
        let dir = TempDir::new().unwrap();
        let sink = MemorySink::new();
        let mut orchestrator = create_orchestrator(create_test_corpus(dir.path(), 2, 1), &sink);
        orchestrator.state = TrainingState { steps: 7, epoch: 2 };
        assert_eq!(orchestrator.resume_offset(2, 3), 1);
        orchestrator.state = TrainingState { steps: 9, epoch: 2 };
        assert_eq!(orchestrator.resume_offset(2, 3), 3);
        orchestrator.state = TrainingState { steps: 2, epoch: 2 };
        assert_eq!(orchestrator.resume_offset(2, 3), 0);
    }

    #[test]
    fn test_fit_requires_a_full_batch() {
        let dir = TempDir::new().unwrap();
        let sink = MemorySink::new();
        let mut orchestrator = create_orchestrator(create_test_corpus(dir.path(), 1, 1), &sink);
        assert!(matches!(
            orchestrator.fit(),
            Err(VocoderError::Training(_))
        ));
    }

    #[test]
    fn test_fit_until_stops_mid_epoch() {
        let dir = TempDir::new().unwrap();
        let sink = MemorySink::new();
        let mut orchestrator = create_orchestrator(create_test_corpus(dir.path(), 6, 1), &sink);
        orchestrator.fit_until(Some(2)).unwrap();
        assert_eq!(orchestrator.state(), TrainingState { steps: 2, epoch: 0 });
        // no scheduler step for an unfinished epoch
        let (lr_g, _) = orchestrator.learning_rates();
        assert!((lr_g - test_hparams().learning_rate).abs() < 1e-15);
    }
}
