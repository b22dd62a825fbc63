//! Dataset loading and batching.
//!
//! [`MelDataset`] turns one WAV file into a training sample: a conditioning
//! mel, the ground-truth waveform and the mel used as reconstruction target.
//! [`DataLoader`] groups samples into [`Batch`]es on background threads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use candle_core::{DType, Device, Tensor};
use crossbeam_channel::{bounded, Receiver};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::audio::wav::{load_wav, normalize_peak};
use crate::audio::MelExtractor;
use crate::config::{Hyperparameters, RunOptions};
use crate::error::{Result, VocoderError};

/// Peak level of normalized training audio.
const PEAK_LEVEL: f32 = 0.95;

/// Resolve an LJSpeech-style file list (`name|transcript` per line) to WAV paths.
///
/// Empty lines are skipped; only the first `|`-separated field is used.
#[must_use]
pub fn parse_file_list(content: &str, wavs_dir: &Path) -> Vec<PathBuf> {
    content
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let name = line.split('|').next().unwrap_or(line);
            wavs_dir.join(format!("{name}.wav"))
        })
        .collect()
}

/// Training and validation WAV paths named by the run's file lists.
///
/// # Errors
///
/// Returns an IO error if a file list cannot be read.
pub fn dataset_filelist(options: &RunOptions) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let read = |path: &Path| -> Result<Vec<PathBuf>> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VocoderError::Dataset(format!("cannot read file list {}: {e}", path.display()))
        })?;
        Ok(parse_file_list(&content, &options.input_wavs_dir))
    };
    Ok((
        read(&options.input_training_file)?,
        read(&options.input_validation_file)?,
    ))
}

/// One utterance after preprocessing. All tensors live on the CPU.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Conditioning mel `[num_mels, frames]`.
    pub mel: Tensor,
    /// Ground-truth waveform `[samples]`.
    pub audio: Tensor,
    /// Reconstruction-target mel `[num_mels, frames]`.
    pub mel_loss: Tensor,
    /// Source file.
    pub path: PathBuf,
}

/// A collated batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Conditioning mels `[batch, num_mels, frames]`.
    pub mel: Tensor,
    /// Ground-truth waveforms `[batch, 1, samples]`.
    pub audio: Tensor,
    /// Reconstruction-target mels `[batch, num_mels, frames]`.
    pub mel_loss: Tensor,
    /// Source files, in batch order.
    pub paths: Vec<PathBuf>,
}

impl Batch {
    /// Number of samples in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether the batch holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Copy every tensor to `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if a transfer fails.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            mel: self.mel.to_device(device)?,
            audio: self.audio.to_device(device)?,
            mel_loss: self.mel_loss.to_device(device)?,
            paths: self.paths.clone(),
        })
    }
}

/// Stack samples into a [`Batch`].
///
/// # Errors
///
/// Returns an error if `samples` is empty or the samples differ in shape.
pub fn collate(samples: &[Sample]) -> Result<Batch> {
    if samples.is_empty() {
        return Err(VocoderError::Dataset("cannot collate an empty batch".into()));
    }
    let stack = |f: fn(&Sample) -> &Tensor| -> Result<Tensor> {
        let tensors: Vec<&Tensor> = samples.iter().map(f).collect();
        Tensor::stack(&tensors, 0).map_err(|e| {
            VocoderError::Dataset(format!("samples of one batch differ in shape: {e}"))
        })
    };
    Ok(Batch {
        mel: stack(|s| &s.mel)?,
        audio: stack(|s| &s.audio)?.unsqueeze(1)?,
        mel_loss: stack(|s| &s.mel_loss)?,
        paths: samples.iter().map(|s| s.path.clone()).collect(),
    })
}

/// Audio dataset producing (conditioning mel, waveform, target mel) triples.
///
/// # Example
///
/// ```no_run
/// use istftnet_rs::dataset::MelDataset;
/// use istftnet_rs::Hyperparameters;
///
/// # fn main() -> istftnet_rs::Result<()> {
/// let hparams = Hyperparameters::reference_v1();
/// let files = vec!["LJSpeech-1.1/wavs/LJ001-0001.wav".into()];
/// let dataset = MelDataset::new(files, &hparams, true, None)?;
/// let sample = dataset.get(0, 0)?;
/// println!("{:?}", sample.mel.dims());
/// # Ok(())
/// # }
/// ```
pub struct MelDataset {
    files: Vec<PathBuf>,
    segment_size: usize,
    hop_size: usize,
    sampling_rate: u32,
    split: bool,
    /// Directory of precomputed conditioning mels; set when fine-tuning.
    mels_dir: Option<PathBuf>,
    seed: u64,
    conditioning: MelExtractor,
    target: MelExtractor,
}

impl MelDataset {
    /// Dataset over `files`.
    ///
    /// With `split`, every sample is a random `segment_size` window; otherwise
    /// whole utterances are returned. `mels_dir` enables fine-tuning mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the mel extractors cannot be built.
    pub fn new(
        files: Vec<PathBuf>,
        hparams: &Hyperparameters,
        split: bool,
        mels_dir: Option<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            files,
            segment_size: hparams.segment_size,
            hop_size: hparams.hop_size,
            sampling_rate: hparams.sampling_rate,
            split,
            mels_dir,
            seed: hparams.seed,
            conditioning: MelExtractor::conditioning(hparams, &Device::Cpu)?,
            target: MelExtractor::loss(hparams, &Device::Cpu)?,
        })
    }

    /// Number of utterances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the dataset holds no utterances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Source files in dataset order.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Load and preprocess utterance `index`.
    ///
    /// Random windows are drawn from a generator seeded by the dataset seed,
    /// `epoch` and `index`, so a sample does not depend on which worker loads it.
    ///
    /// # Errors
    ///
    /// Returns an error if the WAV (or fine-tuning mel) cannot be read, or its
    /// sampling rate differs from the configured one.
    pub fn get(&self, index: usize, epoch: u64) -> Result<Sample> {
        let path = self
            .files
            .get(index)
            .ok_or_else(|| VocoderError::Dataset(format!("index {index} out of range")))?;
        let (mut audio, sampling_rate) = load_wav(path)?;
        if sampling_rate != self.sampling_rate {
            return Err(VocoderError::Dataset(format!(
                "{} SR doesn't match target {} SR",
                sampling_rate, self.sampling_rate
            )));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream((epoch << 32) ^ index as u64);

        let (mel, audio) = match &self.mels_dir {
            None => {
                normalize_peak(&mut audio, PEAK_LEVEL);
                if self.split {
                    audio = self.random_segment(audio, &mut rng);
                }
                let samples = audio.len();
                let audio = Tensor::from_vec(audio, samples, &Device::Cpu)?;
                let mel = self.conditioning.forward(&audio)?.squeeze(0)?;
                (mel, audio)
            }
            Some(dir) => self.fine_tuning_pair(dir, path, audio, &mut rng)?,
        };
        let mel_loss = self.target.forward(&audio)?.squeeze(0)?;
        Ok(Sample {
            mel,
            audio,
            mel_loss,
            path: path.clone(),
        })
    }

    fn random_segment(&self, mut audio: Vec<f32>, rng: &mut ChaCha8Rng) -> Vec<f32> {
        if audio.len() >= self.segment_size {
            let start = rng.gen_range(0..=audio.len() - self.segment_size);
            audio.drain(..start);
            audio.truncate(self.segment_size);
        } else {
            audio.resize(self.segment_size, 0.0);
        }
        audio
    }

    /// Precomputed mel and the audio span it covers.
    fn fine_tuning_pair(
        &self,
        dir: &Path,
        path: &Path,
        mut audio: Vec<f32>,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Tensor, Tensor)> {
        let stem = path
            .file_stem()
            .ok_or_else(|| VocoderError::Dataset(format!("{} has no file name", path.display())))?;
        let mel_path = dir.join(format!("{}.npy", stem.to_string_lossy()));
        let mel = Tensor::read_npy(&mel_path)
            .map_err(|e| VocoderError::Dataset(format!("cannot read {}: {e}", mel_path.display())))?
            .to_dtype(DType::F32)?;
        let mel = match mel.rank() {
            2 => mel,
            3 => mel.squeeze(0)?,
            r => {
                return Err(VocoderError::Dataset(format!(
                    "{} has rank {r}, expected [num_mels, frames]",
                    mel_path.display()
                )))
            }
        };
        if mel.dim(0)? != self.conditioning.num_mels() {
            return Err(VocoderError::Dataset(format!(
                "{} has {} mel channels, expected {}",
                mel_path.display(),
                mel.dim(0)?,
                self.conditioning.num_mels()
            )));
        }
        if !self.split {
            let samples = audio.len();
            return Ok((mel, Tensor::from_vec(audio, samples, &Device::Cpu)?));
        }

        let frames_per_seg = self.segment_size.div_ceil(self.hop_size);
        let frames = mel.dim(1)?;
        let mel = if audio.len() >= self.segment_size && frames > frames_per_seg {
            let mel_start = rng.gen_range(0..frames - frames_per_seg);
            let start = (mel_start * self.hop_size).min(audio.len());
            let end = ((mel_start + frames_per_seg) * self.hop_size).min(audio.len());
            audio = audio[start..end].to_vec();
            audio.resize(self.segment_size, 0.0);
            mel.narrow(1, mel_start, frames_per_seg)?
        } else {
            audio.resize(self.segment_size, 0.0);
            let kept = frames.min(frames_per_seg);
            mel.narrow(1, 0, kept)?.pad_with_zeros(1, 0, frames_per_seg - kept)?
        };
        let samples = audio.len();
        Ok((mel, Tensor::from_vec(audio, samples, &Device::Cpu)?))
    }
}

/// Batching options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Samples per batch
    pub batch_size: usize,
    /// Background threads; `0` loads on the calling thread
    pub num_workers: usize,
    /// Batches buffered per worker
    pub prefetch: usize,
    /// Permute the dataset every epoch
    pub shuffle: bool,
    /// Drop a trailing incomplete batch
    pub drop_last: bool,
    /// Seed of the per-epoch permutation
    pub seed: u64,
}

impl LoaderConfig {
    /// Training loader: shuffled, incomplete batches dropped.
    #[must_use]
    pub fn training(hparams: &Hyperparameters) -> Self {
        Self {
            batch_size: hparams.batch_size,
            num_workers: hparams.num_workers,
            prefetch: 2,
            shuffle: true,
            drop_last: true,
            seed: hparams.seed,
        }
    }

    /// Validation loader: one utterance per batch, dataset order.
    #[must_use]
    pub fn validation(hparams: &Hyperparameters) -> Self {
        Self {
            batch_size: 1,
            num_workers: hparams.num_workers.min(1),
            prefetch: 2,
            shuffle: false,
            drop_last: true,
            seed: hparams.seed,
        }
    }

    /// Number of batches an epoch over `len` samples yields.
    #[must_use]
    pub fn batches_per_epoch(&self, len: usize) -> usize {
        if self.batch_size == 0 {
            return 0;
        }
        if self.drop_last {
            len / self.batch_size
        } else {
            len.div_ceil(self.batch_size)
        }
    }

    /// Sample indices of every batch of `epoch`, in consumption order.
    #[must_use]
    pub fn plan(&self, len: usize, epoch: u64) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..len).collect();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
            rng.set_stream(epoch);
            order.shuffle(&mut rng);
        }
        order
            .chunks(self.batch_size.max(1))
            .take(self.batches_per_epoch(len))
            .map(<[usize]>::to_vec)
            .collect()
    }
}

fn load_batch(dataset: &MelDataset, indices: &[usize], epoch: u64) -> Result<Batch> {
    let samples = indices
        .iter()
        .map(|&i| dataset.get(i, epoch))
        .collect::<Result<Vec<_>>>()?;
    collate(&samples)
}

/// Iterator over the batches of one epoch.
///
/// Worker `w` of `W` loads batches `w`, `w + W`, ... into its own bounded
/// channel; the consumer drains the channels round-robin, so batches arrive
/// in plan order regardless of worker timing.
pub struct DataLoader {
    dataset: Arc<MelDataset>,
    plan: Vec<Vec<usize>>,
    epoch: u64,
    device: Device,
    receivers: Vec<Receiver<Result<Batch>>>,
    workers: Vec<JoinHandle<()>>,
    next: usize,
}

impl DataLoader {
    /// Start loading `epoch`, skipping its first `skip` batches.
    pub fn new(
        dataset: Arc<MelDataset>,
        config: LoaderConfig,
        epoch: u64,
        skip: usize,
        device: &Device,
    ) -> Self {
        let plan: Vec<Vec<usize>> = config
            .plan(dataset.len(), epoch)
            .into_iter()
            .skip(skip)
            .collect();
        let mut loader = Self {
            dataset,
            plan,
            epoch,
            device: device.clone(),
            receivers: Vec::new(),
            workers: Vec::new(),
            next: 0,
        };
        if config.num_workers > 0 {
            loader.start_workers(config.num_workers, config.prefetch.max(1));
        }
        loader
    }

    fn start_workers(&mut self, num_workers: usize, prefetch: usize) {
        for worker in 0..num_workers.min(self.plan.len()) {
            let (tx, rx) = bounded(prefetch);
            let dataset = Arc::clone(&self.dataset);
            let batches: Vec<Vec<usize>> = self
                .plan
                .iter()
                .skip(worker)
                .step_by(num_workers)
                .cloned()
                .collect();
            let epoch = self.epoch;
            let handle = thread::spawn(move || {
                for indices in batches {
                    // A closed channel means the loader was dropped.
                    if tx.send(load_batch(&dataset, &indices, epoch)).is_err() {
                        break;
                    }
                }
            });
            self.receivers.push(rx);
            self.workers.push(handle);
        }
    }

    /// Batches left in this epoch.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.plan.len() - self.next
    }

    fn next_batch(&mut self) -> Option<Result<Batch>> {
        let indices = self.plan.get(self.next)?;
        let batch = if self.receivers.is_empty() {
            load_batch(&self.dataset, indices, self.epoch)
        } else {
            let rx = &self.receivers[self.next % self.receivers.len()];
            rx.recv().unwrap_or_else(|_| {
                Err(VocoderError::Dataset("data loader worker terminated".into()))
            })
        };
        self.next += 1;
        Some(batch.and_then(|b| b.to_device(&self.device)))
    }
}

impl Iterator for DataLoader {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining(), Some(self.remaining()))
    }
}

impl Drop for DataLoader {
    fn drop(&mut self) {
        // Unblock workers waiting on a full channel.
        self.receivers.clear();
        join_workers(self.workers.drain(..));
    }
}

/// Join loader threads, reporting any that panicked. Returns the number of
/// panicked workers.
fn join_workers(workers: impl IntoIterator<Item = JoinHandle<()>>) -> usize {
    let mut panicked = 0;
    for (index, worker) in workers.into_iter().enumerate() {
        if let Err(payload) = worker.join() {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::warn!("Data loader worker {index} panicked: {message}");
            panicked += 1;
        }
    }
    panicked
}
