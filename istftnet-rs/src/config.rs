//! Configuration parsing and validation.
//!
//! Two configuration layers exist:
//!
//! - [`Hyperparameters`]: the JSON document describing the model, the signal
//!   processing setup and the optimizer. Loaded once, validated, then shared
//!   read-only by every component.
//! - [`RunOptions`]: the command surface (dataset locations, checkpoint
//!   directory, epoch count and step cadences).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VocoderError};

/// Residual block flavour used by the generator's multi-receptive-field fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResblockKind {
    /// Two dilated convolutions per dilation (`"1"`).
    #[serde(rename = "1")]
    One,
    /// One dilated convolution per dilation (`"2"`).
    #[serde(rename = "2")]
    Two,
}

/// Training hyperparameters, as found in iSTFTNet `config_v*.json` files.
///
/// Fields without a serde default are required; a document missing any of
/// them is rejected at load time. Keys this struct does not know about
/// (`num_gpus`, `dist_config`, ...) are ignored.
///
/// # Example
///
/// ```rust
/// use istftnet_rs::Hyperparameters;
///
/// let hparams = Hyperparameters::reference_v1();
/// hparams.validate().unwrap();
/// assert_eq!(hparams.generator_hop_size(), hparams.hop_size);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    /// Residual block flavour.
    pub resblock: ResblockKind,
    /// Number of segments per training batch.
    pub batch_size: usize,
    /// Initial learning rate of both optimizers.
    pub learning_rate: f64,
    /// Adam beta1.
    pub adam_b1: f64,
    /// Adam beta2.
    pub adam_b2: f64,
    /// Per-epoch multiplicative learning rate decay.
    pub lr_decay: f64,
    /// Seed for parameter initialization, shuffling and segment sampling.
    pub seed: u64,

    /// Upsampling factor of each generator stage.
    pub upsample_rates: Vec<usize>,
    /// Kernel size of each upsampling convolution.
    pub upsample_kernel_sizes: Vec<usize>,
    /// Channel count after `conv_pre`; halved by every upsampling stage.
    pub upsample_initial_channel: usize,
    /// Kernel sizes of the parallel residual blocks.
    pub resblock_kernel_sizes: Vec<usize>,
    /// Dilations of the parallel residual blocks.
    pub resblock_dilation_sizes: Vec<Vec<usize>>,
    /// FFT size of the generator's output spectrum.
    pub gen_istft_n_fft: usize,
    /// Hop size used to resynthesize the generator's output spectrum.
    pub gen_istft_hop_size: usize,

    /// Training segment length in samples.
    pub segment_size: usize,
    /// Number of mel filters.
    pub num_mels: usize,
    /// FFT size of the mel analysis.
    pub n_fft: usize,
    /// Hop size of the mel analysis.
    pub hop_size: usize,
    /// Window size of the mel analysis.
    pub win_size: usize,
    /// Audio sampling rate in Hz.
    pub sampling_rate: u32,
    /// Lowest mel filter edge in Hz.
    pub fmin: f64,
    /// Highest mel filter edge in Hz for conditioning and display mels.
    pub fmax: f64,
    /// Highest mel filter edge for the reconstruction loss; `null` means Nyquist.
    #[serde(default)]
    pub fmax_for_loss: Option<f64>,
    /// Data loader worker threads.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// AdamW epsilon.
    #[serde(default = "default_adam_eps")]
    pub adam_eps: f64,
    /// AdamW decoupled weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Multiplier of the mel reconstruction term in the generator loss.
    #[serde(default = "default_mel_loss_weight")]
    pub mel_loss_weight: f64,
    /// Multiplier of the feature-matching terms in the generator loss.
    #[serde(default = "default_feature_matching_weight")]
    pub feature_matching_weight: f64,
    /// Number of leading validation batches that emit audio and figures.
    #[serde(default = "default_qualitative_batches")]
    pub qualitative_batches: usize,
    /// Periods of the multi-period discriminator.
    #[serde(default = "default_mpd_periods")]
    pub mpd_periods: Vec<usize>,
    /// Output channels of each strided (k, 1) convolution in a period discriminator.
    #[serde(default = "default_mpd_channels")]
    pub mpd_channels: Vec<usize>,
    /// Output channels of the seven convolutions in a scale discriminator.
    #[serde(default = "default_msd_channels")]
    pub msd_channels: Vec<usize>,
    /// Groups of the seven convolutions in a scale discriminator.
    #[serde(default = "default_msd_groups")]
    pub msd_groups: Vec<usize>,
}

fn default_num_workers() -> usize {
    4
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_mel_loss_weight() -> f64 {
    45.0
}

fn default_feature_matching_weight() -> f64 {
    1.0
}

fn default_qualitative_batches() -> usize {
    5
}

fn default_mpd_periods() -> Vec<usize> {
    vec![2, 3, 5, 7, 11]
}

fn default_mpd_channels() -> Vec<usize> {
    vec![32, 128, 512, 1024, 1024]
}

fn default_msd_channels() -> Vec<usize> {
    vec![128, 128, 256, 512, 1024, 1024, 1024]
}

fn default_msd_groups() -> Vec<usize> {
    vec![1, 4, 16, 16, 16, 16, 1]
}

/// Number of convolutions in a scale discriminator.
pub const MSD_LAYERS: usize = 7;

impl Hyperparameters {
    /// Load hyperparameters from a JSON file and validate them.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, lacks a
    /// required field, or fails [`Hyperparameters::validate`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let hparams: Self = serde_json::from_str(&content)?;
        hparams.validate()?;
        Ok(hparams)
    }

    /// Write hyperparameters to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// The published iSTFTNet V1 configuration for 22.05 kHz LJSpeech.
    #[must_use]
    pub fn reference_v1() -> Self {
        Self {
            resblock: ResblockKind::One,
            batch_size: 16,
            learning_rate: 0.0002,
            adam_b1: 0.8,
            adam_b2: 0.99,
            lr_decay: 0.999,
            seed: 1234,
            upsample_rates: vec![8, 8],
            upsample_kernel_sizes: vec![16, 16],
            upsample_initial_channel: 512,
            resblock_kernel_sizes: vec![3, 7, 11],
            resblock_dilation_sizes: vec![vec![1, 3, 5], vec![1, 3, 5], vec![1, 3, 5]],
            gen_istft_n_fft: 16,
            gen_istft_hop_size: 4,
            segment_size: 8192,
            num_mels: 80,
            n_fft: 1024,
            hop_size: 256,
            win_size: 1024,
            sampling_rate: 22050,
            fmin: 0.0,
            fmax: 8000.0,
            fmax_for_loss: None,
            num_workers: default_num_workers(),
            adam_eps: default_adam_eps(),
            weight_decay: default_weight_decay(),
            mel_loss_weight: default_mel_loss_weight(),
            feature_matching_weight: default_feature_matching_weight(),
            qualitative_batches: default_qualitative_batches(),
            mpd_periods: default_mpd_periods(),
            mpd_channels: default_mpd_channels(),
            msd_channels: default_msd_channels(),
            msd_groups: default_msd_groups(),
        }
    }

    /// Upper mel edge used for the reconstruction loss.
    #[must_use]
    pub fn loss_fmax(&self) -> f64 {
        self.fmax_for_loss
            .unwrap_or(f64::from(self.sampling_rate) / 2.0)
    }

    /// Samples produced per conditioning frame by the generator.
    #[must_use]
    pub fn generator_hop_size(&self) -> usize {
        self.upsample_rates
            .iter()
            .fold(self.gen_istft_hop_size, |hop, &u| hop.saturating_mul(u))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`VocoderError::Config`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, msg: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(VocoderError::Config(msg.into()))
            }
        }

        check(self.batch_size > 0, "batch_size must be > 0")?;
        check(self.learning_rate > 0.0, "learning_rate must be > 0")?;
        check(
            (0.0..1.0).contains(&self.adam_b1) && (0.0..1.0).contains(&self.adam_b2),
            "adam_b1 and adam_b2 must be in [0, 1)",
        )?;
        check(
            self.lr_decay > 0.0 && self.lr_decay <= 1.0,
            "lr_decay must be in (0, 1]",
        )?;
        check(self.adam_eps > 0.0, "adam_eps must be > 0")?;
        check(self.weight_decay >= 0.0, "weight_decay must be >= 0")?;

        check(!self.upsample_rates.is_empty(), "upsample_rates must not be empty")?;
        check(
            self.upsample_rates.len() == self.upsample_kernel_sizes.len(),
            "upsample_rates and upsample_kernel_sizes must have the same length",
        )?;
        for (&u, &k) in self.upsample_rates.iter().zip(&self.upsample_kernel_sizes) {
            check(u > 0, "upsample_rates must be > 0")?;
            check(
                k >= u && (k - u) % 2 == 0,
                "each upsample kernel size must be >= its rate with an even difference",
            )?;
        }
        let channel_divisor = u32::try_from(self.upsample_rates.len())
            .ok()
            .and_then(|stages| 1usize.checked_shl(stages))
            .ok_or_else(|| {
                VocoderError::Config(format!(
                    "{} upsample stages halve upsample_initial_channel past zero",
                    self.upsample_rates.len()
                ))
            })?;
        check(
            self.upsample_initial_channel % channel_divisor == 0
                && self.upsample_initial_channel / channel_divisor > 0,
            "upsample_initial_channel must be divisible by 2^len(upsample_rates)",
        )?;
        check(
            !self.resblock_kernel_sizes.is_empty(),
            "resblock_kernel_sizes must not be empty",
        )?;
        check(
            self.resblock_kernel_sizes.len() == self.resblock_dilation_sizes.len(),
            "resblock_kernel_sizes and resblock_dilation_sizes must have the same length",
        )?;
        check(
            self.resblock_dilation_sizes.iter().all(|d| !d.is_empty()),
            "resblock_dilation_sizes entries must not be empty",
        )?;
        check(
            self.gen_istft_n_fft >= 2 && self.gen_istft_n_fft % 2 == 0,
            "gen_istft_n_fft must be even and >= 2",
        )?;
        check(
            self.gen_istft_hop_size > 0 && self.gen_istft_hop_size <= self.gen_istft_n_fft,
            "gen_istft_hop_size must be in (0, gen_istft_n_fft]",
        )?;

        check(self.num_mels > 0, "num_mels must be > 0")?;
        check(self.hop_size > 0, "hop_size must be > 0")?;
        check(
            self.win_size > 0 && self.win_size <= self.n_fft,
            "win_size must be in (0, n_fft]",
        )?;
        check(self.hop_size <= self.n_fft, "hop_size must be <= n_fft")?;
        check(
            self.segment_size > self.n_fft && self.segment_size % self.hop_size == 0,
            "segment_size must exceed n_fft and be a multiple of hop_size",
        )?;
        check(
            self.generator_hop_size() == self.hop_size,
            "prod(upsample_rates) * gen_istft_hop_size must equal hop_size",
        )?;
        check(self.sampling_rate > 0, "sampling_rate must be > 0")?;
        let nyquist = f64::from(self.sampling_rate) / 2.0;
        check(
            self.fmin >= 0.0 && self.fmin < self.fmax && self.fmax <= nyquist,
            "fmin/fmax must satisfy 0 <= fmin < fmax <= sampling_rate / 2",
        )?;
        check(
            self.loss_fmax() > self.fmin && self.loss_fmax() <= nyquist,
            "fmax_for_loss must satisfy fmin < fmax_for_loss <= sampling_rate / 2",
        )?;

        check(self.mel_loss_weight >= 0.0, "mel_loss_weight must be >= 0")?;
        check(
            self.feature_matching_weight >= 0.0,
            "feature_matching_weight must be >= 0",
        )?;
        check(
            !self.mpd_periods.is_empty() && self.mpd_periods.iter().all(|&p| p > 0),
            "mpd_periods must be non-empty and positive",
        )?;
        check(
            !self.mpd_channels.is_empty() && self.mpd_channels.iter().all(|&c| c > 0),
            "mpd_channels must be non-empty and positive",
        )?;
        check(
            self.msd_channels.len() == MSD_LAYERS && self.msd_groups.len() == MSD_LAYERS,
            "msd_channels and msd_groups must have 7 entries",
        )?;
        let mut in_channels = 1;
        for (&out, &groups) in self.msd_channels.iter().zip(&self.msd_groups) {
            check(
                groups > 0 && in_channels % groups == 0 && out % groups == 0,
                "msd_groups must divide the input and output channels of each layer",
            )?;
            in_channels = out;
        }

        Ok(())
    }
}

/// Options of one training run, mirroring the `train` command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Directory directly containing the `.wav` files.
    pub input_wavs_dir: PathBuf,
    /// Directory of `.npy` conditioning mels used when fine-tuning.
    pub input_mels_dir: PathBuf,
    /// File list of training utterances.
    pub input_training_file: PathBuf,
    /// File list of validation utterances.
    pub input_validation_file: PathBuf,
    /// Checkpoint and log directory.
    pub checkpoint_path: PathBuf,
    /// Epoch index at which training stops (exclusive).
    pub training_epochs: i64,
    /// Condition on precomputed mels instead of mels of the ground truth.
    pub fine_tuning: bool,
    /// Steps between console log lines.
    pub stdout_interval: u64,
    /// Steps between checkpoint pairs.
    pub checkpoint_interval: u64,
    /// Steps between scalar summaries.
    pub summary_interval: u64,
    /// Steps between validation passes.
    pub validation_interval: u64,
    /// Render a progress bar per epoch.
    pub progress: bool,
    /// Fail the step when a loss total is NaN or infinite.
    pub check_finite: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            input_wavs_dir: PathBuf::from("LJSpeech-1.1/wavs"),
            input_mels_dir: PathBuf::from("ft_dataset"),
            input_training_file: PathBuf::from("LJSpeech-1.1/training.txt"),
            input_validation_file: PathBuf::from("LJSpeech-1.1/validation.txt"),
            checkpoint_path: PathBuf::from("cp_hifigan"),
            training_epochs: 3100,
            fine_tuning: false,
            stdout_interval: 5,
            checkpoint_interval: 5000,
            summary_interval: 100,
            validation_interval: 1000,
            progress: true,
            check_finite: true,
        }
    }
}

impl RunOptions {
    /// Validate the run options.
    ///
    /// # Errors
    ///
    /// Returns [`VocoderError::Config`] if an interval is zero.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("stdout_interval", self.stdout_interval),
            ("checkpoint_interval", self.checkpoint_interval),
            ("summary_interval", self.summary_interval),
            ("validation_interval", self.validation_interval),
        ] {
            if value == 0 {
                return Err(VocoderError::Config(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }
}

/// Copy the configuration document into the checkpoint directory as `config_name`.
///
/// Creates `checkpoint_path` if needed. Copying a file onto itself is a no-op.
///
/// # Errors
///
/// Returns an IO error if the directory cannot be created or the copy fails.
pub fn build_env(config: &Path, config_name: &str, checkpoint_path: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(checkpoint_path)?;
    let target = checkpoint_path.join(config_name);
    let same_file = match (config.canonicalize(), target.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if !same_file {
        std::fs::copy(config, &target)?;
    }
    Ok(target)
}

/// Small configuration used by unit tests: 16-sample hop at 1.6 kHz.
#[cfg(test)]
pub(crate) fn test_hparams() -> Hyperparameters {
    let mut h = Hyperparameters::reference_v1();
    h.batch_size = 2;
    h.upsample_rates = vec![2, 2];
    h.upsample_kernel_sizes = vec![4, 4];
    h.upsample_initial_channel = 8;
    h.resblock_kernel_sizes = vec![3, 5];
    h.resblock_dilation_sizes = vec![vec![1, 3], vec![1, 3]];
    h.segment_size = 256;
    h.num_mels = 8;
    h.n_fft = 64;
    h.hop_size = 16;
    h.win_size = 64;
    h.sampling_rate = 1600;
    h.fmax = 800.0;
    h.num_workers = 0;
    h.qualitative_batches = 2;
    h.mpd_periods = vec![2, 3];
    h.mpd_channels = vec![4, 8, 8];
    h.msd_channels = vec![4, 4, 8, 8, 8, 8, 8];
    h.msd_groups = vec![1, 2, 2, 2, 2, 2, 1];
    h
}
