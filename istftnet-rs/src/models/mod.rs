//! Generator and discriminator networks behind capability traits.
//!
//! The training loop only sees [`SpectralGenerator`] and [`Discriminator`]
//! trait objects; the concrete iSTFTNet generator and the HiFi-GAN
//! multi-period / multi-scale ensembles live in the submodules.
//!
//! Every network owns one [`VarMap`]. Parameters are named by their module
//! path (`ups.0.weight`, `discriminators.2.convs.4.bias`, ...) and that name
//! is the key used by optimizers and checkpoints.

mod generator;
mod mpd;
mod msd;

use std::collections::HashMap;

pub use generator::IstftGenerator;
pub use mpd::MultiPeriodDiscriminator;
pub use msd::MultiScaleDiscriminator;

use candle_core::{DType, Tensor, Var};
use candle_nn::{Conv1d, Conv1dConfig, VarBuilder, VarMap};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub use crate::audio::stft::SpectralFrame;
use crate::error::{Result, VocoderError};

/// Negative slope of the leaky ReLUs between layers.
pub const LRELU_SLOPE: f64 = 0.1;

/// A network with named, checkpointable parameters and a train/eval mode.
pub trait Trainable {
    /// The variable store holding every parameter of the network.
    fn varmap(&self) -> &VarMap;

    /// Whether the network is in training mode.
    fn is_training(&self) -> bool;

    /// Switch between training and evaluation mode.
    fn set_training(&mut self, training: bool);

    /// Enter training mode.
    fn train(&mut self) {
        self.set_training(true);
    }

    /// Enter evaluation mode.
    fn eval(&mut self) {
        self.set_training(false);
    }

    /// Tunable parameters, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable store lock is poisoned.
    fn parameters(&self) -> Result<Vec<(String, Var)>> {
        named_parameters(self.varmap())
    }

    /// Snapshot of every parameter value, detached from the graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable store lock is poisoned.
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        Ok(self
            .parameters()?
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().detach()))
            .collect())
    }

    /// Overwrite every parameter from a snapshot.
    ///
    /// The snapshot must hold exactly the network's parameter names with
    /// matching shapes.
    ///
    /// # Errors
    ///
    /// Returns an error on a missing, unexpected or mis-shaped tensor.
    fn load_state_dict(&self, state: &HashMap<String, Tensor>) -> Result<()> {
        let params = self.parameters()?;
        if let Some(extra) = state
            .keys()
            .find(|k| !params.iter().any(|(name, _)| name == *k))
        {
            return Err(VocoderError::Checkpoint(format!("unexpected parameter {extra}")));
        }
        for (name, var) in params {
            let value = state
                .get(&name)
                .ok_or_else(|| VocoderError::Checkpoint(format!("missing parameter {name}")))?;
            if value.dims() != var.dims() {
                return Err(VocoderError::Checkpoint(format!(
                    "parameter {name} has shape {:?}, expected {:?}",
                    value.dims(),
                    var.dims()
                )));
            }
            var.set(&value.to_device(var.device())?.to_dtype(var.dtype())?)?;
        }
        Ok(())
    }
}

/// Maps a mel spectrogram `[batch, num_mels, frames]` to a [`SpectralFrame`].
pub trait SpectralGenerator: Trainable {
    /// Run the generator.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    fn forward(&self, mel: &Tensor) -> Result<SpectralFrame>;
}

/// Logits and intermediate activations of an ensemble for a real and a
/// generated waveform, one entry per sub-discriminator.
#[derive(Debug, Clone, Default)]
pub struct DiscriminatorOutputs {
    /// Logits on the ground-truth waveform.
    pub real_logits: Vec<Tensor>,
    /// Logits on the generated waveform.
    pub generated_logits: Vec<Tensor>,
    /// Feature maps on the ground-truth waveform.
    pub real_features: Vec<Vec<Tensor>>,
    /// Feature maps on the generated waveform.
    pub generated_features: Vec<Vec<Tensor>>,
}

impl DiscriminatorOutputs {
    pub(crate) fn push(&mut self, real: (Tensor, Vec<Tensor>), generated: (Tensor, Vec<Tensor>)) {
        self.real_logits.push(real.0);
        self.real_features.push(real.1);
        self.generated_logits.push(generated.0);
        self.generated_features.push(generated.1);
    }
}

/// An ensemble judging waveforms `[batch, 1, samples]`.
pub trait Discriminator: Trainable {
    /// Score a real and a generated waveform.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    fn forward(&self, real: &Tensor, generated: &Tensor) -> Result<DiscriminatorOutputs>;
}

/// Parameters of a variable store sorted by name.
///
/// # Errors
///
/// Returns an error if the variable store lock is poisoned.
pub fn named_parameters(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| VocoderError::Model(format!("variable store poisoned: {e}")))?;
    let mut params: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(params)
}

/// Total number of scalar parameters in a network.
///
/// # Errors
///
/// Returns an error if the variable store lock is poisoned.
pub fn parameter_count(model: &dyn Trainable) -> Result<usize> {
    Ok(model.parameters()?.iter().map(|(_, v)| v.elem_count()).sum())
}

/// Leaky ReLU for slopes in `[0, 1)`.
pub(crate) fn leaky_relu(x: &Tensor, slope: f64) -> Result<Tensor> {
    Ok(x.maximum(&(x * slope)?)?)
}

/// "Same"-style padding of a dilated convolution.
pub(crate) fn get_padding(kernel_size: usize, dilation: usize) -> usize {
    (kernel_size * dilation - dilation) / 2
}

pub(crate) fn conv1d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    cfg: Conv1dConfig,
    vb: VarBuilder,
) -> Result<Conv1d> {
    Ok(candle_nn::conv1d(in_channels, out_channels, kernel_size, cfg, vb)?)
}

pub(crate) fn conv_config(padding: usize, stride: usize, dilation: usize, groups: usize) -> Conv1dConfig {
    Conv1dConfig {
        padding,
        stride,
        dilation,
        groups,
        ..Default::default()
    }
}

/// Transposed 1-D convolution expressed as zero insertion plus a regular
/// convolution, so the backward pass only needs `conv1d` gradients.
///
/// With stride `s`, kernel `k` and padding `p`, a `[B, C, T]` input yields
/// `(T - 1) * s + k - 2p` samples, like `ConvTranspose1d`.
#[derive(Debug, Clone)]
pub(crate) struct UpsampleConv {
    weight: Tensor,
    bias: Tensor,
    stride: usize,
    padding: usize,
}

impl UpsampleConv {
    pub(crate) fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if padding + 1 > kernel_size {
            return Err(VocoderError::Model(format!(
                "upsample padding {padding} too large for kernel {kernel_size}"
            )));
        }
        let bound = 1.0 / ((in_channels * kernel_size) as f64).sqrt();
        let init = candle_nn::Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let weight = vb.get_with_hints((out_channels, in_channels, kernel_size), "weight", init)?;
        let bias = vb.get_with_hints(out_channels, "bias", init)?;
        Ok(Self {
            weight,
            bias,
            stride,
            padding,
        })
    }

    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, channels, frames) = x.dims3()?;
        let s = self.stride;
        let stuffed = if s == 1 {
            x.clone()
        } else {
            x.unsqueeze(3)?
                .pad_with_zeros(3, 0, s - 1)?
                .reshape((batch, channels, frames * s))?
                .narrow(2, 0, (frames - 1) * s + 1)?
        };
        let k = self.weight.dim(2)?;
        let y = stuffed.conv1d(&self.weight, k - 1 - self.padding, 1, 1, 1)?;
        Ok(y.broadcast_add(&self.bias.reshape((1, (), 1))?)?)
    }
}

/// Overwrite every parameter of `varmap` with seeded values.
///
/// Weights use PyTorch's default uniform bound `1 / sqrt(fan_in)` unless
/// `normal_std` returns a standard deviation for that name; biases use the
/// bound of their sibling weight.
pub(crate) fn seeded_init(
    varmap: &VarMap,
    seed: u64,
    normal_std: impl Fn(&str) -> Option<f64>,
) -> Result<()> {
    let params = named_parameters(varmap)?;
    let fan_in = |name: &str| -> usize {
        params
            .iter()
            .find(|(n, _)| n == name)
            .map_or(1, |(_, v)| v.dims().iter().skip(1).product::<usize>().max(1))
    };
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    for (name, var) in &params {
        let count = var.elem_count();
        #[allow(clippy::cast_precision_loss)]
        let values: Vec<f32> = if let Some(weight) = name.strip_suffix("bias") {
            let bound = 1.0 / (fan_in(&format!("{weight}weight")) as f64).sqrt();
            uniform(&mut rng, count, bound)
        } else if let Some(std) = normal_std(name) {
            normal(&mut rng, count, std)
        } else {
            let bound = 1.0 / (fan_in(name) as f64).sqrt();
            uniform(&mut rng, count, bound)
        };
        let value = Tensor::from_vec(values, var.dims(), var.device())?.to_dtype(DType::F32)?;
        var.set(&value)?;
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn uniform(rng: &mut ChaCha8Rng, count: usize, bound: f64) -> Vec<f32> {
    (0..count)
        .map(|_| rng.gen_range(-bound..bound) as f32)
        .collect()
}

#[allow(clippy::cast_possible_truncation)]
fn normal(rng: &mut ChaCha8Rng, count: usize, std: f64) -> Vec<f32> {
    // Box-Muller
    (0..count)
        .map(|_| {
            let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
            let u2: f64 = rng.gen();
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
            (z * std) as f32
        })
        .collect()
}
