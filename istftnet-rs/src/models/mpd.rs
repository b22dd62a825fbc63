//! Multi-period discriminator.
//!
//! Each sub-discriminator folds the waveform into a `[frames, period]` grid
//! and applies `(k, 1)` convolutions along the frame axis. Since such a kernel
//! never mixes columns, the grid is laid out as `period` independent 1-D
//! signals and processed with `conv1d`.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv1d, VarBuilder, VarMap};

use super::{
    conv1d, conv_config, get_padding, leaky_relu, seeded_init, Discriminator,
    DiscriminatorOutputs, Trainable, LRELU_SLOPE,
};
use crate::audio::reflect_pad_last;
use crate::config::Hyperparameters;
use crate::error::Result;

const KERNEL_SIZE: usize = 5;
const STRIDE: usize = 3;

#[derive(Debug, Clone)]
struct PeriodDiscriminator {
    period: usize,
    convs: Vec<Conv1d>,
    conv_post: Conv1d,
}

impl PeriodDiscriminator {
    fn new(period: usize, channels: &[usize], vb: &VarBuilder) -> Result<Self> {
        let mut convs = Vec::with_capacity(channels.len());
        let mut in_channels = 1;
        for (i, &out) in channels.iter().enumerate() {
            let stride = if i + 1 == channels.len() { 1 } else { STRIDE };
            let cfg = conv_config(get_padding(KERNEL_SIZE, 1), stride, 1, 1);
            convs.push(conv1d(in_channels, out, KERNEL_SIZE, cfg, vb.pp(format!("convs.{i}")))?);
            in_channels = out;
        }
        let conv_post = conv1d(in_channels, 1, 3, conv_config(1, 1, 1, 1), vb.pp("conv_post"))?;
        Ok(Self {
            period,
            convs,
            conv_post,
        })
    }

    /// Logits `[batch, frames * period]` and per-layer activations
    /// `[batch * period, channels, frames]`.
    fn forward(&self, x: &Tensor) -> Result<(Tensor, Vec<Tensor>)> {
        let (batch, _, samples) = x.dims3()?;
        let p = self.period;
        let (x, samples) = if samples % p == 0 {
            (x.clone(), samples)
        } else {
            let n_pad = p - samples % p;
            (reflect_pad_last(x, 0, n_pad)?, samples + n_pad)
        };
        let mut x = x
            .reshape((batch, samples / p, p))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch * p, 1, samples / p))?;

        let mut fmap = Vec::with_capacity(self.convs.len() + 1);
        for conv in &self.convs {
            x = leaky_relu(&conv.forward(&x)?, LRELU_SLOPE)?;
            fmap.push(x.clone());
        }
        let x = self.conv_post.forward(&x)?;
        fmap.push(x.clone());
        let logits = x.reshape((batch, ()))?;
        Ok((logits, fmap))
    }
}

/// Ensemble of period discriminators (periods 2, 3, 5, 7, 11 by default).
pub struct MultiPeriodDiscriminator {
    varmap: VarMap,
    discriminators: Vec<PeriodDiscriminator>,
    training: bool,
}

impl MultiPeriodDiscriminator {
    /// Build the ensemble with parameters seeded from `seed`.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be created.
    pub fn new(hparams: &Hyperparameters, seed: u64, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let discriminators = hparams
            .mpd_periods
            .iter()
            .enumerate()
            .map(|(i, &period)| {
                PeriodDiscriminator::new(
                    period,
                    &hparams.mpd_channels,
                    &vb.pp(format!("discriminators.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        seeded_init(&varmap, seed, |_| None)?;
        Ok(Self {
            varmap,
            discriminators,
            training: true,
        })
    }
}

impl Trainable for MultiPeriodDiscriminator {
    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

impl Discriminator for MultiPeriodDiscriminator {
    fn forward(&self, real: &Tensor, generated: &Tensor) -> Result<DiscriminatorOutputs> {
        let mut outputs = DiscriminatorOutputs::default();
        for d in &self.discriminators {
            outputs.push(d.forward(real)?, d.forward(generated)?);
        }
        Ok(outputs)
    }
}
