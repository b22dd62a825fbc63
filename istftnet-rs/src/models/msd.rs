//! Multi-scale discriminator: three identical stacks on the raw waveform and
//! on ×2 and ×4 average-pooled copies.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv1d, VarBuilder, VarMap};

use super::{
    conv1d, conv_config, leaky_relu, seeded_init, Discriminator, DiscriminatorOutputs, Trainable,
    LRELU_SLOPE,
};
use crate::config::Hyperparameters;
use crate::error::Result;

const SCALES: usize = 3;
const KERNELS: [usize; 7] = [15, 41, 41, 41, 41, 41, 5];
const STRIDES: [usize; 7] = [1, 2, 2, 4, 4, 1, 1];
const PADDINGS: [usize; 7] = [7, 20, 20, 20, 20, 20, 2];

#[derive(Debug, Clone)]
struct ScaleDiscriminator {
    convs: Vec<Conv1d>,
    conv_post: Conv1d,
}

impl ScaleDiscriminator {
    fn new(channels: &[usize], groups: &[usize], vb: &VarBuilder) -> Result<Self> {
        let mut convs = Vec::with_capacity(channels.len());
        let mut in_channels = 1;
        for (i, (&out, &g)) in channels.iter().zip(groups).enumerate() {
            let cfg = conv_config(PADDINGS[i], STRIDES[i], 1, g);
            convs.push(conv1d(in_channels, out, KERNELS[i], cfg, vb.pp(format!("convs.{i}")))?);
            in_channels = out;
        }
        let conv_post = conv1d(in_channels, 1, 3, conv_config(1, 1, 1, 1), vb.pp("conv_post"))?;
        Ok(Self { convs, conv_post })
    }

    fn forward(&self, x: &Tensor) -> Result<(Tensor, Vec<Tensor>)> {
        let mut x = x.clone();
        let mut fmap = Vec::with_capacity(self.convs.len() + 1);
        for conv in &self.convs {
            x = leaky_relu(&conv.forward(&x)?, LRELU_SLOPE)?;
            fmap.push(x.clone());
        }
        let x = self.conv_post.forward(&x)?;
        fmap.push(x.clone());
        let batch = x.dim(0)?;
        Ok((x.reshape((batch, ()))?, fmap))
    }
}

/// Ensemble of scale discriminators separated by `AvgPool1d(4, 2, padding=2)`.
pub struct MultiScaleDiscriminator {
    varmap: VarMap,
    discriminators: Vec<ScaleDiscriminator>,
    /// `[1, 1, 4]` box filter; zero padding counts toward the mean.
    pool_kernel: Tensor,
    training: bool,
}

impl MultiScaleDiscriminator {
    /// Build the ensemble with parameters seeded from `seed`.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be created.
    pub fn new(hparams: &Hyperparameters, seed: u64, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let discriminators = (0..SCALES)
            .map(|i| {
                ScaleDiscriminator::new(
                    &hparams.msd_channels,
                    &hparams.msd_groups,
                    &vb.pp(format!("discriminators.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        seeded_init(&varmap, seed, |_| None)?;
        Ok(Self {
            varmap,
            discriminators,
            pool_kernel: Tensor::full(0.25f32, (1, 1, 4), device)?,
            training: true,
        })
    }

    fn mean_pool(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.conv1d(&self.pool_kernel, 2, 2, 1, 1)?)
    }
}

impl Trainable for MultiScaleDiscriminator {
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

impl Discriminator for MultiScaleDiscriminator {
    fn forward(&self, real: &Tensor, generated: &Tensor) -> Result<DiscriminatorOutputs> {
        let mut outputs = DiscriminatorOutputs::default();
        let mut y = real.clone();
        let mut y_hat = generated.clone();
        for (i, d) in self.discriminators.iter().enumerate() {
            if i != 0 {
                y = self.mean_pool(&y)?;
                y_hat = self.mean_pool(&y_hat)?;
            }
            outputs.push(d.forward(&y)?, d.forward(&y_hat)?);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Hyperparameters {
        let mut h = Hyperparameters::reference_v1();
        h.msd_channels = vec![4, 4, 8, 8, 8, 8, 8];
        h.msd_groups = vec![1, 2, 2, 2, 2, 2, 1];
        h
    }

    #[test]
    fn test_three_scales() {
        let msd = MultiScaleDiscriminator::new(&small(), 5, &Device::Cpu).unwrap();
        let real = Tensor::randn(0f32, 1.0, (2, 1, 256), &Device::Cpu).unwrap();
        let fake = Tensor::randn(0f32, 1.0, (2, 1, 256), &Device::Cpu).unwrap();
        let out = msd.forward(&real, &fake).unwrap();
        assert_eq!(out.real_logits.len(), 3);
        assert_eq!(out.real_features[0].len(), 8);
        // strides 1, 2, 2, 4, 4: 256 -> 128 -> 64 -> 16 -> 4
        assert_eq!(out.real_logits[0].dims(), &[2, 4]);
        // pooled once: 129 samples
        assert_eq!(out.real_features[1][0].dims(), &[2, 4, 129]);
    }

    #[test]
    fn test_mean_pool_matches_avg_pool() {
        let msd = MultiScaleDiscriminator::new(&small(), 5, &Device::Cpu).unwrap();
        let x = Tensor::new(&[[[1f32, 2.0, 3.0, 4.0, 5.0, 6.0]]], &Device::Cpu).unwrap();
        let y = msd.mean_pool(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // zero-padded by 2: [0 0 1 2 3 4 5 6 0 0], windows of 4 every 2
        assert_eq!(y, vec![0.75, 2.5, 4.5, 2.75]);
    }

    #[test]
    fn test_grouped_parameter_shapes() {
        let msd = MultiScaleDiscriminator::new(&small(), 5, &Device::Cpu).unwrap();
        let state = msd.state_dict().unwrap();
        assert_eq!(state["discriminators.0.convs.1.weight"].dims(), &[4, 2, 41]);
        assert_eq!(state["discriminators.2.convs.6.weight"].dims(), &[8, 8, 5]);
    }
}
