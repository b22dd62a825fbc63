//! iSTFTNet generator: mel spectrogram to magnitude/phase spectrum.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv1d, VarBuilder, VarMap};

use super::{
    conv1d, conv_config, get_padding, leaky_relu, seeded_init, SpectralFrame, SpectralGenerator,
    Trainable, UpsampleConv, LRELU_SLOPE,
};
use crate::audio::reflect_pad_last;
use crate::config::{Hyperparameters, ResblockKind};
use crate::error::Result;

/// Standard deviation of the normal init used for upsampling and residual convolutions.
const INIT_STD: f64 = 0.01;

#[derive(Debug, Clone)]
enum ResBlock {
    /// Pairs of (dilated, undilated) convolutions with a residual connection each.
    One { convs1: Vec<Conv1d>, convs2: Vec<Conv1d> },
    /// One dilated convolution per residual connection.
    Two { convs: Vec<Conv1d> },
}

impl ResBlock {
    fn new(
        kind: ResblockKind,
        channels: usize,
        kernel_size: usize,
        dilations: &[usize],
        vb: &VarBuilder,
    ) -> Result<Self> {
        match kind {
            ResblockKind::One => {
                let convs1 = dilations
                    .iter()
                    .enumerate()
                    .map(|(i, &d)| {
                        let cfg = conv_config(get_padding(kernel_size, d), 1, d, 1);
                        conv1d(channels, channels, kernel_size, cfg, vb.pp(format!("convs1.{i}")))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let convs2 = (0..dilations.len())
                    .map(|i| {
                        let cfg = conv_config(get_padding(kernel_size, 1), 1, 1, 1);
                        conv1d(channels, channels, kernel_size, cfg, vb.pp(format!("convs2.{i}")))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::One { convs1, convs2 })
            }
            ResblockKind::Two => {
                let convs = dilations
                    .iter()
                    .enumerate()
                    .map(|(i, &d)| {
                        let cfg = conv_config(get_padding(kernel_size, d), 1, d, 1);
                        conv1d(channels, channels, kernel_size, cfg, vb.pp(format!("convs.{i}")))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::Two { convs })
            }
        }
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        match self {
            Self::One { convs1, convs2 } => {
                for (c1, c2) in convs1.iter().zip(convs2) {
                    let xt = c1.forward(&leaky_relu(&x, LRELU_SLOPE)?)?;
                    let xt = c2.forward(&leaky_relu(&xt, LRELU_SLOPE)?)?;
                    x = (xt + x)?;
                }
            }
            Self::Two { convs } => {
                for c in convs {
                    let xt = c.forward(&leaky_relu(&x, LRELU_SLOPE)?)?;
                    x = (xt + x)?;
                }
            }
        }
        Ok(x)
    }
}

/// Mel-conditioned generator predicting an `gen_istft_n_fft` spectrum.
///
/// `conv_pre` lifts the mel to `upsample_initial_channel` channels; each
/// stage halves the channels while upsampling in time, then averages a bank
/// of residual blocks with different receptive fields. `conv_post` emits
/// `n_fft + 2` channels: the first half becomes `exp` magnitude, the second
/// `sin` phase.
pub struct IstftGenerator {
    varmap: VarMap,
    conv_pre: Conv1d,
    ups: Vec<UpsampleConv>,
    resblocks: Vec<ResBlock>,
    conv_post: Conv1d,
    num_kernels: usize,
    bins: usize,
    training: bool,
}

impl IstftGenerator {
    /// Build a generator with parameters seeded from `hparams.seed`.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be created.
    pub fn new(hparams: &Hyperparameters, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let initial = hparams.upsample_initial_channel;
        let conv_pre = conv1d(hparams.num_mels, initial, 7, conv_config(3, 1, 1, 1), vb.pp("conv_pre"))?;

        let mut ups = Vec::with_capacity(hparams.upsample_rates.len());
        let mut resblocks = Vec::new();
        let mut channels = initial;
        for (i, (&u, &k)) in hparams
            .upsample_rates
            .iter()
            .zip(&hparams.upsample_kernel_sizes)
            .enumerate()
        {
            let out = initial >> (i + 1);
            ups.push(UpsampleConv::new(channels, out, k, u, (k - u) / 2, vb.pp(format!("ups.{i}")))?);
            channels = out;
            for (j, (&rk, rd)) in hparams
                .resblock_kernel_sizes
                .iter()
                .zip(&hparams.resblock_dilation_sizes)
                .enumerate()
            {
                let index = i * hparams.resblock_kernel_sizes.len() + j;
                resblocks.push(ResBlock::new(
                    hparams.resblock,
                    channels,
                    rk,
                    rd,
                    &vb.pp(format!("resblocks.{index}")),
                )?);
            }
        }

        let n_fft = hparams.gen_istft_n_fft;
        let conv_post = conv1d(channels, n_fft + 2, 7, conv_config(3, 1, 1, 1), vb.pp("conv_post"))?;

        seeded_init(&varmap, hparams.seed, |name| {
            (name.starts_with("ups.") || name.starts_with("resblocks.")).then_some(INIT_STD)
        })?;

        Ok(Self {
            varmap,
            conv_pre,
            ups,
            resblocks,
            conv_post,
            num_kernels: hparams.resblock_kernel_sizes.len(),
            bins: n_fft / 2 + 1,
            training: true,
        })
    }
}

impl Trainable for IstftGenerator {
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

impl SpectralGenerator for IstftGenerator {
    fn forward(&self, mel: &Tensor) -> Result<SpectralFrame> {
        let mut x = self.conv_pre.forward(mel)?;
        for (i, up) in self.ups.iter().enumerate() {
            x = up.forward(&leaky_relu(&x, LRELU_SLOPE)?)?;
            let bank = &self.resblocks[i * self.num_kernels..(i + 1) * self.num_kernels];
            let mut sum: Option<Tensor> = None;
            for block in bank {
                let y = block.forward(&x)?;
                sum = Some(match sum {
                    Some(s) => (s + y)?,
                    None => y,
                });
            }
            if let Some(sum) = sum {
                #[allow(clippy::cast_precision_loss)]
                let scale = 1.0 / self.num_kernels as f64;
                x = (sum * scale)?;
            }
        }
        // torch's default slope before the output projection
        let x = leaky_relu(&x, 0.01)?;
        let x = reflect_pad_last(&x, 1, 0)?;
        let x = self.conv_post.forward(&x)?;

        let magnitude = x.narrow(1, 0, self.bins)?.exp()?;
        let phase = x.narrow(1, self.bins, self.bins)?.sin()?;
        Ok(SpectralFrame::new(magnitude, phase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Synthesizer;
    use crate::config::test_hparams as tiny_hparams;
    use crate::models::parameter_count;

    #[test]
    fn test_output_shapes() {
        let h = tiny_hparams();
        let generator = IstftGenerator::new(&h, &Device::Cpu).unwrap();
        let mel = Tensor::zeros((2, 8, 16), DType::F32, &Device::Cpu).unwrap();
        let frame = generator.forward(&mel).unwrap();
        // 16 frames * 4 upsampling + 1 reflect pad
        assert_eq!(frame.magnitude.dims(), &[2, 9, 65]);
        assert_eq!(frame.phase.dims(), &[2, 9, 65]);

        let synth = Synthesizer::new(16, 4, 16, &Device::Cpu).unwrap();
        let audio = synth.synthesize(&frame).unwrap();
        assert_eq!(audio.dims(), &[2, 1, 256]);
    }

    #[test]
    fn test_magnitude_positive_and_phase_bounded() {
        let h = tiny_hparams();
        let generator = IstftGenerator::new(&h, &Device::Cpu).unwrap();
        let mel = Tensor::randn(0f32, 1.0, (1, 8, 6), &Device::Cpu).unwrap();
        let frame = generator.forward(&mel).unwrap();
        let mag = frame.magnitude.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let phase = frame.phase.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(mag.iter().all(|&m| m > 0.0));
        assert!(phase.iter().all(|&p| (-1.0..=1.0).contains(&p)));
    }

    #[test]
    fn test_parameter_names_and_seeding() {
        let mut h = tiny_hparams();
        let a = IstftGenerator::new(&h, &Device::Cpu).unwrap();
        let b = IstftGenerator::new(&h, &Device::Cpu).unwrap();
        h.seed += 1;
        let c = IstftGenerator::new(&h, &Device::Cpu).unwrap();

        let names: Vec<String> = a.parameters().unwrap().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"conv_pre.weight".to_string()));
        assert!(names.contains(&"ups.1.weight".to_string()));
        assert!(names.contains(&"resblocks.3.convs2.1.bias".to_string()));
        assert!(names.contains(&"conv_post.weight".to_string()));

        let w = |g: &IstftGenerator| {
            g.state_dict().unwrap()["conv_post.weight"]
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        };
        assert_eq!(w(&a), w(&b));
        assert_ne!(w(&a), w(&c));
        assert!(parameter_count(&a).unwrap() > 0);
    }

    #[test]
    fn test_resblock_two_variant() {
        let mut h = tiny_hparams();
        h.resblock = ResblockKind::Two;
        let generator = IstftGenerator::new(&h, &Device::Cpu).unwrap();
        let names: Vec<String> = generator.parameters().unwrap().into_iter().map(|(n, _)| n).collect();
        assert!(names.iter().any(|n| n.starts_with("resblocks.0.convs.1")));
        let mel = Tensor::zeros((1, 8, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(generator.forward(&mel).unwrap().magnitude.dims(), &[1, 9, 17]);
    }
}
