//! Adversarial, feature-matching and mel reconstruction losses.
//!
//! Least-squares GAN objectives over every sub-discriminator of an
//! ensemble, L1 feature matching over their activations and an L1 log-mel
//! distance. [`LossComposer`] combines them into the discriminator total and
//! the generator total that the training step backpropagates separately.

use candle_core::Tensor;

use crate::config::Hyperparameters;
use crate::error::{Result, VocoderError};
use crate::models::DiscriminatorOutputs;

fn sum_scalars(terms: impl IntoIterator<Item = Result<Tensor>>) -> Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for term in terms {
        let term = term?;
        total = Some(match total {
            Some(t) => (t + term)?,
            None => term,
        });
    }
    total.ok_or_else(|| VocoderError::Training("no discriminator outputs to score".into()))
}

/// `Σ_d mean((1 - D(y))²) + mean(D(ŷ)²)` over sub-discriminators.
///
/// # Errors
///
/// Returns an error if the lists are empty or differ in length.
pub fn discriminator_loss(real_logits: &[Tensor], generated_logits: &[Tensor]) -> Result<Tensor> {
    if real_logits.len() != generated_logits.len() {
        return Err(VocoderError::Training(format!(
            "{} real logits vs {} generated logits",
            real_logits.len(),
            generated_logits.len()
        )));
    }
    sum_scalars(real_logits.iter().zip(generated_logits).map(|(dr, dg)| {
        let r_loss = dr.affine(-1.0, 1.0)?.sqr()?.mean_all()?;
        let g_loss = dg.sqr()?.mean_all()?;
        Ok((r_loss + g_loss)?)
    }))
}

/// `Σ_d mean((1 - D(ŷ))²)` over sub-discriminators.
///
/// # Errors
///
/// Returns an error if the list is empty.
pub fn generator_loss(generated_logits: &[Tensor]) -> Result<Tensor> {
    sum_scalars(
        generated_logits
            .iter()
            .map(|dg| Ok(dg.affine(-1.0, 1.0)?.sqr()?.mean_all()?)),
    )
}

/// `Σ_d Σ_l mean|F_l(y) - F_l(ŷ)|`, with the real activations treated as constants.
///
/// # Errors
///
/// Returns an error if the feature lists are empty or mismatched.
pub fn feature_loss(real_features: &[Vec<Tensor>], generated_features: &[Vec<Tensor>]) -> Result<Tensor> {
    if real_features.len() != generated_features.len() {
        return Err(VocoderError::Training("feature map lists differ in length".into()));
    }
    sum_scalars(
        real_features
            .iter()
            .zip(generated_features)
            .flat_map(|(dr, dg)| dr.iter().zip(dg))
            .map(|(rl, gl)| Ok((rl.detach() - gl)?.abs()?.mean_all()?)),
    )
}

/// Mean absolute difference of two mel spectrograms.
///
/// # Errors
///
/// Returns an error if the shapes differ.
pub fn mel_loss(target: &Tensor, generated: &Tensor) -> Result<Tensor> {
    if target.dims() != generated.dims() {
        return Err(VocoderError::Training(format!(
            "mel target {:?} and generated mel {:?} differ in shape",
            target.dims(),
            generated.dims()
        )));
    }
    Ok((target - generated)?.abs()?.mean_all()?)
}

/// Discriminator objective of one step.
#[derive(Debug, Clone)]
pub struct DiscriminatorLoss {
    /// Multi-period ensemble term.
    pub mpd: Tensor,
    /// Multi-scale ensemble term.
    pub msd: Tensor,
    /// `mpd + msd`, backpropagated into the discriminators.
    pub total: Tensor,
}

/// Generator objective of one step.
#[derive(Debug, Clone)]
pub struct GeneratorLoss {
    /// Adversarial term against the multi-period ensemble.
    pub adversarial_mpd: Tensor,
    /// Adversarial term against the multi-scale ensemble.
    pub adversarial_msd: Tensor,
    /// Feature matching against the multi-period ensemble.
    pub feature_mpd: Tensor,
    /// Feature matching against the multi-scale ensemble.
    pub feature_msd: Tensor,
    /// Unscaled L1 mel error.
    pub mel: Tensor,
    /// Weighted sum, backpropagated into the generator.
    pub total: Tensor,
}

/// Host-side values of every loss term of a step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossTerms {
    /// Discriminator total.
    pub discriminator_total: f32,
    /// Multi-period discriminator term.
    pub discriminator_mpd: f32,
    /// Multi-scale discriminator term.
    pub discriminator_msd: f32,
    /// Generator total.
    pub generator_total: f32,
    /// Generator adversarial term, multi-period.
    pub adversarial_mpd: f32,
    /// Generator adversarial term, multi-scale.
    pub adversarial_msd: f32,
    /// Feature matching, multi-period.
    pub feature_mpd: f32,
    /// Feature matching, multi-scale.
    pub feature_msd: f32,
    /// Unscaled L1 mel error.
    pub mel_error: f32,
}

impl LossTerms {
    /// Read every term back to the host.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor is not an `f32` scalar.
    pub fn collect(d: &DiscriminatorLoss, g: &GeneratorLoss) -> Result<Self> {
        let v = |t: &Tensor| -> Result<f32> { Ok(t.to_scalar::<f32>()?) };
        Ok(Self {
            discriminator_total: v(&d.total)?,
            discriminator_mpd: v(&d.mpd)?,
            discriminator_msd: v(&d.msd)?,
            generator_total: v(&g.total)?,
            adversarial_mpd: v(&g.adversarial_mpd)?,
            adversarial_msd: v(&g.adversarial_msd)?,
            feature_mpd: v(&g.feature_mpd)?,
            feature_msd: v(&g.feature_msd)?,
            mel_error: v(&g.mel)?,
        })
    }
}

/// Weighted combination of the individual loss terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossComposer {
    mel_weight: f64,
    feature_weight: f64,
}

impl LossComposer {
    /// Composer with explicit weights.
    #[must_use]
    pub fn new(mel_weight: f64, feature_weight: f64) -> Self {
        Self {
            mel_weight,
            feature_weight,
        }
    }

    /// Composer using `mel_loss_weight` and `feature_matching_weight`.
    #[must_use]
    pub fn from_hparams(hparams: &Hyperparameters) -> Self {
        Self::new(hparams.mel_loss_weight, hparams.feature_matching_weight)
    }

    /// Weight of the mel reconstruction term.
    #[must_use]
    pub fn mel_weight(&self) -> f64 {
        self.mel_weight
    }

    /// Discriminator total from outputs computed on a detached generated waveform.
    ///
    /// # Errors
    ///
    /// Returns an error if an ensemble produced no outputs.
    pub fn discriminator(&self, mpd: &DiscriminatorOutputs, msd: &DiscriminatorOutputs) -> Result<DiscriminatorLoss> {
        let mpd = discriminator_loss(&mpd.real_logits, &mpd.generated_logits)?;
        let msd = discriminator_loss(&msd.real_logits, &msd.generated_logits)?;
        let total = (&mpd + &msd)?;
        Ok(DiscriminatorLoss { mpd, msd, total })
    }

    /// Generator total: adversarial and feature-matching terms of both
    /// ensembles plus the weighted mel reconstruction term.
    ///
    /// # Errors
    ///
    /// Returns an error if an ensemble produced no outputs or the mels differ in shape.
    pub fn generator(
        &self,
        mpd: &DiscriminatorOutputs,
        msd: &DiscriminatorOutputs,
        mel_target: &Tensor,
        mel_generated: &Tensor,
    ) -> Result<GeneratorLoss> {
        let adversarial_mpd = generator_loss(&mpd.generated_logits)?;
        let adversarial_msd = generator_loss(&msd.generated_logits)?;
        let feature_mpd = feature_loss(&mpd.real_features, &mpd.generated_features)?;
        let feature_msd = feature_loss(&msd.real_features, &msd.generated_features)?;
        let mel = mel_loss(mel_target, mel_generated)?;

        let features = ((&feature_mpd + &feature_msd)? * self.feature_weight)?;
        let total = (((&adversarial_mpd + &adversarial_msd)? + features)?
            + (&mel * self.mel_weight)?)?;
        Ok(GeneratorLoss {
            adversarial_mpd,
            adversarial_msd,
            feature_mpd,
            feature_msd,
            mel,
            total,
        })
    }
}
