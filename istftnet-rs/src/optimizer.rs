//! AdamW with exportable moment state.
//!
//! `candle_nn::AdamW` keeps its moments private, so resumed runs would restart
//! with zeroed moments. This implementation follows PyTorch's `AdamW` update
//! and exposes its state as named tensors for checkpointing.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};

use crate::config::Hyperparameters;
use crate::error::{Result, VocoderError};

/// Optimizer configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            learning_rate: 2e-4,
            beta1: 0.8,
            beta2: 0.99,
            weight_decay: 0.01,
            eps: 1e-8,
        }
    }
}

impl AdamWConfig {
    /// Configuration shared by the generator and discriminator optimizers.
    #[must_use]
    pub fn from_hparams(hparams: &Hyperparameters) -> Self {
        Self {
            learning_rate: hparams.learning_rate,
            beta1: hparams.adam_b1,
            beta2: hparams.adam_b2,
            weight_decay: hparams.weight_decay,
            eps: hparams.adam_eps,
        }
    }
}

/// AdamW over a fixed set of named parameters.
pub struct AdamW {
    config: AdamWConfig,
    params: Vec<(String, Var)>,
    lr: f64,
    initial_lr: f64,
    /// First moment estimates
    exp_avg: HashMap<String, Tensor>,
    /// Second moment estimates
    exp_avg_sq: HashMap<String, Tensor>,
    /// Step counter for bias correction
    t: u64,
}

impl AdamW {
    /// Create an optimizer over `params`.
    #[must_use]
    pub fn new(params: Vec<(String, Var)>, config: AdamWConfig) -> Self {
        Self {
            lr: config.learning_rate,
            initial_lr: config.learning_rate,
            config,
            params,
            exp_avg: HashMap::new(),
            exp_avg_sq: HashMap::new(),
            t: 0,
        }
    }

    /// Get current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Learning rate the optimizer was created with, before any decay.
    #[must_use]
    pub fn initial_learning_rate(&self) -> f64 {
        self.initial_lr
    }

    /// Number of updates applied so far.
    #[must_use]
    pub fn step_count(&self) -> u64 {
        self.t
    }

    /// Names of the parameters this optimizer updates.
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(n, _)| n.as_str())
    }

    /// Apply one update from the gradients in `grads`.
    ///
    /// Parameters without a gradient in the store are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.t += 1;
        let t = self.t as i32;
        let AdamWConfig {
            beta1,
            beta2,
            weight_decay,
            eps,
            ..
        } = self.config;
        let bc1 = 1.0 - beta1.powi(t);
        let bc2_sqrt = (1.0 - beta2.powi(t)).sqrt();
        let step_size = self.lr / bc1;

        for (name, var) in &self.params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let grad = grad.detach();
            let m = match self.exp_avg.get(name) {
                Some(m) => m.clone(),
                None => var.zeros_like()?,
            };
            let v = match self.exp_avg_sq.get(name) {
                Some(v) => v.clone(),
                None => var.zeros_like()?,
            };

            let m = ((m * beta1)? + (&grad * (1.0 - beta1))?)?;
            let v = ((v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            let decayed = (var.as_tensor().detach() * (1.0 - self.lr * weight_decay))?;
            let denom = ((v.sqrt()? / bc2_sqrt)? + eps)?;
            let update = ((&m / denom)? * step_size)?;
            var.set(&(decayed - update)?)?;

            self.exp_avg.insert(name.clone(), m);
            self.exp_avg_sq.insert(name.clone(), v);
        }
        Ok(())
    }

    /// Export the optimizer state.
    ///
    /// Keys are `exp_avg.{param}`, `exp_avg_sq.{param}`, `step`, `lr` and
    /// `initial_lr`.
    ///
    /// # Errors
    ///
    /// Returns an error if a scalar tensor cannot be created.
    #[allow(clippy::cast_possible_wrap)]
    pub fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        for (name, m) in &self.exp_avg {
            state.insert(format!("exp_avg.{name}"), m.detach());
        }
        for (name, v) in &self.exp_avg_sq {
            state.insert(format!("exp_avg_sq.{name}"), v.detach());
        }
        state.insert("step".to_string(), Tensor::new(&[self.t as i64], &Device::Cpu)?);
        state.insert("lr".to_string(), Tensor::new(&[self.lr], &Device::Cpu)?);
        state.insert(
            "initial_lr".to_string(),
            Tensor::new(&[self.initial_lr], &Device::Cpu)?,
        );
        Ok(state)
    }

    /// Restore state previously exported with [`AdamW::state_tensors`].
    ///
    /// Unrecognized keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the step counter is missing, or a moment refers
    /// to an unknown parameter or has the wrong shape.
    #[allow(clippy::cast_sign_loss)]
    pub fn load_state_tensors(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        let scalar_i64 = |key: &str| -> Result<i64> {
            let t = state
                .get(key)
                .ok_or_else(|| VocoderError::Checkpoint(format!("missing optimizer entry {key}")))?;
            Ok(t.flatten_all()?.to_dtype(DType::I64)?.to_vec1::<i64>()?.first().copied().unwrap_or(0))
        };
        let scalar_f64 = |key: &str| -> Result<Option<f64>> {
            state
                .get(key)
                .map(|t| -> Result<f64> {
                    Ok(t.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?.first().copied().unwrap_or(0.0))
                })
                .transpose()
        };

        let mut exp_avg = HashMap::new();
        let mut exp_avg_sq = HashMap::new();
        for (key, value) in state {
            let (target, name) = if let Some(name) = key.strip_prefix("exp_avg_sq.") {
                (&mut exp_avg_sq, name)
            } else if let Some(name) = key.strip_prefix("exp_avg.") {
                (&mut exp_avg, name)
            } else {
                continue;
            };
            let var = self
                .params
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v)
                .ok_or_else(|| VocoderError::Checkpoint(format!("{key} refers to an unknown parameter")))?;
            if value.dims() != var.dims() {
                return Err(VocoderError::Checkpoint(format!(
                    "{key} has shape {:?}, expected {:?}",
                    value.dims(),
                    var.dims()
                )));
            }
            target.insert(name.to_string(), value.to_device(var.device())?.to_dtype(var.dtype())?);
        }

        self.t = scalar_i64("step")?.max(0) as u64;
        if let Some(lr) = scalar_f64("lr")? {
            self.lr = lr;
        }
        if let Some(initial_lr) = scalar_f64("initial_lr")? {
            self.initial_lr = initial_lr;
        }
        self.exp_avg = exp_avg;
        self.exp_avg_sq = exp_avg_sq;
        Ok(())
    }
}
