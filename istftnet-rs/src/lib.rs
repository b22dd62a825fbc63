//! # istftnet-rs
//!
//! Adversarial training of iSTFTNet vocoders on candle.
//!
//! A generator predicts magnitude and phase spectra from a mel spectrogram; a
//! fixed inverse STFT turns them into a waveform. Multi-period and
//! multi-scale discriminator ensembles supervise the waveform adversarially,
//! next to feature-matching and mel reconstruction losses.
//!
//! ## Features
//!
//! - **JSON Configuration** - the iSTFTNet config files load unchanged
//! - **Resumable Training** - checkpoint pairs restore the exact training position
//! - **Deterministic Data** - per-epoch shuffles and segment crops are seeded
//! - **Validation Artifacts** - audio clips and mel renderings per validation pass
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write the reference configuration
//! istftnet init config_v1.json
//!
//! # Validate a configuration
//! istftnet check config_v1.json
//!
//! # Start or resume training
//! istftnet train --config config_v1.json --checkpoint-path cp_istftnet
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use istftnet_rs::config::RunOptions;
//! use istftnet_rs::metrics::EventFileSink;
//! use istftnet_rs::{Hyperparameters, TrainingOrchestrator};
//!
//! # fn main() -> istftnet_rs::Result<()> {
//! let hparams = Hyperparameters::from_file("config_v1.json")?;
//! let options = RunOptions {
//!     training_epochs: 10,
//!     ..RunOptions::default()
//! };
//! let sink = EventFileSink::new(options.checkpoint_path.join("logs"))?;
//!
//! let mut orchestrator = TrainingOrchestrator::new(hparams, options, Box::new(sink))?;
//! orchestrator.fit()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Synthesis
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use istftnet_rs::audio::Synthesizer;
//!
//! # fn main() -> istftnet_rs::Result<()> {
//! let synthesizer = Synthesizer::new(16, 4, 16, &Device::Cpu)?;
//! let magnitude = Tensor::ones((1, 9, 32), candle_core::DType::F32, &Device::Cpu)?;
//! let phase = Tensor::zeros((1, 9, 32), candle_core::DType::F32, &Device::Cpu)?;
//! let waveform = synthesizer.inverse(&magnitude, &phase)?;
//! assert_eq!(waveform.dims(), &[1, 1, 124]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod audio;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod models;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;
pub mod validation;

pub use config::{Hyperparameters, RunOptions};
pub use error::{Result, VocoderError};
pub use trainer::{TrainingOrchestrator, TrainingState};
