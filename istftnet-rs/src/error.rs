//! Error types for istftnet-rs.
//!
//! Every fallible operation in the crate returns [`Result`], whose error type
//! is [`VocoderError`]. Backend failures (candle, file IO, WAV decoding) are
//! converted with `?`; domain failures carry a short lowercase message.
//!
//! # Example
//!
//! ```rust
//! use istftnet_rs::{Hyperparameters, VocoderError};
//!
//! # fn main() {
//! match Hyperparameters::from_file("/nonexistent/config.json") {
//!     Ok(_) => println!("loaded"),
//!     Err(VocoderError::Io(e)) => eprintln!("cannot read config: {e}"),
//!     Err(e) => eprintln!("other error: {e}"),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for istftnet-rs operations.
pub type Result<T> = std::result::Result<T, VocoderError>;

/// Errors that can occur while training a vocoder.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum VocoderError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Signal processing error (shape mismatch, invalid window setup).
    #[error("audio error: {0}")]
    Audio(String),

    /// Model construction or forward error.
    #[error("model error: {0}")]
    Model(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// A loss term became NaN or infinite.
    #[error("non-finite {term} loss at step {step}: {value}")]
    NonFiniteLoss {
        /// Global step at which the loss was computed.
        step: u64,
        /// Which total diverged (`discriminator` or `generator`).
        term: &'static str,
        /// The offending value.
        value: f32,
    },

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),

    /// Metrics sink error.
    #[error("metrics error: {0}")]
    Metrics(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// WAV encode/decode error.
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    /// Image encode error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for VocoderError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        VocoderError::Template(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = VocoderError::Config("invalid parameter".to_string());
        assert_eq!(error.to_string(), "configuration error: invalid parameter");
    }

    #[test]
    fn test_checkpoint_error_creation() {
        let error = VocoderError::Checkpoint("missing tensor".to_string());
        assert_eq!(error.to_string(), "checkpoint error: missing tensor");
    }

    #[test]
    fn test_non_finite_loss_display() {
        let error = VocoderError::NonFiniteLoss {
            step: 12,
            term: "generator",
            value: f32::NAN,
        };
        assert_eq!(error.to_string(), "non-finite generator loss at step 12: NaN");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: VocoderError = io_error.into();
        assert!(error.to_string().contains("IO error"));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{invalid").unwrap_err();
        let error: VocoderError = json_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let tensor1 = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let tensor2 = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();

        let candle_error = tensor1.broadcast_add(&tensor2).unwrap_err();
        let error: VocoderError = candle_error.into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_error_source_chain() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "config.json not found");
        let error: VocoderError = io_error.into();

        use std::error::Error;
        assert!(error.source().is_some());
    }

    #[test]
    fn test_template_error_conversion() {
        use indicatif::ProgressStyle;

        let result = ProgressStyle::default_bar().template("{invalid_placeholder:.bogus.style.}");
        if let Err(template_error) = result {
            let error: VocoderError = template_error.into();
            assert!(error.to_string().contains("template error"));
        }
    }
}
