//! CLI entry point for istftnet-rs.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use istftnet_rs::config::build_env;
use istftnet_rs::metrics::EventFileSink;
use istftnet_rs::{Hyperparameters, Result, RunOptions, TrainingOrchestrator};

#[derive(Parser)]
#[command(name = "istftnet")]
#[command(about = "Adversarial training of iSTFTNet vocoders")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start training, resuming from the newest checkpoint pair if present
    Train(TrainArgs),
    /// Validate a configuration file
    Check {
        /// Path to the JSON configuration
        config: PathBuf,
    },
    /// Write the reference iSTFTNet V1 configuration
    Init {
        /// Output path for the config file
        #[arg(default_value = "config_v1.json")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct TrainArgs {
    /// Path to the JSON configuration
    #[arg(long)]
    config: PathBuf,
    /// Directory containing the training WAV files
    #[arg(long, default_value = "LJSpeech-1.1/wavs")]
    input_wavs_dir: PathBuf,
    /// Directory of precomputed mels used with --fine-tuning
    #[arg(long, default_value = "ft_dataset")]
    input_mels_dir: PathBuf,
    /// Training file list (`name|transcript` lines)
    #[arg(long, default_value = "LJSpeech-1.1/training.txt")]
    input_training_file: PathBuf,
    /// Validation file list (`name|transcript` lines)
    #[arg(long, default_value = "LJSpeech-1.1/validation.txt")]
    input_validation_file: PathBuf,
    /// Checkpoint and log directory
    #[arg(long, default_value = "cp_hifigan")]
    checkpoint_path: PathBuf,
    /// Epoch at which training stops
    #[arg(long, default_value_t = 3100)]
    training_epochs: i64,
    /// Steps between console log lines
    #[arg(long, default_value_t = 5)]
    stdout_interval: u64,
    /// Steps between checkpoint pairs
    #[arg(long, default_value_t = 5000)]
    checkpoint_interval: u64,
    /// Steps between scalar summaries
    #[arg(long, default_value_t = 100)]
    summary_interval: u64,
    /// Steps between validation passes
    #[arg(long, default_value_t = 1000)]
    validation_interval: u64,
    /// Condition on precomputed mels from --input-mels-dir
    #[arg(long)]
    fine_tuning: bool,
    /// Hide the per-epoch progress bar
    #[arg(long)]
    no_progress: bool,
    /// Keep training when a loss becomes NaN or infinite
    #[arg(long)]
    allow_non_finite: bool,
}

impl TrainArgs {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            input_wavs_dir: self.input_wavs_dir.clone(),
            input_mels_dir: self.input_mels_dir.clone(),
            input_training_file: self.input_training_file.clone(),
            input_validation_file: self.input_validation_file.clone(),
            checkpoint_path: self.checkpoint_path.clone(),
            training_epochs: self.training_epochs,
            fine_tuning: self.fine_tuning,
            stdout_interval: self.stdout_interval,
            checkpoint_interval: self.checkpoint_interval,
            summary_interval: self.summary_interval,
            validation_interval: self.validation_interval,
            progress: !self.no_progress,
            check_finite: !self.allow_non_finite,
        }
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => {
            tracing::info!("Starting training with config: {}", args.config.display());
            let hparams = Hyperparameters::from_file(&args.config)?;
            let options = args.run_options();
            options.validate()?;
            build_env(&args.config, "config.json", &options.checkpoint_path)?;
            println!("Batch size: {}", hparams.batch_size);

            let sink = EventFileSink::new(options.checkpoint_path.join("logs"))?;
            let mut orchestrator = TrainingOrchestrator::new(hparams, options, Box::new(sink))?;
            orchestrator.fit()?;
            println!(
                "✓ Training finished at step {}",
                orchestrator.state().steps
            );
        }
        Commands::Check { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let hparams = Hyperparameters::from_file(&config)?;
            println!("✓ Configuration is valid");
            println!("  Sampling rate: {} Hz", hparams.sampling_rate);
            println!("  Mel bins: {}", hparams.num_mels);
            println!("  Upsample rates: {:?}", hparams.upsample_rates);
            println!(
                "  iSTFT: n_fft {}, hop {}",
                hparams.gen_istft_n_fft, hparams.gen_istft_hop_size
            );
            println!("  Batch size: {}", hparams.batch_size);
            println!("  Learning rate: {}", hparams.learning_rate);
        }
        Commands::Init { output } => {
            tracing::info!("Writing reference configuration");
            Hyperparameters::reference_v1().to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
    }

    Ok(())
}
