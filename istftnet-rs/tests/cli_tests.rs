//! Integration tests for the istftnet CLI.

mod test_utils;

use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use test_utils::*;

/// Write `content` as `config.json` under `path`.
fn create_test_config(path: &Path, content: &str) -> PathBuf {
    let config_path = path.join("config.json");
    fs::write(&config_path, content).expect("Failed to write test config");
    config_path
}

/// The istftnet binary with `args`, pinned to the CPU.
fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("istftnet").expect("Failed to find istftnet binary");
    cmd.env("ISTFTNET_FORCE_CPU", "1");
    cmd.args(args);
    cmd
}

#[test]
fn test_check_command_valid_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = serde_json::to_string(&tiny_hparams()).unwrap();
    let config_path = create_test_config(temp_dir.path(), &config);

    run_cli(&["check", config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicates::str::contains("Configuration is valid"))
        .stdout(predicates::str::contains("Sampling rate: 1600 Hz"));
}

#[test]
fn test_check_command_missing_field() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), r#"{"batch_size": 16}"#);

    run_cli(&["check", config_path.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn test_check_command_inconsistent_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut hparams = tiny_hparams();
    hparams.hop_size = 17;
    let config_path =
        create_test_config(temp_dir.path(), &serde_json::to_string(&hparams).unwrap());

    run_cli(&["check", config_path.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn test_check_command_missing_file() {
    run_cli(&["check", "/nonexistent/config.json"])
        .assert()
        .failure();
}

#[test]
fn test_train_command_help() {
    run_cli(&["train", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Start training"))
        .stdout(predicates::str::contains("--checkpoint-path"))
        .stdout(predicates::str::contains("--validation-interval"))
        .stdout(predicates::str::contains("--fine-tuning"));
}

#[test]
fn test_init_command_creates_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output = temp_dir.path().join("config_v1.json");

    run_cli(&["init", output.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicates::str::contains("Configuration written"));

    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(written["sampling_rate"], 22050);
    assert_eq!(written["gen_istft_n_fft"], 16);

    run_cli(&["check", output.to_str().unwrap()])
        .assert()
        .success();
}

#[test]
fn test_train_command_writes_checkpoints_and_logs() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let options = write_corpus(temp_dir.path(), 4, 1);
    let config = serde_json::to_string(&tiny_hparams()).unwrap();
    let config_path = create_test_config(temp_dir.path(), &config);
    let checkpoint_dir = temp_dir.path().join("cp");

    run_cli(&[
        "train",
        "--config",
        config_path.to_str().unwrap(),
        "--input-wavs-dir",
        options.input_wavs_dir.to_str().unwrap(),
        "--input-training-file",
        options.input_training_file.to_str().unwrap(),
        "--input-validation-file",
        options.input_validation_file.to_str().unwrap(),
        "--checkpoint-path",
        checkpoint_dir.to_str().unwrap(),
        "--training-epochs",
        "1",
        "--checkpoint-interval",
        "1",
        "--no-progress",
    ])
    .assert()
    .success()
    .stdout(predicates::str::contains("Training finished at step 2"));

    assert!(checkpoint_dir.join("config.json").exists());
    assert!(checkpoint_dir.join("g_00000001").exists());
    assert!(checkpoint_dir.join("do_00000001").exists());
    assert!(!checkpoint_dir.join("g_00000000").exists());

    let scalars = fs::read_to_string(checkpoint_dir.join("logs").join("scalars.jsonl")).unwrap();
    assert!(scalars.contains("validation/mel_spec_error"));
}

#[test]
fn test_cli_version() {
    run_cli(&["--version"])
        .assert()
        .success()
        .stdout(predicates::str::contains("istftnet"));
}

#[test]
fn test_cli_help() {
    run_cli(&["--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("iSTFTNet"))
        .stdout(predicates::str::contains("train"))
        .stdout(predicates::str::contains("check"))
        .stdout(predicates::str::contains("init"));
}
