//! Checkpoint pairs on disk.
//!
//! Every save point is two safetensors files sharing an 8-digit step suffix:
//!
//! - `g_XXXXXXXX`: the generator (`generator.<param>`).
//! - `do_XXXXXXXX`: both discriminator ensembles (`mpd.<param>`,
//!   `msd.<param>`), both optimizer states (`optim_g.<key>`, `optim_d.<key>`)
//!   and the `steps` / `epoch` counters as `i64` tensors.
//!
//! Discovery is a pure function of the directory listing: [`latest`] reports
//! the newest step for one prefix and [`CheckpointManager::find_resume_point`]
//! the newest step for which both files exist. Files are written to a
//! temporary name and renamed, so a crash mid-write never leaves a truncated
//! checkpoint under a final name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, VocoderError};

/// Prefix of generator snapshots.
pub const GENERATOR_PREFIX: &str = "g_";
/// Prefix of discriminator/optimizer snapshots.
pub const TRAINING_PREFIX: &str = "do_";

const STEP_DIGITS: usize = 8;

/// Path of the checkpoint with `prefix` at `step`.
#[must_use]
pub fn checkpoint_path(dir: &Path, prefix: &str, step: u64) -> PathBuf {
    dir.join(format!("{prefix}{step:0width$}", width = STEP_DIGITS))
}

fn parse_step(file_name: &str, prefix: &str) -> Option<u64> {
    let digits = file_name.strip_prefix(prefix)?;
    if digits.len() < STEP_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Steps of every checkpoint with `prefix` in `dir`, ascending.
///
/// A missing directory holds no checkpoints.
///
/// # Errors
///
/// Returns an IO error if the directory exists but cannot be listed.
pub fn steps(dir: &Path, prefix: &str) -> Result<Vec<u64>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(step) = entry.file_name().to_str().and_then(|n| parse_step(n, prefix)) {
            found.push(step);
        }
    }
    found.sort_unstable();
    Ok(found)
}

/// Newest step of the checkpoints with `prefix` in `dir`.
///
/// # Errors
///
/// Returns an IO error if the directory exists but cannot be listed.
pub fn latest(dir: &Path, prefix: &str) -> Result<Option<u64>> {
    Ok(steps(dir, prefix)?.last().copied())
}

/// Contents of a `g_` file.
#[derive(Debug, Clone)]
pub struct GeneratorSnapshot {
    /// Generator parameters by name.
    pub generator: HashMap<String, Tensor>,
}

/// Contents of a `do_` file.
#[derive(Debug, Clone)]
pub struct TrainingSnapshot {
    /// Multi-period discriminator parameters.
    pub mpd: HashMap<String, Tensor>,
    /// Multi-scale discriminator parameters.
    pub msd: HashMap<String, Tensor>,
    /// Generator optimizer state.
    pub optim_g: HashMap<String, Tensor>,
    /// Discriminator optimizer state.
    pub optim_d: HashMap<String, Tensor>,
    /// Index of the last completed step.
    pub steps: u64,
    /// Epoch during which the snapshot was taken.
    pub epoch: i64,
}

/// A complete checkpoint pair read back from disk.
#[derive(Debug, Clone)]
pub struct ResumePoint {
    /// Step suffix shared by both files.
    pub step: u64,
    /// Generator snapshot.
    pub generator: GeneratorSnapshot,
    /// Discriminator/optimizer snapshot.
    pub training: TrainingSnapshot,
}

/// Saves and locates checkpoint pairs in one directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Manager for `dir`. The directory is created on the first save.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Checkpoint directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Newest step for which both files of the pair exist.
    ///
    /// Unpaired files are reported and ignored; `None` means a fresh start.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory cannot be listed.
    pub fn find_resume_point(&self) -> Result<Option<u64>> {
        let generators = steps(&self.dir, GENERATOR_PREFIX)?;
        let trainings = steps(&self.dir, TRAINING_PREFIX)?;

        let newest_pair = generators
            .iter()
            .rev()
            .find(|s| trainings.binary_search(s).is_ok())
            .copied();

        for (prefix, list, other) in [
            (GENERATOR_PREFIX, &generators, &trainings),
            (TRAINING_PREFIX, &trainings, &generators),
        ] {
            for step in list.iter().filter(|s| other.binary_search(s).is_err()) {
                tracing::warn!(
                    "Ignoring unpaired checkpoint {}",
                    checkpoint_path(&self.dir, prefix, *step).display()
                );
            }
        }
        Ok(newest_pair)
    }

    /// Locate and read the newest complete pair.
    ///
    /// # Errors
    ///
    /// Returns an error if a file of the pair is present but unreadable or malformed.
    pub fn load_latest(&self, device: &Device) -> Result<Option<ResumePoint>> {
        let Some(step) = self.find_resume_point()? else {
            return Ok(None);
        };
        let (generator, training) = self.load(step, device)?;
        Ok(Some(ResumePoint {
            step,
            generator,
            training,
        }))
    }

    /// Read the pair saved at `step`.
    ///
    /// # Errors
    ///
    /// Returns [`VocoderError::Checkpoint`] if either file is missing, cannot be
    /// decoded or holds unexpected keys.
    pub fn load(&self, step: u64, device: &Device) -> Result<(GeneratorSnapshot, TrainingSnapshot)> {
        let g_path = checkpoint_path(&self.dir, GENERATOR_PREFIX, step);
        tracing::info!("Loading '{}'", g_path.display());
        let mut generator = HashMap::new();
        for (key, value) in read_tensors(&g_path, device)? {
            match key.split_once('.') {
                Some(("generator", name)) => {
                    generator.insert(name.to_string(), value);
                }
                _ => return Err(unexpected_key(&g_path, &key)),
            }
        }

        let do_path = checkpoint_path(&self.dir, TRAINING_PREFIX, step);
        tracing::info!("Loading '{}'", do_path.display());
        let mut mpd = HashMap::new();
        let mut msd = HashMap::new();
        let mut optim_g = HashMap::new();
        let mut optim_d = HashMap::new();
        let mut saved_steps = None;
        let mut epoch = None;
        for (key, value) in read_tensors(&do_path, device)? {
            let section = match key.split_once('.') {
                Some(("mpd", name)) => Some((&mut mpd, name)),
                Some(("msd", name)) => Some((&mut msd, name)),
                Some(("optim_g", name)) => Some((&mut optim_g, name)),
                Some(("optim_d", name)) => Some((&mut optim_d, name)),
                _ => None,
            };
            if let Some((target, name)) = section {
                target.insert(name.to_string(), value);
                continue;
            }
            match key.as_str() {
                "steps" => saved_steps = Some(scalar_i64(&value)?),
                "epoch" => epoch = Some(scalar_i64(&value)?),
                _ => return Err(unexpected_key(&do_path, &key)),
            }
        }

        let missing = |what: &str| {
            VocoderError::Checkpoint(format!("{} has no '{what}' entry", do_path.display()))
        };
        let saved_steps = saved_steps.ok_or_else(|| missing("steps"))?;
        let epoch = epoch.ok_or_else(|| missing("epoch"))?;
        let steps = u64::try_from(saved_steps)
            .map_err(|_| VocoderError::Checkpoint(format!("negative step count {saved_steps}")))?;

        Ok((
            GeneratorSnapshot { generator },
            TrainingSnapshot {
                mpd,
                msd,
                optim_g,
                optim_d,
                steps,
                epoch,
            },
        ))
    }

    /// Write a checkpoint pair at `training.steps`, generator file first.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or a file cannot
    /// be written.
    pub fn save(&self, generator: &GeneratorSnapshot, training: &TrainingSnapshot) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(&self.dir)?;
        let step = training.steps;

        let g_path = checkpoint_path(&self.dir, GENERATOR_PREFIX, step);
        let g_tensors = prefixed([("generator", &generator.generator)]);
        tracing::info!("Saving checkpoint to {}", g_path.display());
        write_tensors(&g_tensors, &g_path)?;

        let do_path = checkpoint_path(&self.dir, TRAINING_PREFIX, step);
        let mut do_tensors = prefixed([
            ("mpd", &training.mpd),
            ("msd", &training.msd),
            ("optim_g", &training.optim_g),
            ("optim_d", &training.optim_d),
        ]);
        #[allow(clippy::cast_possible_wrap)]
        let saved_steps = step as i64;
        do_tensors.insert("steps".to_string(), Tensor::new(&[saved_steps], &Device::Cpu)?);
        do_tensors.insert("epoch".to_string(), Tensor::new(&[training.epoch], &Device::Cpu)?);
        tracing::info!("Saving checkpoint to {}", do_path.display());
        write_tensors(&do_tensors, &do_path)?;

        Ok((g_path, do_path))
    }
}

fn prefixed<'a>(
    sections: impl IntoIterator<Item = (&'a str, &'a HashMap<String, Tensor>)>,
) -> HashMap<String, Tensor> {
    sections
        .into_iter()
        .flat_map(|(section, map)| {
            map.iter()
                .map(move |(name, t)| (format!("{section}.{name}"), t.clone()))
        })
        .collect()
}

fn write_tensors(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    candle_core::safetensors::save(tensors, &tmp)
        .map_err(|e| VocoderError::Checkpoint(format!("failed to write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_tensors(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    if !path.is_file() {
        return Err(VocoderError::Checkpoint(format!("{} does not exist", path.display())));
    }
    candle_core::safetensors::load(path, device)
        .map_err(|e| VocoderError::Checkpoint(format!("failed to read {}: {e}", path.display())))
}

fn scalar_i64(t: &Tensor) -> Result<i64> {
    t.flatten_all()?
        .to_dtype(DType::I64)?
        .to_vec1::<i64>()?
        .first()
        .copied()
        .ok_or_else(|| VocoderError::Checkpoint("empty counter tensor".into()))
}

fn unexpected_key(path: &Path, key: &str) -> VocoderError {
    VocoderError::Checkpoint(format!("{} holds unexpected entry '{key}'", path.display()))
}
