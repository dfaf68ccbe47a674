//! Checkpoint persistence in safetensors + JSON
//!
//! Layout of a saved epoch under `output_dir/epoch_{n}/`:
//! - `model.safetensors` merged weights (skipped for adapter-only saves)
//! - `adapter_model.safetensors` adapter weights
//! - `adapter_config.json`
//! - `recipe_state.json` and `optimizer.safetensors` (intermediate saves only)

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::CheckpointerConfig;
use crate::error::{RecipeError, Result};
use crate::lora::StateDict;
use crate::training::checkpoint::{CheckpointBundle, RecipeStateFields};
use crate::training::optimizer::OptimizerState;

pub const MODEL_FILE: &str = "model.safetensors";
pub const ADAPTER_FILE: &str = "adapter_model.safetensors";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const RECIPE_STATE_FILE: &str = "recipe_state.json";
pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";

/// Reads and writes checkpoint bundles
pub trait Checkpointer {
    fn load_checkpoint(&mut self) -> Result<CheckpointBundle>;

    fn save_checkpoint(
        &mut self,
        bundle: &CheckpointBundle,
        epoch: usize,
        intermediate: bool,
        adapter_only: bool,
    ) -> Result<()>;
}

/// On-disk form of the recipe state: progress fields plus optimizer scalars
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecipeStateRecord {
    #[serde(flatten)]
    fields: RecipeStateFields,
    #[serde(default)]
    optimizer: BTreeMap<String, f64>,
}

pub struct SafetensorsCheckpointer {
    checkpoint_dir: PathBuf,
    checkpoint_files: Vec<String>,
    output_dir: PathBuf,
    adapter_checkpoint: Option<String>,
    recipe_checkpoint: Option<String>,
    resume_from_checkpoint: bool,
}

impl SafetensorsCheckpointer {
    pub fn new(cfg: &CheckpointerConfig, resume_from_checkpoint: bool) -> Self {
        Self {
            checkpoint_dir: cfg.checkpoint_dir.clone(),
            checkpoint_files: cfg.checkpoint_files.clone(),
            output_dir: cfg.output_dir.clone(),
            adapter_checkpoint: cfg.adapter_checkpoint.clone(),
            recipe_checkpoint: cfg.recipe_checkpoint.clone(),
            resume_from_checkpoint,
        }
    }

    /// Directory a given epoch is written to
    pub fn epoch_dir(&self, epoch: usize) -> PathBuf {
        self.output_dir.join(format!("epoch_{}", epoch))
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let path = self.checkpoint_dir.join(name);
        if !path.is_file() {
            return Err(RecipeError::checkpoint(format!(
                "checkpoint file {:?} does not exist",
                path
            )));
        }
        Ok(path)
    }

    fn load_resume_state(&self, bundle: &mut CheckpointBundle) -> Result<()> {
        let adapter = self.adapter_checkpoint.as_deref().ok_or_else(|| {
            RecipeError::checkpoint("adapter_checkpoint is required to resume training")
        })?;
        let recipe = self.recipe_checkpoint.as_deref().ok_or_else(|| {
            RecipeError::checkpoint("recipe_checkpoint is required to resume training")
        })?;

        bundle.adapter_weights = Some(load_state_dict(&self.resolve(adapter)?)?);

        let recipe_path = self.resolve(recipe)?;
        let record: RecipeStateRecord =
            serde_json::from_str(&std::fs::read_to_string(&recipe_path)?)?;

        let optimizer_path = recipe_path
            .parent()
            .map(|p| p.join(OPTIMIZER_FILE))
            .unwrap_or_else(|| PathBuf::from(OPTIMIZER_FILE));
        if !optimizer_path.is_file() {
            return Err(RecipeError::checkpoint(format!(
                "optimizer state {:?} does not exist",
                optimizer_path
            )));
        }
        bundle.optimizer_state = Some(OptimizerState {
            scalars: record.optimizer,
            tensors: load_state_dict(&optimizer_path)?,
        });
        bundle.recipe_state = Some(record.fields);
        Ok(())
    }
}

impl Checkpointer for SafetensorsCheckpointer {
    fn load_checkpoint(&mut self) -> Result<CheckpointBundle> {
        let mut bundle = CheckpointBundle::default();
        for file in &self.checkpoint_files {
            let path = self.resolve(file)?;
            for (name, tensor) in load_state_dict(&path)? {
                if bundle.model_weights.insert(name.clone(), tensor).is_some() {
                    return Err(RecipeError::checkpoint(format!(
                        "parameter '{}' appears in more than one checkpoint file",
                        name
                    )));
                }
            }
        }
        info!(
            "Loaded {} base tensors from {:?}",
            bundle.model_weights.len(),
            self.checkpoint_dir
        );

        if self.resume_from_checkpoint {
            self.load_resume_state(&mut bundle)?;
        }
        Ok(bundle)
    }

    fn save_checkpoint(
        &mut self,
        bundle: &CheckpointBundle,
        epoch: usize,
        intermediate: bool,
        adapter_only: bool,
    ) -> Result<()> {
        let dir = self.epoch_dir(epoch);
        std::fs::create_dir_all(&dir)?;

        if !adapter_only {
            let path = dir.join(MODEL_FILE);
            save_state_dict(&bundle.model_weights, &path)?;
            info!("Model checkpoint of size {} saved to {:?}", file_size(&path), path);
        }

        let adapter = bundle
            .adapter_weights
            .as_ref()
            .ok_or_else(|| RecipeError::checkpoint("bundle has no adapter weights"))?;
        let path = dir.join(ADAPTER_FILE);
        save_state_dict(adapter, &path)?;
        info!("Adapter checkpoint of size {} saved to {:?}", file_size(&path), path);

        let adapter_config = bundle
            .adapter_config
            .as_ref()
            .ok_or_else(|| RecipeError::checkpoint("bundle has no adapter config"))?;
        std::fs::write(
            dir.join(ADAPTER_CONFIG_FILE),
            serde_json::to_string_pretty(adapter_config)?,
        )?;

        if intermediate {
            let (Some(fields), Some(optimizer)) = (&bundle.recipe_state, &bundle.optimizer_state)
            else {
                return Err(RecipeError::checkpoint(
                    "intermediate checkpoint requires recipe state and optimizer state",
                ));
            };
            let record = RecipeStateRecord {
                fields: fields.clone(),
                optimizer: optimizer.scalars.clone(),
            };
            let path = dir.join(RECIPE_STATE_FILE);
            std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;
            save_state_dict(&optimizer.tensors, &dir.join(OPTIMIZER_FILE))?;
            info!("Recipe checkpoint saved to {:?}", path);
        } else {
            info!("Saving final epoch checkpoint; recipe state is not written");
        }
        Ok(())
    }
}

/// Read a safetensors file onto the host
pub fn load_state_dict(path: &Path) -> Result<StateDict> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    debug!("Read {} tensors from {:?}", tensors.len(), path);
    Ok(tensors.into_iter().collect())
}

/// Write host copies of `state_dict` to a safetensors file
pub fn save_state_dict(state_dict: &StateDict, path: &Path) -> Result<()> {
    let host: HashMap<String, Tensor> = state_dict
        .iter()
        .map(|(k, v)| -> Result<(String, Tensor)> { Ok((k.clone(), v.to_device(&Device::Cpu)?)) })
        .collect::<Result<_>>()?;
    candle_core::safetensors::save(&host, path)?;
    Ok(())
}

fn file_size(path: &Path) -> String {
    match std::fs::metadata(path) {
        Ok(meta) => format!("{:.2} MB", meta.len() as f64 / (1024.0 * 1024.0)),
        Err(_) => "unknown".to_string(),
    }
}
