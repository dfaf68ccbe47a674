//! Checkpoint bundles and the save/load policy around them
//!
//! [`CheckpointManager`] decides what goes into a bundle (merged weights,
//! adapter weights, adapter config, and for intermediate saves the optimizer
//! and recipe progress). Writing and reading files is left to a
//! [`Checkpointer`](crate::training::checkpointer::Checkpointer).

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RecipeError, Result};
use crate::lora::{get_merged_lora_ckpt, AdapterConfig, AdapterParams, StateDict};
use crate::models::CausalLm;
use crate::training::checkpointer::Checkpointer;
use crate::training::optimizer::{Optimizer, OptimizerState};
use crate::training::state::RecipeState;

pub const MODEL_KEY: &str = "model";
pub const ADAPTER_KEY: &str = "adapter";
pub const ADAPTER_CONFIG: &str = "adapter_config";
pub const OPT_KEY: &str = "optimizer";
pub const SEED_KEY: &str = "seed";
pub const EPOCHS_KEY: &str = "epochs_run";
pub const TOTAL_EPOCHS_KEY: &str = "total_epochs";
pub const MAX_STEPS_KEY: &str = "max_steps_per_epoch";

/// Recipe progress persisted with an intermediate checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeStateFields {
    pub seed: u64,
    pub epochs_run: usize,
    pub total_epochs: usize,
    pub max_steps_per_epoch: Option<usize>,
}

/// Everything one checkpoint carries
///
/// A loaded bundle always has model weights; adapter weights, optimizer state
/// and recipe fields are present only when resuming. A saved bundle always has
/// model weights, adapter weights and adapter config; optimizer state and
/// recipe fields only when the save is intermediate.
#[derive(Debug, Clone, Default)]
pub struct CheckpointBundle {
    pub model_weights: StateDict,
    pub adapter_weights: Option<StateDict>,
    pub adapter_config: Option<AdapterConfig>,
    pub optimizer_state: Option<OptimizerState>,
    pub recipe_state: Option<RecipeStateFields>,
}

impl CheckpointBundle {
    /// Bundle keys present, in the order they are documented
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys = vec![MODEL_KEY];
        if self.adapter_weights.is_some() {
            keys.push(ADAPTER_KEY);
        }
        if self.adapter_config.is_some() {
            keys.push(ADAPTER_CONFIG);
        }
        if self.optimizer_state.is_some() {
            keys.push(OPT_KEY);
        }
        if self.recipe_state.is_some() {
            keys.extend([SEED_KEY, EPOCHS_KEY, TOTAL_EPOCHS_KEY, MAX_STEPS_KEY]);
        }
        keys
    }
}

/// Inputs of one checkpoint save
pub struct SaveRequest<'a> {
    pub epoch: usize,
    pub model: &'a dyn CausalLm,
    pub optimizer: &'a dyn Optimizer,
    pub adapter_params: &'a AdapterParams,
    pub recipe_state: &'a RecipeState,
    pub adapter_config: &'a AdapterConfig,
    pub adapter_only: bool,
}

/// Builds bundles from live training objects and hands them to a checkpointer
pub struct CheckpointManager {
    checkpointer: Box<dyn Checkpointer>,
}

impl CheckpointManager {
    pub fn new(checkpointer: Box<dyn Checkpointer>) -> Self {
        Self { checkpointer }
    }

    /// Read the configured checkpoint
    ///
    /// Resuming is not implemented: with `resume` set the bundle is read and
    /// then rejected rather than used partially.
    pub fn load(&mut self, resume: bool) -> Result<CheckpointBundle> {
        let bundle = self.checkpointer.load_checkpoint()?;
        if resume {
            return Err(RecipeError::UnsupportedFeature(
                "Resume from checkpoint is not supported yet.".to_string(),
            ));
        }
        Ok(bundle)
    }

    /// Assemble and persist the bundle for `request.epoch`
    ///
    /// The live model is only read: weights are copied to the host before the
    /// adapter merge. Persistence errors are returned unchanged.
    pub fn save(&mut self, request: SaveRequest<'_>) -> Result<()> {
        let state = request.recipe_state;
        let intermediate = state.is_intermediate(request.epoch);

        let mut bundle = CheckpointBundle::default();
        if intermediate {
            bundle.optimizer_state = Some(request.optimizer.state_dict()?);
            bundle.recipe_state = Some(state.checkpoint_fields());
        }

        let state_dict = request.model.state_dict()?;
        bundle.model_weights = get_merged_lora_ckpt(
            &state_dict,
            request.adapter_config.r,
            request.adapter_config.lora_alpha,
        )?;

        let adapter_weights: StateDict = state_dict
            .into_iter()
            .filter(|(k, _)| request.adapter_params.contains_key(k))
            .collect();
        bundle.adapter_weights = Some(adapter_weights);
        bundle.adapter_config = Some(request.adapter_config.clone());

        info!(
            "Saving {} checkpoint for epoch {}",
            if intermediate { "intermediate" } else { "final" },
            request.epoch
        );
        self.checkpointer
            .save_checkpoint(&bundle, request.epoch, intermediate, request.adapter_only)
    }
}
