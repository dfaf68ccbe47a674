//! Recipe progress counters and run-level settings

use tracing::warn;

use crate::config::RecipeConfig;
use crate::training::checkpoint::RecipeStateFields;

/// Cross-cutting recipe attributes, owned by the recipe and lent to the loop
#[derive(Debug, Clone, PartialEq)]
pub struct RecipeState {
    pub seed: u64,
    pub epochs_run: usize,
    pub total_epochs: usize,
    pub max_steps_per_epoch: Option<usize>,
    pub global_step: usize,
    pub gradient_accumulation_steps: usize,
    pub resume_from_checkpoint: bool,
    pub clip_grad_norm: Option<f64>,
    pub save_adapter_weights_only: bool,
}

impl RecipeState {
    pub fn from_config(cfg: &RecipeConfig, seed: u64) -> Self {
        Self {
            seed,
            epochs_run: 0,
            total_epochs: cfg.epochs,
            max_steps_per_epoch: cfg.max_steps_per_epoch,
            global_step: 0,
            gradient_accumulation_steps: cfg.gradient_accumulation_steps,
            resume_from_checkpoint: cfg.resume_from_checkpoint,
            clip_grad_norm: cfg.clip_grad_norm,
            save_adapter_weights_only: cfg.save_adapter_weights_only,
        }
    }

    /// Whether a save after `epoch` leaves training unfinished
    pub fn is_intermediate(&self, epoch: usize) -> bool {
        epoch + 1 < self.total_epochs
    }

    /// Scalar fields persisted with an intermediate checkpoint
    pub fn checkpoint_fields(&self) -> RecipeStateFields {
        RecipeStateFields {
            seed: self.seed,
            epochs_run: self.epochs_run,
            total_epochs: self.total_epochs,
            max_steps_per_epoch: self.max_steps_per_epoch,
        }
    }

    /// Restore progress from checkpointed fields
    ///
    /// `epochs_run` is taken as-is. The checkpoint wins for seed, total epochs
    /// and the per-epoch step cap, with a warning when configuration disagrees.
    pub fn update_from_checkpoint(&mut self, fields: &RecipeStateFields) {
        if self.seed != fields.seed {
            warn!(
                "Config value for seed does not match checkpoint value, using the checkpoint value: {}",
                fields.seed
            );
        }
        if self.total_epochs != fields.total_epochs {
            warn!(
                "Config value for total_epochs does not match checkpoint value, using the checkpoint value: {}",
                fields.total_epochs
            );
        }
        if self.max_steps_per_epoch != fields.max_steps_per_epoch {
            warn!(
                "Config value for max_steps_per_epoch does not match checkpoint value, using the checkpoint value: {:?}",
                fields.max_steps_per_epoch
            );
        }
        self.seed = fields.seed;
        self.epochs_run = fields.epochs_run;
        self.total_epochs = fields.total_epochs;
        self.max_steps_per_epoch = fields.max_steps_per_epoch;
    }

    /// Re-derive the global step from completed epochs
    pub fn sync_global_step(&mut self, steps_per_epoch: usize) {
        self.global_step = self.epochs_run * steps_per_epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RecipeState {
        RecipeState {
            seed: 42,
            epochs_run: 0,
            total_epochs: 3,
            max_steps_per_epoch: None,
            global_step: 0,
            gradient_accumulation_steps: 2,
            resume_from_checkpoint: false,
            clip_grad_norm: None,
            save_adapter_weights_only: false,
        }
    }

    #[test]
    fn test_intermediate_epochs() {
        let s = state();
        assert!(s.is_intermediate(0));
        assert!(s.is_intermediate(1));
        assert!(!s.is_intermediate(2));
    }

    #[test]
    fn test_restore_from_fields() {
        let mut s = state();
        let fields = RecipeStateFields {
            seed: 7,
            epochs_run: 2,
            total_epochs: 4,
            max_steps_per_epoch: Some(5),
        };
        s.update_from_checkpoint(&fields);
        s.sync_global_step(5);

        assert_eq!(s.seed, 7);
        assert_eq!(s.epochs_run, 2);
        assert_eq!(s.total_epochs, 4);
        assert_eq!(s.global_step, 10);
        assert_eq!(s.checkpoint_fields(), fields);
    }
}
