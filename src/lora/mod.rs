//! LoRA / DoRA adapters
//!
//! This module provides:
//! - Named parameter storage with trainability flags
//! - LoRA and DoRA linear layers
//! - Adapter parameter discovery, freezing and load validation
//! - Merging adapter deltas into base weights for checkpoints

use serde::{Deserialize, Serialize};

pub mod adapter;
pub mod layer;
pub mod merge;
pub mod params;

pub use adapter::{
    get_adapter_params, get_lora_module_names, is_dora, set_trainable_params,
    validate_expected_param_dtype, validate_missing_and_unexpected_for_lora, AdapterParams,
    LoadReport,
};
pub use layer::{AdapterModule, AdapterSpec, LoRALinear};
pub use merge::get_merged_lora_ckpt;
pub use params::{LoadOutcome, ParameterStore, StateDict};

/// Adapter metadata written next to adapter weights for downstream loaders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    pub target_modules: Vec<String>,
    pub peft_type: String,
}

impl AdapterConfig {
    pub fn new(
        rank: usize,
        alpha: f64,
        lora_attn_modules: &[String],
        apply_lora_to_mlp: bool,
        apply_lora_to_output: bool,
    ) -> Self {
        Self {
            r: rank,
            lora_alpha: alpha,
            target_modules: get_lora_module_names(
                lora_attn_modules,
                apply_lora_to_mlp,
                apply_lora_to_output,
            ),
            peft_type: "LORA".to_string(),
        }
    }
}
