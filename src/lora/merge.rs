//! Folding adapter deltas into base weights for deployable checkpoints

use candle_core::{DType, Tensor};
use std::collections::BTreeSet;

use super::layer::row_norm;
use super::params::StateDict;
use crate::error::{RecipeError, Result};

/// Merge every LoRA pair in `state_dict` into its base weight
///
/// For each module carrying `lora_a.weight` and `lora_b.weight`, the merged
/// weight is `W + (alpha / rank) * B A`. When the module also has a DoRA
/// `magnitude`, each row is rescaled to `magnitude / ‖W + (alpha / rank) * B A‖`.
/// Adapter entries are dropped from the result. The input is never modified.
pub fn get_merged_lora_ckpt(state_dict: &StateDict, rank: usize, alpha: f64) -> Result<StateDict> {
    if rank == 0 {
        return Err(RecipeError::config("cannot merge adapters of rank 0"));
    }
    let scaling = alpha / rank as f64;

    let lora_modules: BTreeSet<&str> = state_dict
        .keys()
        .filter_map(|k| k.strip_suffix(".lora_a.weight"))
        .collect();

    let mut merged = StateDict::new();
    for (key, value) in state_dict {
        let is_adapter_key = key.ends_with(".lora_a.weight")
            || key.ends_with(".lora_b.weight")
            || key.ends_with(".magnitude");
        if !is_adapter_key {
            merged.insert(key.clone(), value.clone());
        }
    }

    for module in lora_modules {
        let weight_key = format!("{}.weight", module);
        let lookup = |key: &str| {
            state_dict.get(key).ok_or_else(|| {
                RecipeError::checkpoint(format!("cannot merge {}: missing '{}'", module, key))
            })
        };
        let weight = lookup(&weight_key)?;
        let lora_a = lookup(&format!("{}.lora_a.weight", module))?;
        let lora_b = lookup(&format!("{}.lora_b.weight", module))?;
        let magnitude = state_dict.get(&format!("{}.magnitude", module));

        let merged_weight = merge_module(weight, lora_a, lora_b, magnitude, scaling)?;
        merged.insert(weight_key, merged_weight);
    }

    Ok(merged)
}

/// Merge a single module, computing in f32 and returning the base dtype
pub fn merge_module(
    weight: &Tensor,
    lora_a: &Tensor,
    lora_b: &Tensor,
    magnitude: Option<&Tensor>,
    scaling: f64,
) -> Result<Tensor> {
    let dtype = weight.dtype();
    let w = weight.to_dtype(DType::F32)?;
    let a = lora_a.to_dtype(DType::F32)?.to_device(w.device())?;
    let b = lora_b.to_dtype(DType::F32)?.to_device(w.device())?;

    let delta = b.matmul(&a)?.affine(scaling, 0.0)?;
    let mut merged = (w + delta)?;

    if let Some(magnitude) = magnitude {
        let m = magnitude.to_dtype(DType::F32)?.to_device(merged.device())?;
        let scale = m.div(&row_norm(&merged)?)?.unsqueeze(1)?;
        merged = merged.broadcast_mul(&scale)?;
    }

    Ok(merged.to_dtype(dtype)?)
}
