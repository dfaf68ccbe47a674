//! Adapter parameter bookkeeping
//!
//! Derives the trainable parameter set from a model, applies it, and checks
//! that loaded weights line up with the adapter configuration.

use candle_core::{DType, Var};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{RecipeError, Result};
use crate::models::CausalLm;

/// Live adapter parameters keyed by their full name
pub type AdapterParams = BTreeMap<String, Var>;

/// Collect the parameters every adapter module of `model` reports
pub fn get_adapter_params(model: &dyn CausalLm) -> Result<AdapterParams> {
    let store = model.parameters();
    let mut params = AdapterParams::new();

    for module in model.adapter_modules() {
        for suffix in module.adapter_params() {
            let name = format!("{}.{}", module.module_path(), suffix);
            let var = store.var(&name).ok_or_else(|| {
                RecipeError::adapter_mismatch(format!(
                    "adapter module {} reports '{}' but the model has no such parameter",
                    module.module_path(),
                    name
                ))
            })?;
            params.insert(name, var.clone());
        }
    }

    debug!("Found {} adapter parameters", params.len());
    Ok(params)
}

/// Whether the adapter set carries DoRA magnitudes
pub fn is_dora(adapter_params: &AdapterParams) -> bool {
    adapter_params.keys().any(|k| k.contains("magnitude"))
}

/// Mark exactly the adapter parameters as trainable, freeze everything else
pub fn set_trainable_params(model: &mut dyn CausalLm, adapter_params: &AdapterParams) -> Result<()> {
    let store = model.parameters_mut();
    let names: Vec<String> = store.names().map(str::to_string).collect();
    for name in names {
        let trainable = adapter_params.contains_key(&name);
        store.set_requires_grad(&name, trainable)?;
    }
    Ok(())
}

/// Module names that carry adapters, in the order they appear in adapter configs
pub fn get_lora_module_names(
    lora_attn_modules: &[String],
    apply_lora_to_mlp: bool,
    apply_lora_to_output: bool,
) -> Vec<String> {
    let mut names = lora_attn_modules.to_vec();
    if apply_lora_to_mlp {
        names.extend(["w1", "w2", "w3"].map(String::from));
    }
    if apply_lora_to_output {
        names.push("output".to_string());
    }
    names
}

fn is_lora_key(key: &str, lora_modules: &[String]) -> bool {
    lora_modules.iter().any(|m| {
        key.contains(&format!("{}.lora", m)) || key.contains(&format!("{}.magnitude", m))
    })
}

/// Keys left over from loading base weights and (optionally) adapter weights
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadReport<'a> {
    pub base_missing: Option<&'a [String]>,
    pub base_unexpected: Option<&'a [String]>,
    pub lora_missing: Option<&'a [String]>,
    pub lora_unexpected: Option<&'a [String]>,
}

/// Fail on any missing or unexpected key the adapter configuration does not explain
///
/// Base weights may only be missing adapter keys. Adapter weights may only be
/// missing base keys. Neither load may bring in keys the model does not have.
pub fn validate_missing_and_unexpected_for_lora(
    lora_attn_modules: &[String],
    apply_lora_to_mlp: bool,
    apply_lora_to_output: bool,
    report: LoadReport<'_>,
) -> Result<()> {
    let lora_modules =
        get_lora_module_names(lora_attn_modules, apply_lora_to_mlp, apply_lora_to_output);

    if let Some(base_missing) = report.base_missing {
        if let Some(k) = base_missing.iter().find(|k| !is_lora_key(k, &lora_modules)) {
            return Err(RecipeError::adapter_mismatch(format!(
                "Missing non-LoRA key {} from base model dict",
                k
            )));
        }
    }
    if let Some(base_unexpected) = report.base_unexpected {
        if !base_unexpected.is_empty() {
            return Err(RecipeError::adapter_mismatch(format!(
                "Unexpected key loading base model: {}",
                base_unexpected.join(", ")
            )));
        }
    }
    if let Some(lora_missing) = report.lora_missing {
        if let Some(k) = lora_missing.iter().find(|k| is_lora_key(k, &lora_modules)) {
            return Err(RecipeError::adapter_mismatch(format!(
                "Missing LoRA key {} from adapter state dict",
                k
            )));
        }
    }
    if let Some(lora_unexpected) = report.lora_unexpected {
        if !lora_unexpected.is_empty() {
            return Err(RecipeError::adapter_mismatch(format!(
                "Unexpected key loading adapter: {}",
                lora_unexpected.join(", ")
            )));
        }
    }
    Ok(())
}

/// Every adapter parameter must already be in the compute dtype
pub fn validate_expected_param_dtype(adapter_params: &AdapterParams, dtype: DType) -> Result<()> {
    for (name, var) in adapter_params {
        if var.dtype() != dtype {
            return Err(RecipeError::DtypeMismatch {
                name: name.clone(),
                expected: dtype,
                actual: var.dtype(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn modules() -> Vec<String> {
        vec!["q_proj".to_string(), "v_proj".to_string()]
    }

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_module_names() {
        assert_eq!(
            get_lora_module_names(&modules(), true, true),
            vec!["q_proj", "v_proj", "w1", "w2", "w3", "output"]
        );
        assert_eq!(get_lora_module_names(&modules(), false, false), modules());
    }

    #[test]
    fn test_base_missing_only_adapter_keys() {
        let missing = keys(&[
            "layers.0.attn.q_proj.lora_a.weight",
            "layers.0.attn.v_proj.lora_b.weight",
        ]);
        let report = LoadReport {
            base_missing: Some(missing.as_slice()),
            base_unexpected: Some(&[]),
            ..Default::default()
        };
        assert!(validate_missing_and_unexpected_for_lora(&modules(), false, false, report).is_ok());
    }

    #[test]
    fn test_base_missing_real_weight_fails() {
        let missing = keys(&["layers.0.attn.q_proj.weight"]);
        let report = LoadReport {
            base_missing: Some(missing.as_slice()),
            ..Default::default()
        };
        let err =
            validate_missing_and_unexpected_for_lora(&modules(), false, false, report).unwrap_err();
        assert!(err.to_string().contains("layers.0.attn.q_proj.weight"));
    }

    #[test]
    fn test_untargeted_adapter_key_is_not_explained() {
        // k_proj adapters exist in the model but the config does not target k_proj
        let missing = keys(&["layers.0.attn.k_proj.lora_a.weight"]);
        let report = LoadReport {
            base_missing: Some(missing.as_slice()),
            ..Default::default()
        };
        assert!(validate_missing_and_unexpected_for_lora(&modules(), false, false, report).is_err());
    }

    #[test]
    fn test_lora_side_checks() {
        let missing = keys(&["layers.0.attn.q_proj.lora_a.weight"]);
        let report = LoadReport {
            lora_missing: Some(missing.as_slice()),
            ..Default::default()
        };
        assert!(validate_missing_and_unexpected_for_lora(&modules(), false, false, report).is_err());

        let unexpected = keys(&["layers.9.attn.q_proj.lora_a.weight"]);
        let report = LoadReport {
            lora_unexpected: Some(unexpected.as_slice()),
            ..Default::default()
        };
        assert!(validate_missing_and_unexpected_for_lora(&modules(), false, false, report).is_err());

        let base_keys = keys(&["tok_embeddings.weight", "output.weight"]);
        let report = LoadReport {
            lora_missing: Some(base_keys.as_slice()),
            lora_unexpected: Some(&[]),
            ..Default::default()
        };
        assert!(validate_missing_and_unexpected_for_lora(&modules(), false, false, report).is_ok());
    }

    #[test]
    fn test_dtype_validation_and_dora_detection() {
        let t = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        let mut params = AdapterParams::new();
        params.insert("a.lora_a.weight".to_string(), Var::from_tensor(&t).unwrap());
        assert!(!is_dora(&params));
        assert!(validate_expected_param_dtype(&params, DType::F32).is_ok());

        let err = validate_expected_param_dtype(&params, DType::BF16).unwrap_err();
        assert!(matches!(err, RecipeError::DtypeMismatch { .. }));

        params.insert(
            "a.magnitude".to_string(),
            Var::from_tensor(&Tensor::ones(2, DType::F32, &Device::Cpu).unwrap()).unwrap(),
        );
        assert!(is_dora(&params));
    }
}
