mod common;

use candle_core::{DType, Device, Tensor};
use common::{base_weights, fixture, Fixture, RecordingCapabilities};
use kdtune_core::training::checkpointer::save_state_dict;
use kdtune_core::{LoraFinetuneRecipe, RecipeError};

fn setup_error(fx: &Fixture) -> RecipeError {
    match fx.recipe().and_then(|r| r.setup()) {
        Ok(_) => panic!("setup succeeded"),
        Err(e) => e,
    }
}

#[test]
fn test_fp16_rejected() {
    let mut fx = fixture(2, "");
    fx.config.dtype = "fp16".to_string();
    assert!(matches!(fx.recipe(), Err(RecipeError::Config(_))));
}

#[test]
fn test_invalid_values_rejected_at_construction() {
    let mut fx = fixture(4, "");
    fx.config.gradient_accumulation_steps = 0;
    assert!(matches!(fx.recipe(), Err(RecipeError::Config(_))));

    let mut fx = fixture(4, "");
    fx.config.log_every_n_steps = 0;
    assert!(matches!(fx.recipe(), Err(RecipeError::Config(_))));
}

#[test]
fn test_bf16_needs_hardware_support() {
    let mut fx = fixture(2, "");
    fx.config.dtype = "bf16".to_string();
    fx.config.device = "cuda".to_string();
    let caps = Box::new(RecordingCapabilities {
        events: fx.events.clone(),
        bf16: false,
    });
    let result = LoraFinetuneRecipe::new(fx.config.clone(), fx.registry(), caps);
    assert!(matches!(result, Err(RecipeError::HardwareCapability(_))));
}

#[test]
fn test_bf16_on_cpu() {
    let mut fx = fixture(2, "");
    fx.config.dtype = "bf16".to_string();
    let caps = Box::new(RecordingCapabilities {
        events: fx.events.clone(),
        bf16: false,
    });
    let recipe = LoraFinetuneRecipe::new(fx.config.clone(), fx.registry(), caps).unwrap();
    assert_eq!(recipe.dtype(), DType::BF16);

    let session = recipe.with_progress(false).setup().unwrap();
    for var in session.adapter_params().values() {
        assert_eq!(var.dtype(), DType::BF16);
    }
}

#[test]
fn test_setup_state() {
    let fx = fixture(6, "gradient_accumulation_steps = 2");
    let recipe = fx.recipe().unwrap();
    assert_eq!(recipe.state().seed, 42);

    let session = recipe.setup().unwrap();
    assert_eq!(session.steps_per_epoch(), 3);
    assert_eq!(session.state().global_step, 0);

    // q and v projections in one layer, A and B each
    assert_eq!(session.adapter_params().len(), 4);
    assert_eq!(session.model().parameters().num_trainable(), 4);
    assert_eq!(session.optimizer().param_names().len(), 4);
    assert_eq!(
        session.adapter_config().target_modules,
        vec!["q_proj".to_string(), "v_proj".to_string()]
    );

    // warmup starts from zero
    assert_eq!(session.lr_scheduler().last_epoch(), 0);
    assert_eq!(session.optimizer().learning_rate(), 0.0);
}

#[test]
fn test_seed_drawn_when_unset() {
    let mut fx = fixture(2, "");
    fx.config.seed = None;
    let a = fx.recipe().unwrap().state().seed;
    let b = fx.recipe().unwrap().state().seed;
    // two draws from a 64-bit space
    assert_ne!(a, b);
}

#[test]
fn test_resume_rejected() {
    let mut fx = fixture(2, "");
    fx.config.resume_from_checkpoint = true;
    match setup_error(&fx) {
        RecipeError::UnsupportedFeature(msg) => {
            assert_eq!(msg, "Resume from checkpoint is not supported yet.")
        }
        e => panic!("unexpected error: {}", e),
    }
}

#[test]
fn test_unexpected_base_key() {
    let mut fx = fixture(2, "");
    fx.config.checkpointer.component = "safetensors".to_string();
    let mut weights = base_weights(&fx.config);
    weights.insert(
        "layers.0.attn.rotary.weight".to_string(),
        Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap(),
    );
    save_state_dict(&weights, &fx.base_dir().join("model.safetensors")).unwrap();

    assert!(matches!(setup_error(&fx), RecipeError::AdapterMismatch(_)));
}

#[test]
fn test_missing_base_weight() {
    let mut fx = fixture(2, "");
    fx.config.checkpointer.component = "safetensors".to_string();
    let mut weights = base_weights(&fx.config);
    weights.remove("norm.scale");
    save_state_dict(&weights, &fx.base_dir().join("model.safetensors")).unwrap();

    match setup_error(&fx) {
        RecipeError::AdapterMismatch(msg) => assert!(msg.contains("norm.scale")),
        e => panic!("unexpected error: {}", e),
    }
}

#[test]
fn test_base_weight_shape_mismatch() {
    let mut fx = fixture(2, "");
    fx.config.checkpointer.component = "safetensors".to_string();
    let mut weights = base_weights(&fx.config);
    weights.insert(
        "output.weight".to_string(),
        Tensor::zeros((3, 3), DType::F32, &Device::Cpu).unwrap(),
    );
    save_state_dict(&weights, &fx.base_dir().join("model.safetensors")).unwrap();

    assert!(matches!(setup_error(&fx), RecipeError::AdapterMismatch(_)));
}

#[test]
fn test_unknown_component() {
    let mut fx = fixture(2, "");
    fx.config.optimizer.component = "lion".to_string();
    match setup_error(&fx) {
        RecipeError::ComponentNotFound { kind, name } => {
            assert_eq!(kind, "optimizer");
            assert_eq!(name, "lion");
        }
        e => panic!("unexpected error: {}", e),
    }
}
