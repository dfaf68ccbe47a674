//! Shared fixtures for recipe integration tests
//!
//! A fixture owns a temporary directory holding a base checkpoint for a tiny
//! model and a pre-tokenized JSONL dataset. Recording doubles are registered
//! through the component registry under their own names, so a test picks them
//! by setting the `component` of the matching config section.

#![allow(dead_code)]

use candle_core::{DType, Device, Var};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

use kdtune_core::config::RecipeConfig;
use kdtune_core::lora::StateDict;
use kdtune_core::models::{CausalLm, LoraTinyLm, ModelBuildContext};
use kdtune_core::runtime::{DeviceCapabilities, DeviceKind, MemoryStats};
use kdtune_core::training::checkpointer::save_state_dict;
use kdtune_core::training::{
    AdamW, CheckpointBundle, Checkpointer, CrossEntropyLoss, GradMap, LossFn, MetricLogger,
    Metrics, Optimizer, OptimizerState,
};
use kdtune_core::models::Logits;
use kdtune_core::{ComponentRegistry, LoraFinetuneRecipe, Result};

pub const VOCAB: usize = 32;
pub const SEQ_LEN: usize = 6;

/// Everything a recording double saw during a run
#[derive(Debug, Default)]
pub struct Events {
    pub optimizer_steps: usize,
    pub loss_calls: usize,
    /// `(epoch, intermediate, adapter_only, bundle keys)`
    pub saves: Vec<(usize, bool, bool, Vec<&'static str>)>,
    pub logged: Vec<(usize, Metrics)>,
    pub memory_toggles: Vec<bool>,
    pub closed: bool,
}

pub type SharedEvents = Rc<RefCell<Events>>;

pub struct Fixture {
    pub dir: TempDir,
    pub config: RecipeConfig,
    pub events: SharedEvents,
}

impl Fixture {
    pub fn base_dir(&self) -> PathBuf {
        self.dir.path().join("base")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    /// Registry with the built-ins plus every recording double
    pub fn registry(&self) -> ComponentRegistry {
        let mut registry = ComponentRegistry::with_defaults();

        let events = self.events.clone();
        let base = read_base(&self.base_dir());
        registry.register_checkpointer("recording", move |_, _| {
            Ok(Box::new(RecordingCheckpointer {
                events: events.clone(),
                base: base.clone(),
            }) as Box<dyn Checkpointer>)
        });

        let events = self.events.clone();
        registry.register_optimizer("recording_adamw", move |params, cfg| {
            Ok(Box::new(RecordingOptimizer {
                inner: AdamW::new(params, cfg)?,
                events: events.clone(),
            }) as Box<dyn Optimizer>)
        });

        let events = self.events.clone();
        registry.register_loss("counting_cross_entropy", move |cfg| {
            Ok(Box::new(CountingLoss {
                inner: CrossEntropyLoss::new(cfg.ignore_index),
                events: events.clone(),
            }) as Box<dyn LossFn>)
        });

        let events = self.events.clone();
        registry.register_metric_logger("recording", move |_| {
            Ok(Box::new(RecordingLogger {
                events: events.clone(),
            }) as Box<dyn MetricLogger>)
        });

        registry
    }

    pub fn capabilities(&self) -> Box<dyn DeviceCapabilities> {
        Box::new(RecordingCapabilities {
            events: self.events.clone(),
            bf16: true,
        })
    }

    pub fn recipe(&self) -> Result<LoraFinetuneRecipe> {
        Ok(
            LoraFinetuneRecipe::new(self.config.clone(), self.registry(), self.capabilities())?
                .with_progress(false),
        )
    }
}

fn read_base(dir: &Path) -> StateDict {
    kdtune_core::training::checkpointer::load_state_dict(&dir.join("model.safetensors"))
        .unwrap_or_default()
}

fn is_adapter_key(key: &str) -> bool {
    key.contains(".lora_") || key.ends_with(".magnitude")
}

/// Base weights for the configured model: a fresh model without its adapter tensors
pub fn base_weights(config: &RecipeConfig) -> StateDict {
    let ctx = ModelBuildContext {
        dtype: DType::F32,
        device: Device::Cpu,
        seed: 1234,
    };
    let model = LoraTinyLm::new(&config.model, &ctx).unwrap();
    model
        .state_dict()
        .unwrap()
        .into_iter()
        .filter(|(k, _)| !is_adapter_key(k))
        .collect()
}

/// Deterministic pre-tokenized samples, one JSON record per line
pub fn write_dataset(path: &Path, num_samples: usize) {
    let lines: Vec<String> = (0..num_samples)
        .map(|i| {
            let tokens: Vec<i64> = (0..SEQ_LEN)
                .map(|j| ((i * 7 + j * 3) % (VOCAB - 1) + 1) as i64)
                .collect();
            serde_json::json!({ "tokens": tokens }).to_string()
        })
        .collect();
    std::fs::write(path, lines.join("\n")).unwrap();
}

/// Fixture with `num_samples` training samples and extra TOML layered on top
///
/// The extra TOML is appended to the top-level table, so it may set top-level
/// keys first and then open section tables. `epochs` and `log_every_n_steps`
/// come from the defaults unless the extra TOML sets them.
pub fn fixture(num_samples: usize, extra: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base");
    std::fs::create_dir_all(&base).unwrap();
    let data = dir.path().join("train.jsonl");
    write_dataset(&data, num_samples);

    let toml = format!(
        r#"
        device = "cpu"
        dtype = "fp32"
        output_dir = "{out}"
        seed = 42
        batch_size = 1
        {extra}

        [model]
        component = "lora_tiny_lm"
        vocab_size = {vocab}
        embed_dim = 16
        num_layers = 1
        max_seq_len = 16
        intermediate_dim = 32
        lora_attn_modules = ["q_proj", "v_proj"]
        lora_rank = 4
        lora_alpha = 8.0

        [optimizer]
        component = "recording_adamw"
        lr = 1e-2

        [lr_scheduler]
        component = "cosine_with_warmup"
        num_warmup_steps = 1

        [loss]
        component = "counting_cross_entropy"

        [dataset]
        component = "jsonl"
        path = "{data}"

        [checkpointer]
        component = "recording"
        checkpoint_dir = "{base}"
        checkpoint_files = ["model.safetensors"]
        output_dir = "{out}"

        [metric_logger]
        component = "recording"

        [tokenizer]
        component = "pretokenized"
        pad_id = 0
        vocab_size = {vocab}
        "#,
        out = dir.path().join("out").display(),
        data = data.display(),
        base = base.display(),
        vocab = VOCAB,
        extra = extra,
    );
    let config = RecipeConfig::from_toml_str(&toml).unwrap();
    save_state_dict(&base_weights(&config), &base.join("model.safetensors")).unwrap();

    Fixture {
        dir,
        config,
        events: SharedEvents::default(),
    }
}

/// Returns the base weights on load and records every save
pub struct RecordingCheckpointer {
    events: SharedEvents,
    base: StateDict,
}

impl Checkpointer for RecordingCheckpointer {
    fn load_checkpoint(&mut self) -> Result<CheckpointBundle> {
        Ok(CheckpointBundle {
            model_weights: self.base.clone(),
            ..Default::default()
        })
    }

    fn save_checkpoint(
        &mut self,
        bundle: &CheckpointBundle,
        epoch: usize,
        intermediate: bool,
        adapter_only: bool,
    ) -> Result<()> {
        self.events
            .borrow_mut()
            .saves
            .push((epoch, intermediate, adapter_only, bundle.keys()));
        Ok(())
    }
}

pub struct RecordingOptimizer {
    inner: AdamW,
    events: SharedEvents,
}

impl Optimizer for RecordingOptimizer {
    fn step(&mut self, grads: &GradMap) -> Result<()> {
        self.events.borrow_mut().optimizer_steps += 1;
        self.inner.step(grads)
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr)
    }

    fn initial_learning_rate(&self) -> f64 {
        self.inner.initial_learning_rate()
    }

    fn param_names(&self) -> Vec<String> {
        self.inner.param_names()
    }

    fn state_dict(&self) -> Result<OptimizerState> {
        self.inner.state_dict()
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        self.inner.load_state_dict(state)
    }
}

pub struct CountingLoss {
    inner: CrossEntropyLoss,
    events: SharedEvents,
}

impl LossFn for CountingLoss {
    fn ignore_index(&self) -> i64 {
        self.inner.ignore_index()
    }

    fn compute(&self, logits: Logits, labels: &candle_core::Tensor) -> Result<candle_core::Tensor> {
        self.events.borrow_mut().loss_calls += 1;
        self.inner.compute(logits, labels)
    }
}

pub struct RecordingLogger {
    events: SharedEvents,
}

impl MetricLogger for RecordingLogger {
    fn log_config(&mut self, _config: &RecipeConfig) -> Result<()> {
        Ok(())
    }

    fn log_dict(&mut self, metrics: &Metrics, step: usize) -> Result<()> {
        self.events.borrow_mut().logged.push((step, metrics.clone()));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.events.borrow_mut().closed = true;
        Ok(())
    }
}

/// Capabilities of a simulated machine
pub struct RecordingCapabilities {
    pub events: SharedEvents,
    pub bf16: bool,
}

impl DeviceCapabilities for RecordingCapabilities {
    fn supports_bf16(&self, device: DeviceKind) -> bool {
        !device.is_accelerator() || self.bf16
    }

    fn memory_stats(&self, _device: DeviceKind) -> Option<MemoryStats> {
        None
    }

    fn record_memory_history(&self, enabled: bool) {
        self.events.borrow_mut().memory_toggles.push(enabled);
    }
}

/// Live trainable variables by name
pub fn trainable(model: &dyn CausalLm) -> Vec<(String, Var)> {
    model.parameters().trainable_vars()
}
