//! Configuration management for fine-tuning recipes.
//!
//! Configuration is loaded through multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. User-specified configuration file
//! 3. Environment variables (prefixed with `KDTUNE__`, `__` separates nesting)
//! 4. Command-line `key=value` overrides
//!
//! Later sources override earlier ones. Each component section carries a
//! `component` name that the [`ComponentRegistry`](crate::registry::ComponentRegistry)
//! resolves to a constructor.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RecipeError, Result};

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Full recipe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeConfig {
    /// Target device: `cpu`, `cuda`, `cuda:N`, `metal`, `metal:N`
    pub device: String,
    /// Requested precision: `fp32`, `bf16` (`fp16` is rejected)
    pub dtype: String,
    pub output_dir: PathBuf,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub log_peak_memory_stats: bool,
    /// Random seed; drawn at startup when unset
    #[serde(default)]
    pub seed: Option<u64>,
    pub epochs: usize,
    #[serde(default)]
    pub max_steps_per_epoch: Option<usize>,
    #[serde(default)]
    pub resume_from_checkpoint: bool,
    #[serde(default)]
    pub save_adapter_weights_only: bool,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
    #[serde(default)]
    pub clip_grad_norm: Option<f64>,
    #[serde(default)]
    pub compile: bool,
    #[serde(default)]
    pub enable_activation_checkpointing: bool,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    pub batch_size: usize,

    pub model: ModelConfig,
    pub tokenizer: TokenizerConfig,
    pub optimizer: OptimizerConfig,
    pub lr_scheduler: SchedulerConfig,
    pub loss: LossConfig,
    pub dataset: DatasetSection,
    pub checkpointer: CheckpointerConfig,
    pub metric_logger: MetricLoggerConfig,
    #[serde(default)]
    pub profiler: ProfilerConfig,
}

/// Model construction and adapter placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub component: String,
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub num_layers: usize,
    pub max_seq_len: usize,
    #[serde(default = "default_intermediate_dim")]
    pub intermediate_dim: usize,
    /// Attention projections that receive adapters (`q_proj`, `k_proj`, `v_proj`, `output_proj`)
    pub lora_attn_modules: Vec<String>,
    #[serde(default)]
    pub apply_lora_to_mlp: bool,
    #[serde(default)]
    pub apply_lora_to_output: bool,
    pub lora_rank: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub use_dora: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    pub component: String,
    #[serde(default)]
    pub pad_id: i64,
    #[serde(default)]
    pub vocab_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub component: String,
    pub lr: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default)]
    pub momentum: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub component: String,
    #[serde(default)]
    pub num_warmup_steps: usize,
    #[serde(default = "default_num_cycles")]
    pub num_cycles: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    pub component: String,
    #[serde(default = "default_ignore_index")]
    pub ignore_index: i64,
    #[serde(default = "default_num_output_chunks")]
    pub num_output_chunks: usize,
}

/// One dataset or a list of datasets to concatenate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatasetSection {
    Single(DatasetConfig),
    Many(Vec<DatasetConfig>),
}

impl DatasetSection {
    pub fn configs(&self) -> Vec<&DatasetConfig> {
        match self {
            DatasetSection::Single(cfg) => vec![cfg],
            DatasetSection::Many(cfgs) => cfgs.iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub component: String,
    pub path: PathBuf,
    /// Drop samples longer than this many tokens
    #[serde(default)]
    pub max_seq_len: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointerConfig {
    pub component: String,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_files: Vec<String>,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub adapter_checkpoint: Option<String>,
    #[serde(default)]
    pub recipe_checkpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricLoggerConfig {
    pub component: String,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

/// Memory instrumentation window, active during the first epoch only
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub profile_memory: bool,
    #[serde(default)]
    pub wait_steps: usize,
    #[serde(default)]
    pub warmup_steps: usize,
    #[serde(default)]
    pub active_steps: usize,
}

fn default_log_every_n_steps() -> usize {
    1
}

fn default_gradient_accumulation_steps() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_intermediate_dim() -> usize {
    128
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_eps() -> f64 {
    1e-8
}

fn default_num_cycles() -> f64 {
    0.5
}

fn default_ignore_index() -> i64 {
    -100
}

fn default_num_output_chunks() -> usize {
    8
}

impl RecipeConfig {
    /// Load configuration from all sources
    pub fn load(path: Option<&Path>, overrides: &[String]) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            DEFAULT_CONFIG,
            config::FileFormat::Toml,
        ));

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("KDTUNE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        for opt in overrides {
            let (key, value) = opt.split_once('=').ok_or_else(|| {
                RecipeError::config(format!("override '{}' is not of the form key=value", opt))
            })?;
            builder = builder.set_override(key.trim(), value.trim())?;
        }

        let config: RecipeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string layered over the defaults (used by tests and tooling)
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: RecipeConfig = config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject structurally invalid values before any component is built
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(RecipeError::config("epochs must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(RecipeError::config("batch_size must be at least 1"));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(RecipeError::config(
                "gradient_accumulation_steps must be at least 1",
            ));
        }
        if self.log_every_n_steps == 0 {
            return Err(RecipeError::config("log_every_n_steps must be at least 1"));
        }
        if self.max_steps_per_epoch == Some(0) {
            return Err(RecipeError::config("max_steps_per_epoch must be at least 1 when set"));
        }
        if self.model.lora_rank == 0 {
            return Err(RecipeError::config("model.lora_rank must be at least 1"));
        }
        if let Some(max_norm) = self.clip_grad_norm {
            if max_norm.is_nan() || max_norm <= 0.0 {
                return Err(RecipeError::config(format!(
                    "clip_grad_norm must be positive, got {}",
                    max_norm
                )));
            }
        }
        if self.checkpointer.checkpoint_files.is_empty() {
            return Err(RecipeError::config(
                "checkpointer.checkpoint_files must name at least one file",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        output_dir = "/tmp/kdtune-out"

        [checkpointer]
        component = "safetensors"
        checkpoint_dir = "/tmp/base"
        checkpoint_files = ["model.safetensors"]
        output_dir = "/tmp/kdtune-out"
    "#;

    fn minimal() -> String {
        format!(
            "{}\n[dataset]\ncomponent = \"jsonl\"\npath = \"/tmp/train.jsonl\"\n",
            BASE
        )
    }

    #[test]
    fn test_defaults_fill_in() {
        let cfg = RecipeConfig::from_toml_str(&minimal()).unwrap();
        assert_eq!(cfg.device, "cpu");
        assert_eq!(cfg.dtype, "fp32");
        assert_eq!(cfg.log_every_n_steps, 1);
        assert_eq!(cfg.loss.ignore_index, -100);
        assert!(cfg.clip_grad_norm.is_none());
        assert_eq!(cfg.dataset.configs().len(), 1);
        assert_eq!(cfg.model.lora_attn_modules, vec!["q_proj", "v_proj"]);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recipe.toml");
        std::fs::write(&path, minimal()).unwrap();

        let cfg = RecipeConfig::load(
            Some(&path),
            &[
                "epochs=3".to_string(),
                "gradient_accumulation_steps=4".to_string(),
                "model.lora_rank=16".to_string(),
            ],
        )
        .unwrap();
        assert_eq!(cfg.epochs, 3);
        assert_eq!(cfg.gradient_accumulation_steps, 4);
        assert_eq!(cfg.model.lora_rank, 16);
    }

    #[test]
    fn test_malformed_override() {
        let err = RecipeConfig::load(None, &["epochs".to_string()]).unwrap_err();
        assert!(matches!(err, RecipeError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let mut cfg = RecipeConfig::from_toml_str(&minimal()).unwrap();
        cfg.gradient_accumulation_steps = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RecipeConfig::from_toml_str(&minimal()).unwrap();
        cfg.clip_grad_norm = Some(-1.0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_dataset_list_concatenates() {
        let toml = format!(
            "{}\n{}",
            BASE,
            r#"
            [[dataset]]
            component = "jsonl"
            path = "/tmp/a.jsonl"

            [[dataset]]
            component = "jsonl"
            path = "/tmp/b.jsonl"
            "#
        );
        let cfg = RecipeConfig::from_toml_str(&toml).unwrap();
        assert_eq!(cfg.dataset.configs().len(), 2);
    }
}
