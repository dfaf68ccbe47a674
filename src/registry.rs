//! Name-to-constructor resolution for recipe components
//!
//! Every config section names its implementation through a `component` string.
//! The registry maps those names to constructors; [`ComponentRegistry::with_defaults`]
//! registers the implementations that ship with this crate and callers can
//! register their own under new names or replace a default.

use candle_core::Var;
use std::collections::HashMap;
use tracing::debug;

use crate::config::{
    CheckpointerConfig, DatasetConfig, LossConfig, MetricLoggerConfig, ModelConfig,
    OptimizerConfig, RecipeConfig, SchedulerConfig, TokenizerConfig,
};
use crate::error::{RecipeError, Result};
use crate::models::{CausalLm, LoraTinyLm, ModelBuildContext};
use crate::training::{
    AdamW, Checkpointer, ChunkedCrossEntropyLoss, ConstantLr, CosineWithWarmup,
    CrossEntropyLoss, Dataset, DiskLogger, JsonlDataset, LossFn, LrScheduler, MetricLogger,
    Optimizer, PretokenizedTokenizer, SafetensorsCheckpointer, Sgd, StdoutLogger, Tokenizer,
};

pub type ModelFactory = Box<dyn Fn(&ModelConfig, &ModelBuildContext) -> Result<Box<dyn CausalLm>>>;
pub type TokenizerFactory = Box<dyn Fn(&TokenizerConfig) -> Result<Box<dyn Tokenizer>>>;
pub type OptimizerFactory =
    Box<dyn Fn(Vec<(String, Var)>, &OptimizerConfig) -> Result<Box<dyn Optimizer>>>;
pub type LossFactory = Box<dyn Fn(&LossConfig) -> Result<Box<dyn LossFn>>>;
pub type DatasetFactory = Box<dyn Fn(&DatasetConfig, &dyn Tokenizer) -> Result<Box<dyn Dataset>>>;
pub type CheckpointerFactory =
    Box<dyn Fn(&CheckpointerConfig, bool) -> Result<Box<dyn Checkpointer>>>;
pub type MetricLoggerFactory = Box<dyn Fn(&MetricLoggerConfig) -> Result<Box<dyn MetricLogger>>>;

/// Arguments a learning-rate scheduler is built with
pub struct SchedulerArgs<'a> {
    pub optimizer: &'a mut dyn Optimizer,
    pub config: &'a SchedulerConfig,
    pub num_training_steps: usize,
    /// Index of the last completed step; `-1` for a fresh run
    pub last_epoch: i64,
}

pub type SchedulerFactory = Box<dyn Fn(SchedulerArgs<'_>) -> Result<Box<dyn LrScheduler>>>;

/// Registered constructors, one table per component kind
#[derive(Default)]
pub struct ComponentRegistry {
    models: HashMap<String, ModelFactory>,
    tokenizers: HashMap<String, TokenizerFactory>,
    optimizers: HashMap<String, OptimizerFactory>,
    schedulers: HashMap<String, SchedulerFactory>,
    losses: HashMap<String, LossFactory>,
    datasets: HashMap<String, DatasetFactory>,
    checkpointers: HashMap<String, CheckpointerFactory>,
    metric_loggers: HashMap<String, MetricLoggerFactory>,
}

fn lookup<'a, T>(table: &'a HashMap<String, T>, kind: &'static str, name: &str) -> Result<&'a T> {
    table.get(name).ok_or_else(|| RecipeError::component_not_found(kind, name))
}

impl ComponentRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in component
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register_model("lora_tiny_lm", |cfg, ctx| {
            Ok(Box::new(LoraTinyLm::new(cfg, ctx)?) as Box<dyn CausalLm>)
        });

        registry.register_tokenizer("pretokenized", |cfg| {
            Ok(Box::new(PretokenizedTokenizer::new(cfg.pad_id, cfg.vocab_size)) as Box<dyn Tokenizer>)
        });

        registry.register_optimizer("adamw", |params, cfg| {
            Ok(Box::new(AdamW::new(params, cfg)?) as Box<dyn Optimizer>)
        });
        registry.register_optimizer("sgd", |params, cfg| {
            Ok(Box::new(Sgd::new(params, cfg)?) as Box<dyn Optimizer>)
        });

        registry.register_lr_scheduler("cosine_with_warmup", |args| {
            Ok(Box::new(CosineWithWarmup::new(
                args.optimizer,
                args.config.num_warmup_steps,
                args.num_training_steps,
                args.config.num_cycles,
                args.last_epoch,
            )) as Box<dyn LrScheduler>)
        });
        registry.register_lr_scheduler("constant", |args| {
            Ok(Box::new(ConstantLr::new(args.optimizer, args.last_epoch)) as Box<dyn LrScheduler>)
        });

        registry.register_loss("cross_entropy", |cfg| {
            Ok(Box::new(CrossEntropyLoss::new(cfg.ignore_index)) as Box<dyn LossFn>)
        });
        registry.register_loss("chunked_cross_entropy", |cfg| {
            Ok(Box::new(ChunkedCrossEntropyLoss::new(
                cfg.num_output_chunks,
                cfg.ignore_index,
            )) as Box<dyn LossFn>)
        });

        registry.register_dataset("jsonl", |cfg, tokenizer| {
            Ok(Box::new(JsonlDataset::from_jsonl(&cfg.path, tokenizer, cfg.max_seq_len)?)
                as Box<dyn Dataset>)
        });

        registry.register_checkpointer("safetensors", |cfg, resume| {
            Ok(Box::new(SafetensorsCheckpointer::new(cfg, resume)) as Box<dyn Checkpointer>)
        });

        registry.register_metric_logger("stdout", |_| {
            Ok(Box::new(StdoutLogger) as Box<dyn MetricLogger>)
        });
        registry.register_metric_logger("disk", |cfg| {
            let log_dir = cfg.log_dir.as_deref().ok_or_else(|| {
                RecipeError::config("metric_logger.log_dir is required for the disk logger")
            })?;
            Ok(Box::new(DiskLogger::new(log_dir)?) as Box<dyn MetricLogger>)
        });

        registry
    }

    pub fn register_model<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ModelConfig, &ModelBuildContext) -> Result<Box<dyn CausalLm>> + 'static,
    {
        debug!("Registering model component '{}'", name);
        self.models.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_tokenizer<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&TokenizerConfig) -> Result<Box<dyn Tokenizer>> + 'static,
    {
        self.tokenizers.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_optimizer<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(Vec<(String, Var)>, &OptimizerConfig) -> Result<Box<dyn Optimizer>> + 'static,
    {
        self.optimizers.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_lr_scheduler<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(SchedulerArgs<'_>) -> Result<Box<dyn LrScheduler>> + 'static,
    {
        self.schedulers.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_loss<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&LossConfig) -> Result<Box<dyn LossFn>> + 'static,
    {
        self.losses.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_dataset<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&DatasetConfig, &dyn Tokenizer) -> Result<Box<dyn Dataset>> + 'static,
    {
        self.datasets.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_checkpointer<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&CheckpointerConfig, bool) -> Result<Box<dyn Checkpointer>> + 'static,
    {
        self.checkpointers.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_metric_logger<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&MetricLoggerConfig) -> Result<Box<dyn MetricLogger>> + 'static,
    {
        self.metric_loggers.insert(name.to_string(), Box::new(factory));
    }

    pub fn build_model(&self, cfg: &ModelConfig, ctx: &ModelBuildContext) -> Result<Box<dyn CausalLm>> {
        (lookup(&self.models, "model", &cfg.component)?)(cfg, ctx)
    }

    pub fn build_tokenizer(&self, cfg: &TokenizerConfig) -> Result<Box<dyn Tokenizer>> {
        (lookup(&self.tokenizers, "tokenizer", &cfg.component)?)(cfg)
    }

    pub fn build_optimizer(
        &self,
        params: Vec<(String, Var)>,
        cfg: &OptimizerConfig,
    ) -> Result<Box<dyn Optimizer>> {
        (lookup(&self.optimizers, "optimizer", &cfg.component)?)(params, cfg)
    }

    pub fn build_lr_scheduler(&self, args: SchedulerArgs<'_>) -> Result<Box<dyn LrScheduler>> {
        (lookup(&self.schedulers, "lr_scheduler", &args.config.component)?)(args)
    }

    pub fn build_loss(&self, cfg: &LossConfig) -> Result<Box<dyn LossFn>> {
        (lookup(&self.losses, "loss", &cfg.component)?)(cfg)
    }

    pub fn build_dataset(&self, cfg: &DatasetConfig, tokenizer: &dyn Tokenizer) -> Result<Box<dyn Dataset>> {
        (lookup(&self.datasets, "dataset", &cfg.component)?)(cfg, tokenizer)
    }

    pub fn build_checkpointer(&self, cfg: &CheckpointerConfig, resume: bool) -> Result<Box<dyn Checkpointer>> {
        (lookup(&self.checkpointers, "checkpointer", &cfg.component)?)(cfg, resume)
    }

    pub fn build_metric_logger(&self, cfg: &MetricLoggerConfig) -> Result<Box<dyn MetricLogger>> {
        (lookup(&self.metric_loggers, "metric_logger", &cfg.component)?)(cfg)
    }

    /// Fail fast on any component name the registry cannot resolve
    pub fn check_config(&self, cfg: &RecipeConfig) -> Result<()> {
        lookup(&self.models, "model", &cfg.model.component)?;
        lookup(&self.tokenizers, "tokenizer", &cfg.tokenizer.component)?;
        lookup(&self.optimizers, "optimizer", &cfg.optimizer.component)?;
        lookup(&self.schedulers, "lr_scheduler", &cfg.lr_scheduler.component)?;
        lookup(&self.losses, "loss", &cfg.loss.component)?;
        for dataset in cfg.dataset.configs() {
            lookup(&self.datasets, "dataset", &dataset.component)?;
        }
        lookup(&self.checkpointers, "checkpointer", &cfg.checkpointer.component)?;
        lookup(&self.metric_loggers, "metric_logger", &cfg.metric_logger.component)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RecipeConfig {
        RecipeConfig::from_toml_str(
            r#"
            [dataset]
            component = "jsonl"
            path = "/tmp/train.jsonl"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_resolve_default_config() {
        let registry = ComponentRegistry::with_defaults();
        registry.check_config(&config()).unwrap();
    }

    #[test]
    fn test_unknown_component() {
        let registry = ComponentRegistry::with_defaults();
        let mut cfg = config();
        cfg.loss.component = "focal".to_string();

        match registry.build_loss(&cfg.loss) {
            Err(RecipeError::ComponentNotFound { kind, name }) => {
                assert_eq!(kind, "loss");
                assert_eq!(name, "focal");
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("unknown loss resolved"),
        }
        assert!(registry.check_config(&cfg).is_err());
    }

    #[test]
    fn test_chunked_loss_reports_chunks() {
        let registry = ComponentRegistry::with_defaults();
        let mut cfg = config();
        cfg.loss.component = "chunked_cross_entropy".to_string();
        cfg.loss.num_output_chunks = 4;

        let loss = registry.build_loss(&cfg.loss).unwrap();
        assert_eq!(loss.num_output_chunks(), Some(4));
    }

    #[test]
    fn test_custom_registration_overrides() {
        let mut registry = ComponentRegistry::with_defaults();
        registry.register_loss("cross_entropy", |_| {
            Ok(Box::new(CrossEntropyLoss::new(-1)) as Box<dyn LossFn>)
        });
        let loss = registry.build_loss(&config().loss).unwrap();
        assert_eq!(loss.ignore_index(), -1);
    }

    #[test]
    fn test_disk_logger_needs_dir() {
        let registry = ComponentRegistry::with_defaults();
        let cfg = MetricLoggerConfig {
            component: "disk".to_string(),
            log_dir: None,
        };
        assert!(registry.build_metric_logger(&cfg).is_err());
    }
}
