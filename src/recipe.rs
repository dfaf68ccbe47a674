//! Single-device LoRA/DoRA fine-tuning recipe
//!
//! [`LoraFinetuneRecipe::new`] applies the startup gates (device and precision)
//! and fixes the seed. [`LoraFinetuneRecipe::setup`] then builds every
//! collaborator in a fixed order and returns a [`TrainingSession`]:
//!
//! 1. metric logger, which records the resolved config
//! 2. checkpoint load (resuming is rejected here)
//! 3. model: adapters marked trainable, base weights loaded, keys and dtypes validated
//! 4. tokenizer
//! 5. optimizer over the trainable set
//! 6. loss, which tells the model its chunk count when it consumes chunked logits
//! 7. data pipeline
//! 8. learning-rate scheduler, sized from the data pipeline's step count
//! 9. ignore-label buffer for label shifting

use candle_core::{DType, Device};
use tracing::{debug, info};

use crate::config::RecipeConfig;
use crate::error::{RecipeError, Result};
use crate::lora::{
    get_adapter_params, is_dora, set_trainable_params, validate_expected_param_dtype,
    validate_missing_and_unexpected_for_lora, AdapterConfig, AdapterParams, LoadReport, StateDict,
};
use crate::models::{CausalLm, ModelBuildContext};
use crate::registry::{ComponentRegistry, SchedulerArgs};
use crate::runtime::{resolve_dtype, DeviceCapabilities, DeviceKind, Precision};
use crate::training::data_loader::build_dataset;
use crate::training::{
    CheckpointManager, DataLoader, DataPipeline, EngineSettings, IgnoreLabelCache, LoopComponents,
    LossFn, LrScheduler, MemoryProfileWindow, MetricLogger, Optimizer, RecipeState, SaveRequest,
    TrainingEngine,
};

/// A configured recipe that has passed the startup gates
pub struct LoraFinetuneRecipe {
    cfg: RecipeConfig,
    registry: ComponentRegistry,
    capabilities: Box<dyn DeviceCapabilities>,
    device_kind: DeviceKind,
    device: Device,
    dtype: DType,
    state: RecipeState,
    show_progress: bool,
}

impl LoraFinetuneRecipe {
    /// Resolve device and precision and fix the seed
    ///
    /// Fails with a configuration error for invalid values or fp16 on any
    /// device, and with a hardware-capability error for bf16 on an
    /// accelerator without support.
    pub fn new(
        cfg: RecipeConfig,
        registry: ComponentRegistry,
        capabilities: Box<dyn DeviceCapabilities>,
    ) -> Result<Self> {
        cfg.validate()?;
        let device_kind: DeviceKind = cfg.device.parse()?;
        let precision: Precision = cfg.dtype.parse()?;
        let dtype = resolve_dtype(precision, device_kind, capabilities.as_ref())?;
        let device = device_kind.materialize()?;

        let seed = cfg.seed.unwrap_or_else(rand::random::<u64>);
        info!("Using device {} with {:?} and seed {}", device_kind, dtype, seed);
        let state = RecipeState::from_config(&cfg, seed);

        Ok(Self {
            cfg,
            registry,
            capabilities,
            device_kind,
            device,
            dtype,
            state,
            show_progress: true,
        })
    }

    /// Draw an epoch progress bar (on by default)
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn state(&self) -> &RecipeState {
        &self.state
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Build every collaborator and return a session ready to train
    pub fn setup(self) -> Result<TrainingSession> {
        let LoraFinetuneRecipe {
            cfg,
            registry,
            capabilities,
            device_kind,
            device,
            dtype,
            mut state,
            show_progress,
        } = self;

        let mut metric_logger = registry.build_metric_logger(&cfg.metric_logger)?;
        metric_logger.log_config(&cfg)?;

        let checkpointer =
            registry.build_checkpointer(&cfg.checkpointer, state.resume_from_checkpoint)?;
        let mut checkpoints = CheckpointManager::new(checkpointer);
        let bundle = checkpoints.load(state.resume_from_checkpoint)?;

        let lora_weights = if state.resume_from_checkpoint {
            bundle.adapter_weights.as_ref()
        } else {
            None
        };
        let ctx = ModelBuildContext {
            dtype,
            device: device.clone(),
            seed: state.seed,
        };
        let (mut model, adapter_params) =
            setup_model(&cfg, &registry, &ctx, &bundle.model_weights, lora_weights)?;

        let tokenizer = registry.build_tokenizer(&cfg.tokenizer)?;
        info!("Tokenizer is initialized.");

        let trainable = model.parameters().trainable_vars();
        let mut optimizer = registry.build_optimizer(trainable.clone(), &cfg.optimizer)?;
        info!("Optimizer is initialized.");

        let loss_fn = registry.build_loss(&cfg.loss)?;
        if let Some(chunks) = loss_fn.num_output_chunks() {
            model.set_num_output_chunks(chunks);
        }
        info!("Loss is initialized.");

        let dataset = build_dataset(&cfg.dataset.configs(), tokenizer.as_ref(), |dcfg, tok| {
            registry.build_dataset(dcfg, tok)
        })?;
        let data: Box<dyn DataPipeline> = Box::new(DataLoader::new(
            dataset,
            cfg.shuffle,
            cfg.batch_size,
            tokenizer.pad_id(),
            loss_fn.ignore_index(),
        )?);

        let mut steps_per_epoch = data.len() / state.gradient_accumulation_steps;
        if let Some(max_steps) = state.max_steps_per_epoch {
            if max_steps < steps_per_epoch {
                steps_per_epoch = max_steps;
            }
        }
        state.sync_global_step(steps_per_epoch);

        let lr_scheduler = registry.build_lr_scheduler(SchedulerArgs {
            optimizer: optimizer.as_mut(),
            config: &cfg.lr_scheduler,
            num_training_steps: state.total_epochs * steps_per_epoch,
            last_epoch: state.global_step as i64 - 1,
        })?;
        info!("Learning rate scheduler is initialized.");

        let profiler = MemoryProfileWindow::from_config(&cfg.profiler);
        if profiler.profile_memory {
            debug!("Memory profiling window: {:?}", profiler);
        }

        let ignore_labels = IgnoreLabelCache::new(cfg.batch_size, loss_fn.ignore_index(), &device)?;

        let adapter_config = AdapterConfig::new(
            cfg.model.lora_rank,
            cfg.model.lora_alpha,
            &cfg.model.lora_attn_modules,
            cfg.model.apply_lora_to_mlp,
            cfg.model.apply_lora_to_output,
        );

        let engine = TrainingEngine::new(
            EngineSettings {
                steps_per_epoch,
                log_every_n_steps: cfg.log_every_n_steps,
                log_peak_memory_stats: cfg.log_peak_memory_stats,
                device,
                device_kind,
                profiler,
                show_progress,
            },
            trainable,
        );

        Ok(TrainingSession {
            state,
            model,
            adapter_params,
            adapter_config,
            optimizer,
            lr_scheduler,
            loss_fn,
            data,
            checkpoints,
            metric_logger,
            capabilities,
            ignore_labels,
            engine,
            steps_per_epoch,
        })
    }
}

/// Build the model and bring its weights and trainable set into a consistent state
fn setup_model(
    cfg: &RecipeConfig,
    registry: &ComponentRegistry,
    ctx: &ModelBuildContext,
    base_model_state_dict: &StateDict,
    lora_weights_state_dict: Option<&StateDict>,
) -> Result<(Box<dyn CausalLm>, AdapterParams)> {
    let mut model = registry.build_model(&cfg.model, ctx)?;

    let adapter_params = get_adapter_params(model.as_ref())?;
    let dora = is_dora(&adapter_params);
    set_trainable_params(model.as_mut(), &adapter_params)?;

    if cfg.compile {
        model.compile();
    }
    if cfg.enable_activation_checkpointing {
        model.enable_activation_checkpointing();
    }

    let base = model.load_state_dict(base_model_state_dict)?;
    if dora {
        model.load_dora_magnitudes()?;
    }
    let lora = match lora_weights_state_dict {
        Some(weights) => Some(model.load_state_dict(weights)?),
        None => None,
    };

    validate_missing_and_unexpected_for_lora(
        &cfg.model.lora_attn_modules,
        cfg.model.apply_lora_to_mlp,
        cfg.model.apply_lora_to_output,
        LoadReport {
            base_missing: Some(base.missing.as_slice()),
            base_unexpected: Some(base.unexpected.as_slice()),
            lora_missing: lora.as_ref().map(|o| o.missing.as_slice()),
            lora_unexpected: lora.as_ref().map(|o| o.unexpected.as_slice()),
        },
    )?;
    validate_expected_param_dtype(&adapter_params, ctx.dtype)?;

    let num_trainable = model.parameters().num_trainable();
    if num_trainable != adapter_params.len() {
        return Err(RecipeError::adapter_mismatch(format!(
            "{} trainable parameters but {} adapter parameters",
            num_trainable,
            adapter_params.len()
        )));
    }

    info!(
        "Model is initialized with precision {:?} ({} trainable tensors, {} trainable elements, DoRA: {})",
        ctx.dtype,
        num_trainable,
        model.parameters().num_trainable_elements(),
        dora
    );
    Ok((model, adapter_params))
}

/// A fully set-up recipe: owns the model, optimizer, data and checkpointing
pub struct TrainingSession {
    state: RecipeState,
    model: Box<dyn CausalLm>,
    adapter_params: AdapterParams,
    adapter_config: AdapterConfig,
    optimizer: Box<dyn Optimizer>,
    lr_scheduler: Box<dyn LrScheduler>,
    loss_fn: Box<dyn LossFn>,
    data: Box<dyn DataPipeline>,
    checkpoints: CheckpointManager,
    metric_logger: Box<dyn MetricLogger>,
    capabilities: Box<dyn DeviceCapabilities>,
    ignore_labels: IgnoreLabelCache,
    engine: TrainingEngine,
    steps_per_epoch: usize,
}

impl TrainingSession {
    /// Train from `epochs_run` to `total_epochs`, saving after every epoch
    pub fn train(&mut self) -> Result<()> {
        info!(
            "Training for {} epochs of {} steps",
            self.state.total_epochs - self.state.epochs_run.min(self.state.total_epochs),
            self.steps_per_epoch
        );
        self.engine.start_timer();
        for epoch in self.state.epochs_run..self.state.total_epochs {
            self.engine.run_epoch(
                epoch,
                &mut self.state,
                LoopComponents {
                    model: self.model.as_ref(),
                    optimizer: self.optimizer.as_mut(),
                    lr_scheduler: self.lr_scheduler.as_mut(),
                    loss_fn: self.loss_fn.as_ref(),
                    data: self.data.as_mut(),
                    metric_logger: self.metric_logger.as_mut(),
                    ignore_labels: &self.ignore_labels,
                    capabilities: self.capabilities.as_ref(),
                },
            )?;
            self.state.epochs_run += 1;
            self.save_checkpoint(epoch)?;
        }
        Ok(())
    }

    /// Persist the bundle for a completed epoch
    pub fn save_checkpoint(&mut self, epoch: usize) -> Result<()> {
        self.checkpoints.save(SaveRequest {
            epoch,
            model: self.model.as_ref(),
            optimizer: self.optimizer.as_ref(),
            adapter_params: &self.adapter_params,
            recipe_state: &self.state,
            adapter_config: &self.adapter_config,
            adapter_only: self.state.save_adapter_weights_only,
        })
    }

    /// Release the metric logger
    pub fn cleanup(&mut self) -> Result<()> {
        self.metric_logger.close()
    }

    pub fn state(&self) -> &RecipeState {
        &self.state
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

    pub fn model(&self) -> &dyn CausalLm {
        self.model.as_ref()
    }

    pub fn adapter_params(&self) -> &AdapterParams {
        &self.adapter_params
    }

    pub fn adapter_config(&self) -> &AdapterConfig {
        &self.adapter_config
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn lr_scheduler(&self) -> &dyn LrScheduler {
        self.lr_scheduler.as_ref()
    }
}
