//! The gradient-accumulated training loop
//!
//! One call to [`TrainingEngine::run_epoch`] drives a single epoch. Counters
//! that span epochs (running loss, token count, timer and any gradients left
//! over from an unfinished accumulation window) live on the engine, so the
//! recipe can checkpoint between epochs without losing them.

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::ProfilerConfig;
use crate::error::Result;
use crate::models::{CausalLm, Logits};
use crate::runtime::{DeviceCapabilities, DeviceKind};
use crate::training::batch::{ensure_ids, Batch, IgnoreLabelCache};
use crate::training::data_loader::DataPipeline;
use crate::training::loss::LossFn;
use crate::training::metric_logger::{MetricLogger, Metrics};
use crate::training::optimizer::{GradMap, Optimizer};
use crate::training::scheduler::LrScheduler;
use crate::training::state::RecipeState;

/// Gradients summed over the micro-batches of one accumulation window
#[derive(Debug, Default)]
pub struct GradientAccumulator {
    grads: GradMap,
}

impl GradientAccumulator {
    /// Add this backward pass's gradients for the given parameters
    pub fn accumulate(&mut self, grads: &GradStore, params: &[(String, Var)]) -> Result<()> {
        for (name, var) in params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let grad = grad.detach();
            let next = match self.grads.remove(name) {
                Some(prev) => (prev + grad)?,
                None => grad,
            };
            self.grads.insert(name.clone(), next);
        }
        Ok(())
    }

    pub fn grads(&self) -> &GradMap {
        &self.grads
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Drop all accumulated gradients
    pub fn zero_grad(&mut self) {
        self.grads.clear();
    }

    /// Global L2 norm over every accumulated gradient
    pub fn global_norm(&self) -> Result<f64> {
        let mut total = 0f64;
        for grad in self.grads.values() {
            let sq: f32 = grad.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar()?;
            total += sq as f64;
        }
        Ok(total.sqrt())
    }

    /// Rescale gradients so their global norm is at most `max_norm`
    ///
    /// Returns the norm before clipping.
    pub fn clip_grad_norm(&mut self, max_norm: f64) -> Result<f64> {
        let norm = self.global_norm()?;
        let coef = max_norm / (norm + 1e-6);
        if coef < 1.0 {
            for grad in self.grads.values_mut() {
                *grad = grad.affine(coef, 0.0)?;
            }
        }
        Ok(norm)
    }
}

/// Micro-step indices in the first epoch between which memory history is recorded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryProfileWindow {
    pub profile_memory: bool,
    pub wait_steps: usize,
    pub warmup_steps: usize,
    pub active_steps: usize,
}

impl MemoryProfileWindow {
    pub fn from_config(cfg: &ProfilerConfig) -> Self {
        Self {
            profile_memory: cfg.enabled && cfg.profile_memory,
            wait_steps: cfg.wait_steps,
            warmup_steps: cfg.warmup_steps,
            active_steps: cfg.active_steps,
        }
    }

    fn starts_at(&self, epoch: usize, idx: usize) -> bool {
        epoch == 0 && self.profile_memory && idx == self.wait_steps + self.warmup_steps
    }

    fn stops_at(&self, epoch: usize, idx: usize) -> bool {
        epoch == 0
            && self.profile_memory
            && idx == self.wait_steps + self.warmup_steps + self.active_steps
    }
}

/// Fixed settings of a training run
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub steps_per_epoch: usize,
    pub log_every_n_steps: usize,
    pub log_peak_memory_stats: bool,
    pub device: Device,
    pub device_kind: DeviceKind,
    pub profiler: MemoryProfileWindow,
    pub show_progress: bool,
}

/// Components the loop drives, borrowed from the recipe for one epoch
pub struct LoopComponents<'a> {
    pub model: &'a dyn CausalLm,
    pub optimizer: &'a mut dyn Optimizer,
    pub lr_scheduler: &'a mut dyn LrScheduler,
    pub loss_fn: &'a dyn LossFn,
    pub data: &'a mut dyn DataPipeline,
    pub metric_logger: &'a mut dyn MetricLogger,
    pub ignore_labels: &'a IgnoreLabelCache,
    pub capabilities: &'a dyn DeviceCapabilities,
}

pub struct TrainingEngine {
    settings: EngineSettings,
    trainable: Vec<(String, Var)>,
    accumulator: GradientAccumulator,
    running_loss: Option<Tensor>,
    num_tokens: usize,
    t0: Instant,
}

impl TrainingEngine {
    pub fn new(settings: EngineSettings, trainable: Vec<(String, Var)>) -> Self {
        Self {
            settings,
            trainable,
            accumulator: GradientAccumulator::default(),
            running_loss: None,
            num_tokens: 0,
            t0: Instant::now(),
        }
    }

    /// Restart the throughput clock, called when training begins
    pub fn start_timer(&mut self) {
        self.t0 = Instant::now();
        self.num_tokens = 0;
    }

    /// Time since the throughput clock last restarted
    pub fn elapsed(&self) -> Duration {
        self.t0.elapsed()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Gradients accumulated since the last optimizer step
    pub fn pending_grads(&self) -> &GradMap {
        self.accumulator.grads()
    }

    /// Forward pass and loss for one micro-batch
    ///
    /// Labels are shifted left so position `i` is scored against token `i + 1`.
    /// Full logits are flattened to `[batch * seq, vocab]` before the loss;
    /// chunked logits are passed through as produced.
    pub fn loss_step(
        &self,
        model: &dyn CausalLm,
        loss_fn: &dyn LossFn,
        ignore_labels: &IgnoreLabelCache,
        batch: &Batch,
    ) -> Result<Tensor> {
        ensure_ids(&batch.tokens, "tokens")?;
        ensure_ids(&batch.labels, "labels")?;

        let logits = model.forward(&batch.tokens, batch.mask.as_ref(), batch.input_pos.as_ref())?;
        let labels = ignore_labels.shift_labels(&batch.labels)?;

        let (logits, labels) = match logits {
            Logits::Full(logits) => {
                let vocab = logits.dim(candle_core::D::Minus1)?;
                (
                    Logits::Full(logits.reshape(((), vocab))?),
                    labels.flatten_all()?,
                )
            }
            chunked @ Logits::Chunked(_) => (chunked, labels),
        };

        // logits are moved into the loss and freed there
        loss_fn.compute(logits, &labels)
    }

    /// Run one epoch
    ///
    /// Stops early once `max_steps_per_epoch` optimizer steps have been taken
    /// within the epoch. Memory-history recording is switched on and off at the
    /// configured micro-step indices of epoch 0; an epoch truncated before the
    /// stop index leaves recording on.
    pub fn run_epoch(
        &mut self,
        epoch: usize,
        state: &mut RecipeState,
        components: LoopComponents<'_>,
    ) -> Result<()> {
        let LoopComponents {
            model,
            optimizer,
            lr_scheduler,
            loss_fn,
            data,
            metric_logger,
            ignore_labels,
            capabilities,
        } = components;
        let accumulation = state.gradient_accumulation_steps;

        data.set_epoch(epoch);
        let pbar = self.progress_bar();

        for (idx, batch) in data.batches().enumerate() {
            if let Some(max_steps) = state.max_steps_per_epoch {
                if idx / accumulation == max_steps {
                    debug!("Reached max_steps_per_epoch={} in epoch {}", max_steps, epoch);
                    break;
                }
            }

            if self.settings.profiler.starts_at(epoch, idx) {
                capabilities.record_memory_history(true);
            }

            let batch = batch?.to_device(&self.settings.device)?;
            self.num_tokens += batch.num_tokens();

            let loss = self
                .loss_step(model, loss_fn, ignore_labels, &batch)?
                .affine(1.0 / accumulation as f64, 0.0)?;
            self.running_loss = Some(match self.running_loss.take() {
                Some(total) => (total + loss.detach())?,
                None => loss.detach(),
            });
            let grads = loss.backward()?;
            self.accumulator.accumulate(&grads, &self.trainable)?;

            if (idx + 1) % accumulation == 0 {
                let grad_norm = match state.clip_grad_norm {
                    Some(max_norm) => Some(self.accumulator.clip_grad_norm(max_norm)?),
                    None => None,
                };
                optimizer.step(self.accumulator.grads())?;
                self.accumulator.zero_grad();
                lr_scheduler.step(optimizer);
                state.global_step += 1;

                let loss_to_log = match self.running_loss.take() {
                    Some(total) => total.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64,
                    None => 0.0,
                };
                pbar.inc(1);
                pbar.set_message(format!(
                    "{}|{}|Loss: {}",
                    epoch + 1,
                    state.global_step,
                    loss_to_log
                ));

                if state.global_step % self.settings.log_every_n_steps == 0 {
                    let metrics = self.step_metrics(
                        loss_to_log,
                        optimizer.learning_rate(),
                        grad_norm,
                        capabilities,
                    );
                    metric_logger.log_dict(&metrics, state.global_step)?;
                }

                self.running_loss = None;
                self.num_tokens = 0;
                self.t0 = Instant::now();
            }

            if self.settings.profiler.stops_at(epoch, idx) {
                capabilities.record_memory_history(false);
            }
        }

        pbar.finish_and_clear();
        info!(
            "Epoch {} complete at global step {}",
            epoch + 1,
            state.global_step
        );
        Ok(())
    }

    fn step_metrics(
        &self,
        loss: f64,
        lr: f64,
        grad_norm: Option<f64>,
        capabilities: &dyn DeviceCapabilities,
    ) -> Metrics {
        let elapsed = self.t0.elapsed().as_secs_f64().max(f64::EPSILON);
        let mut metrics = Metrics::from([
            ("loss".to_string(), loss),
            ("lr".to_string(), lr),
            (
                "tokens_per_second_per_gpu".to_string(),
                self.num_tokens as f64 / elapsed,
            ),
        ]);
        if self.settings.device_kind.is_accelerator() && self.settings.log_peak_memory_stats {
            if let Some(stats) = capabilities.memory_stats(self.settings.device_kind) {
                metrics.extend(stats.to_metrics());
            }
        }
        if let Some(norm) = grad_norm {
            metrics.insert("grad_norm".to_string(), norm);
        }
        metrics
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.settings.show_progress {
            return ProgressBar::hidden();
        }
        let pbar = ProgressBar::new(self.settings.steps_per_epoch as u64);
        if let Ok(style) = ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} {elapsed_precise}") {
            pbar.set_style(style);
        }
        pbar
    }
}
