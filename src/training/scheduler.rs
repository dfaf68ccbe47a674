//! Learning-rate schedules
//!
//! Schedules follow multiplicative-lambda semantics: the optimizer's learning
//! rate is `initial_lr * lambda(last_epoch)`, construction performs the first
//! step, and `last_epoch = global_step - 1` places a restored schedule at the
//! right point.

use std::f64::consts::PI;
use tracing::debug;

use crate::training::optimizer::Optimizer;

pub trait LrScheduler {
    /// Advance one step and write the new rate into the optimizer
    fn step(&mut self, optimizer: &mut dyn Optimizer);

    /// Index of the most recent step
    fn last_epoch(&self) -> i64;

    /// Multiplier applied to the initial learning rate at `step`
    fn lr_lambda(&self, step: i64) -> f64;
}

/// Linear warmup from 0, then cosine decay
#[derive(Debug, Clone)]
pub struct CosineWithWarmup {
    num_warmup_steps: usize,
    num_training_steps: usize,
    num_cycles: f64,
    base_lr: f64,
    last_epoch: i64,
}

impl CosineWithWarmup {
    pub fn new(
        optimizer: &mut dyn Optimizer,
        num_warmup_steps: usize,
        num_training_steps: usize,
        num_cycles: f64,
        last_epoch: i64,
    ) -> Self {
        let mut scheduler = Self {
            num_warmup_steps,
            num_training_steps,
            num_cycles,
            base_lr: optimizer.initial_learning_rate(),
            last_epoch,
        };
        scheduler.step(optimizer);
        debug!(
            "Cosine schedule: {} warmup / {} total steps, starting at step {}",
            num_warmup_steps, num_training_steps, scheduler.last_epoch
        );
        scheduler
    }
}

impl LrScheduler for CosineWithWarmup {
    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.last_epoch += 1;
        optimizer.set_learning_rate(self.base_lr * self.lr_lambda(self.last_epoch));
    }

    fn last_epoch(&self) -> i64 {
        self.last_epoch
    }

    fn lr_lambda(&self, step: i64) -> f64 {
        let step = step.max(0) as f64;
        let warmup = self.num_warmup_steps as f64;
        if step < warmup {
            return step / warmup.max(1.0);
        }
        let decay_steps = (self.num_training_steps as f64 - warmup).max(1.0);
        let progress = (step - warmup) / decay_steps;
        let cosine_lr_multiple = 0.5 * (1.0 + (PI * self.num_cycles * 2.0 * progress).cos());
        cosine_lr_multiple.max(0.0)
    }
}

/// Keeps the initial learning rate
#[derive(Debug, Clone)]
pub struct ConstantLr {
    base_lr: f64,
    last_epoch: i64,
}

impl ConstantLr {
    pub fn new(optimizer: &mut dyn Optimizer, last_epoch: i64) -> Self {
        let mut scheduler = Self {
            base_lr: optimizer.initial_learning_rate(),
            last_epoch,
        };
        scheduler.step(optimizer);
        scheduler
    }
}

impl LrScheduler for ConstantLr {
    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.last_epoch += 1;
        optimizer.set_learning_rate(self.base_lr);
    }

    fn last_epoch(&self) -> i64 {
        self.last_epoch
    }

    fn lr_lambda(&self, _step: i64) -> f64 {
        1.0
    }
}
