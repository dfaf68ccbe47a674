//! Optimizers over named trainable parameters
//!
//! Gradients are passed in as a name-keyed map accumulated by the training
//! loop, so an optimizer step is independent of how many backward passes fed
//! into it.

use candle_core::{DType, Tensor, Var};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::OptimizerConfig;
use crate::error::{RecipeError, Result};
use crate::lora::StateDict;

/// Accumulated gradients keyed by parameter name
pub type GradMap = BTreeMap<String, Tensor>;

/// Serializable optimizer state
///
/// Scalars (step counts, hyperparameters) go to the recipe-state JSON,
/// tensors (moment buffers) to a safetensors file.
#[derive(Debug, Clone, Default)]
pub struct OptimizerState {
    pub scalars: BTreeMap<String, f64>,
    pub tensors: StateDict,
}

impl OptimizerState {
    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty() && self.tensors.is_empty()
    }
}

pub trait Optimizer {
    /// Apply one update using the given gradients; parameters without a gradient are skipped
    fn step(&mut self, grads: &GradMap) -> Result<()>;

    /// Current learning rate of the single parameter group
    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Learning rate the optimizer was configured with
    fn initial_learning_rate(&self) -> f64;

    /// Names of the parameters this optimizer updates
    fn param_names(&self) -> Vec<String>;

    fn state_dict(&self) -> Result<OptimizerState>;

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()>;
}

/// Adam with decoupled weight decay
///
/// Moments are kept in f32 regardless of the parameter dtype.
pub struct AdamW {
    params: Vec<(String, Var)>,
    lr: f64,
    initial_lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    step: usize,
    exp_avg: BTreeMap<String, Tensor>,
    exp_avg_sq: BTreeMap<String, Tensor>,
}

impl AdamW {
    pub fn new(params: Vec<(String, Var)>, cfg: &OptimizerConfig) -> Result<Self> {
        if cfg.lr < 0.0 {
            return Err(RecipeError::config(format!("Invalid learning rate: {}", cfg.lr)));
        }
        if !(0.0..1.0).contains(&cfg.beta1) || !(0.0..1.0).contains(&cfg.beta2) {
            return Err(RecipeError::config(format!(
                "Invalid betas: ({}, {})",
                cfg.beta1, cfg.beta2
            )));
        }
        Ok(Self {
            params,
            lr: cfg.lr,
            initial_lr: cfg.lr,
            beta1: cfg.beta1,
            beta2: cfg.beta2,
            eps: cfg.eps,
            weight_decay: cfg.weight_decay,
            step: 0,
            exp_avg: BTreeMap::new(),
            exp_avg_sq: BTreeMap::new(),
        })
    }

    pub fn step_count(&self) -> usize {
        self.step
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, grads: &GradMap) -> Result<()> {
        self.step += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias2 = 1.0 - self.beta2.powi(self.step as i32);

        for (name, var) in &self.params {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            let g = grad.to_dtype(DType::F32)?;
            let p = var.as_tensor().detach().to_dtype(DType::F32)?;

            let m = match self.exp_avg.get(name) {
                Some(m) => (m.affine(self.beta1, 0.0)? + g.affine(1.0 - self.beta1, 0.0)?)?,
                None => g.affine(1.0 - self.beta1, 0.0)?,
            };
            let v = match self.exp_avg_sq.get(name) {
                Some(v) => (v.affine(self.beta2, 0.0)? + g.sqr()?.affine(1.0 - self.beta2, 0.0)?)?,
                None => g.sqr()?.affine(1.0 - self.beta2, 0.0)?,
            };

            let denom = v.affine(1.0 / bias2, 0.0)?.sqrt()?.affine(1.0, self.eps)?;
            let update = m.affine(1.0 / bias1, 0.0)?.div(&denom)?;
            let decayed = p.affine(1.0 - self.lr * self.weight_decay, 0.0)?;
            let next = (decayed - update.affine(self.lr, 0.0)?)?;
            var.set(&next.to_dtype(var.dtype())?)?;

            self.exp_avg.insert(name.clone(), m);
            self.exp_avg_sq.insert(name.clone(), v);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn initial_learning_rate(&self) -> f64 {
        self.initial_lr
    }

    fn param_names(&self) -> Vec<String> {
        self.params.iter().map(|(n, _)| n.clone()).collect()
    }

    fn state_dict(&self) -> Result<OptimizerState> {
        let mut state = OptimizerState::default();
        state.scalars.insert("step".to_string(), self.step as f64);
        state.scalars.insert("lr".to_string(), self.lr);
        state.scalars.insert("initial_lr".to_string(), self.initial_lr);
        state.scalars.insert("beta1".to_string(), self.beta1);
        state.scalars.insert("beta2".to_string(), self.beta2);
        state.scalars.insert("eps".to_string(), self.eps);
        state.scalars.insert("weight_decay".to_string(), self.weight_decay);
        for (name, m) in &self.exp_avg {
            state.tensors.insert(format!("exp_avg.{}", name), m.copy()?);
        }
        for (name, v) in &self.exp_avg_sq {
            state.tensors.insert(format!("exp_avg_sq.{}", name), v.copy()?);
        }
        Ok(state)
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        let scalar = |key: &str| {
            state
                .scalars
                .get(key)
                .copied()
                .ok_or_else(|| RecipeError::checkpoint(format!("optimizer state lacks '{}'", key)))
        };
        self.step = scalar("step")? as usize;
        self.lr = scalar("lr")?;
        self.initial_lr = scalar("initial_lr")?;

        let device = self
            .params
            .first()
            .map(|(_, v)| v.device().clone())
            .unwrap_or(candle_core::Device::Cpu);
        self.exp_avg.clear();
        self.exp_avg_sq.clear();
        for (key, tensor) in &state.tensors {
            let tensor = tensor.to_dtype(DType::F32)?.to_device(&device)?;
            if let Some(name) = key.strip_prefix("exp_avg_sq.") {
                self.exp_avg_sq.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix("exp_avg.") {
                self.exp_avg.insert(name.to_string(), tensor);
            } else {
                return Err(RecipeError::checkpoint(format!(
                    "unexpected optimizer tensor '{}'",
                    key
                )));
            }
        }
        debug!("Restored AdamW state at step {}", self.step);
        Ok(())
    }
}

/// Stochastic gradient descent with optional momentum and L2 weight decay
pub struct Sgd {
    params: Vec<(String, Var)>,
    lr: f64,
    initial_lr: f64,
    momentum: f64,
    weight_decay: f64,
    momentum_buffer: BTreeMap<String, Tensor>,
}

impl Sgd {
    pub fn new(params: Vec<(String, Var)>, cfg: &OptimizerConfig) -> Result<Self> {
        if cfg.lr < 0.0 {
            return Err(RecipeError::config(format!("Invalid learning rate: {}", cfg.lr)));
        }
        Ok(Self {
            params,
            lr: cfg.lr,
            initial_lr: cfg.lr,
            momentum: cfg.momentum,
            weight_decay: cfg.weight_decay,
            momentum_buffer: BTreeMap::new(),
        })
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, grads: &GradMap) -> Result<()> {
        for (name, var) in &self.params {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            let p = var.as_tensor().detach().to_dtype(DType::F32)?;
            let mut g = grad.to_dtype(DType::F32)?;
            if self.weight_decay != 0.0 {
                g = (g + p.affine(self.weight_decay, 0.0)?)?;
            }
            if self.momentum != 0.0 {
                let buf = match self.momentum_buffer.get(name) {
                    Some(buf) => (buf.affine(self.momentum, 0.0)? + &g)?,
                    None => g.clone(),
                };
                self.momentum_buffer.insert(name.clone(), buf.clone());
                g = buf;
            }
            let next = (p - g.affine(self.lr, 0.0)?)?;
            var.set(&next.to_dtype(var.dtype())?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn initial_learning_rate(&self) -> f64 {
        self.initial_lr
    }

    fn param_names(&self) -> Vec<String> {
        self.params.iter().map(|(n, _)| n.clone()).collect()
    }

    fn state_dict(&self) -> Result<OptimizerState> {
        let mut state = OptimizerState::default();
        state.scalars.insert("lr".to_string(), self.lr);
        state.scalars.insert("initial_lr".to_string(), self.initial_lr);
        state.scalars.insert("momentum".to_string(), self.momentum);
        for (name, buf) in &self.momentum_buffer {
            state.tensors.insert(format!("momentum_buffer.{}", name), buf.copy()?);
        }
        Ok(state)
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        if let Some(lr) = state.scalars.get("lr") {
            self.lr = *lr;
        }
        if let Some(lr) = state.scalars.get("initial_lr") {
            self.initial_lr = *lr;
        }
        self.momentum_buffer.clear();
        for (key, tensor) in &state.tensors {
            let name = key.strip_prefix("momentum_buffer.").ok_or_else(|| {
                RecipeError::checkpoint(format!("unexpected optimizer tensor '{}'", key))
            })?;
            self.momentum_buffer
                .insert(name.to_string(), tensor.to_dtype(DType::F32)?);
        }
        Ok(())
    }
}
