//! Trainable causal language models
//!
//! The recipe only talks to models through [`CausalLm`]; concrete architectures
//! are built by the component registry from the `[model]` config section.

use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::error::Result;
use crate::lora::{AdapterModule, LoadOutcome, ParameterStore, StateDict};

pub mod tiny_lm;

pub use tiny_lm::LoraTinyLm;

/// Model output: one logits tensor, or one tensor per sequence chunk
#[derive(Debug, Clone)]
pub enum Logits {
    /// `[batch, seq, vocab]`
    Full(Tensor),
    /// Chunks of `[batch, seq / n, vocab]` along the sequence dimension
    Chunked(Vec<Tensor>),
}

/// Where and how a model materializes its parameters
#[derive(Debug, Clone)]
pub struct ModelBuildContext {
    pub dtype: DType,
    pub device: Device,
    pub seed: u64,
}

/// A decoder-only language model with LoRA-adaptable layers
pub trait CausalLm {
    /// Run the model on `[batch, seq]` token ids
    ///
    /// `mask` is an optional `[batch, seq, seq]` attention mask (non-zero means
    /// attend) replacing the causal mask; `input_pos` optionally overrides the
    /// `[batch, seq]` positions.
    fn forward(
        &self,
        tokens: &Tensor,
        mask: Option<&Tensor>,
        input_pos: Option<&Tensor>,
    ) -> Result<Logits>;

    fn parameters(&self) -> &ParameterStore;

    fn parameters_mut(&mut self) -> &mut ParameterStore;

    /// Every module in the model that carries adapter parameters
    fn adapter_modules(&self) -> Vec<&dyn AdapterModule>;

    /// Split output projection into `n` sequence chunks (1 disables chunking)
    fn set_num_output_chunks(&mut self, num_output_chunks: usize);

    /// Initialize DoRA magnitudes from the loaded base weights
    fn load_dora_magnitudes(&mut self) -> Result<()>;

    /// Host copies of every parameter
    fn state_dict(&self) -> Result<StateDict> {
        self.parameters().state_dict()
    }

    /// Non-strict load of named weights
    fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<LoadOutcome> {
        self.parameters().load_state_dict(state_dict)
    }

    fn enable_activation_checkpointing(&mut self) {
        info!("Activation checkpointing enabled (no-op for this model)");
    }

    fn compile(&mut self) {
        info!("Compiling model layers (no-op, running eagerly)");
    }
}
