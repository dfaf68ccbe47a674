//! Single-device LoRA/DoRA fine-tuning of causal language models.
//!
//! The [`recipe`] module drives a run end to end; the remaining modules are
//! the pieces it wires together and can be used on their own.

pub mod cli;
pub mod config;
pub mod error;
pub mod lora;
pub mod models;
pub mod recipe;
pub mod registry;
pub mod runtime;
pub mod training;

// Re-export commonly used types
pub use config::RecipeConfig;
pub use error::{RecipeError, Result};
pub use recipe::{LoraFinetuneRecipe, TrainingSession};
pub use registry::ComponentRegistry;
