//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Running the fine-tuning recipe
//! - Validating and printing a resolved configuration

pub mod commands;
pub mod handlers;

pub use handlers::{handle_run, handle_validate};
