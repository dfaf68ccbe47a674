//! Error types for the fine-tuning recipe.
//!
//! Every failure in this crate is local, synchronous and fatal for the run:
//! nothing here is retried. The variants follow the startup gates and
//! setup validations in the order a run meets them.

use candle_core::DType;
use thiserror::Error;

/// Unified error type for all recipe operations
#[derive(Error, Debug)]
pub enum RecipeError {
    /// Invalid or unsupported configuration (including fp16 requests)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested precision is not supported by the device hardware
    #[error("Hardware capability error: {0}")]
    HardwareCapability(String),

    /// A recipe feature that exists in the interface but is not implemented
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Checkpoint keys do not line up with the adapter configuration
    #[error("Adapter mismatch: {0}")]
    AdapterMismatch(String),

    #[error("Dtype mismatch for parameter {name}: expected {expected:?}, got {actual:?}")]
    DtypeMismatch {
        name: String,
        expected: DType,
        actual: DType,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Unknown {kind} component: {name}")]
    ComponentNotFound { kind: &'static str, name: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl RecipeError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        RecipeError::Config(msg.into())
    }

    /// Create an adapter mismatch error
    pub fn adapter_mismatch<S: Into<String>>(msg: S) -> Self {
        RecipeError::AdapterMismatch(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint<S: Into<String>>(msg: S) -> Self {
        RecipeError::Checkpoint(msg.into())
    }

    pub fn component_not_found<S: Into<String>>(kind: &'static str, name: S) -> Self {
        RecipeError::ComponentNotFound {
            kind,
            name: name.into(),
        }
    }
}

/// Result type alias for recipe operations
pub type Result<T> = std::result::Result<T, RecipeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = RecipeError::config("fp16 precision is not supported");
        assert!(matches!(err, RecipeError::Config(_)));

        let err = RecipeError::adapter_mismatch("Missing non-LoRA key output.weight");
        assert!(err.to_string().contains("output.weight"));

        let err = RecipeError::DtypeMismatch {
            name: "layers.0.attn.q_proj.lora_a.weight".to_string(),
            expected: DType::BF16,
            actual: DType::F32,
        };
        let msg = err.to_string();
        assert!(msg.contains("BF16"));
        assert!(msg.contains("F32"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let converted: RecipeError = io_err.into();
        assert!(matches!(converted, RecipeError::Io(_)));

        let err = RecipeError::component_not_found("optimizer", "lion");
        assert_eq!(err.to_string(), "Unknown optimizer component: lion");
    }
}
