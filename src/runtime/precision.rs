//! Precision management for training
//!
//! Resolves the requested precision to a compute dtype and applies the
//! startup gates: half precision is never accepted (there is no loss
//! scaling in this recipe), and bf16 on an accelerator requires native
//! hardware support.

use candle_core::DType;
use std::fmt;
use std::str::FromStr;

use super::device::{DeviceCapabilities, DeviceKind};
use crate::error::{RecipeError, Result};

/// Requested training precision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Fp32,
    Bf16,
    Fp16,
}

impl Precision {
    pub fn dtype(&self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Bf16 => DType::BF16,
            Precision::Fp16 => DType::F16,
        }
    }
}

impl FromStr for Precision {
    type Err = RecipeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fp32" | "float32" | "f32" => Ok(Precision::Fp32),
            "bf16" | "bfloat16" => Ok(Precision::Bf16),
            "fp16" | "float16" | "f16" | "half" => Ok(Precision::Fp16),
            other => Err(RecipeError::config(format!("unknown dtype '{}'", other))),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Fp32 => write!(f, "fp32"),
            Precision::Bf16 => write!(f, "bf16"),
            Precision::Fp16 => write!(f, "fp16"),
        }
    }
}

/// Resolve the compute dtype, failing on unsupported precision/device pairs
pub fn resolve_dtype(
    requested: Precision,
    device: DeviceKind,
    capabilities: &dyn DeviceCapabilities,
) -> Result<DType> {
    let dtype = requested.dtype();

    if dtype == DType::F16 {
        return Err(RecipeError::config(
            "fp16 precision is not supported in this recipe. Please use fp32 or bf16.",
        ));
    }

    if dtype == DType::BF16 && device.is_accelerator() && !capabilities.supports_bf16(device) {
        return Err(RecipeError::HardwareCapability(format!(
            "Full bf16 training is not supported on this hardware ({})",
            device
        )));
    }

    Ok(dtype)
}
