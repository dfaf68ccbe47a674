//! Device selection and hardware capability probing
//!
//! The recipe never asks candle directly whether a device can do something.
//! It goes through [`DeviceCapabilities`] so the startup gates and the memory
//! instrumentation can be exercised against simulated hardware.

use candle_core::Device;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{RecipeError, Result};

/// Target device requested by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceKind {
    /// Whether this is an accelerator (anything other than the host CPU)
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, DeviceKind::Cpu)
    }

    /// Create the candle device
    pub fn materialize(&self) -> Result<Device> {
        let device = match *self {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            DeviceKind::Metal(ordinal) => Device::new_metal(ordinal)?,
        };
        Ok(device)
    }
}

impl FromStr for DeviceKind {
    type Err = RecipeError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let (name, ordinal) = match s.split_once(':') {
            Some((name, idx)) => {
                let idx = idx.parse::<usize>().map_err(|_| {
                    RecipeError::config(format!("invalid device ordinal in '{}'", s))
                })?;
                (name.to_string(), idx)
            }
            None => (s.clone(), 0),
        };
        match name.as_str() {
            "cpu" => Ok(DeviceKind::Cpu),
            "cuda" | "gpu" => Ok(DeviceKind::Cuda(ordinal)),
            "metal" | "mps" => Ok(DeviceKind::Metal(ordinal)),
            other => Err(RecipeError::config(format!("unknown device '{}'", other))),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Cuda(idx) => write!(f, "cuda:{}", idx),
            DeviceKind::Metal(idx) => write!(f, "metal:{}", idx),
        }
    }
}

/// Peak memory statistics in GiB
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryStats {
    pub peak_memory_active: f64,
    pub peak_memory_alloc: f64,
    pub peak_memory_reserved: f64,
}

impl MemoryStats {
    /// Metric-logger representation
    pub fn to_metrics(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("peak_memory_active".to_string(), self.peak_memory_active),
            ("peak_memory_alloc".to_string(), self.peak_memory_alloc),
            ("peak_memory_reserved".to_string(), self.peak_memory_reserved),
        ])
    }
}

/// Hardware capability queries used by the recipe
pub trait DeviceCapabilities {
    /// Whether the device natively supports bfloat16 arithmetic
    fn supports_bf16(&self, device: DeviceKind) -> bool;

    /// Peak memory statistics, when the platform exposes them
    fn memory_stats(&self, device: DeviceKind) -> Option<MemoryStats>;

    /// Start or stop recording allocation history
    fn record_memory_history(&self, enabled: bool);
}

/// Capabilities of the machine the process runs on
#[derive(Debug, Default)]
pub struct HostCapabilities {
    recording: Cell<bool>,
}

impl HostCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.get()
    }
}

impl DeviceCapabilities for HostCapabilities {
    fn supports_bf16(&self, device: DeviceKind) -> bool {
        match device {
            DeviceKind::Cpu => true,
            // candle ships bf16 kernels for both accelerator backends; a device
            // without them fails on first use, not here
            DeviceKind::Cuda(_) => candle_core::utils::cuda_is_available(),
            DeviceKind::Metal(_) => candle_core::utils::metal_is_available(),
        }
    }

    fn memory_stats(&self, _device: DeviceKind) -> Option<MemoryStats> {
        read_process_memory()
    }

    fn record_memory_history(&self, enabled: bool) {
        self.recording.set(enabled);
        if enabled {
            info!("Memory history recording enabled");
        } else {
            info!("Memory history recording disabled");
        }
    }
}

/// Peak resident set size of this process, from procfs
fn read_process_memory() -> Option<MemoryStats> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let field = |key: &str| -> Option<f64> {
        status
            .lines()
            .find(|line| line.starts_with(key))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<f64>().ok())
            .map(|kb| kb / (1024.0 * 1024.0))
    };

    let peak = field("VmHWM:")?;
    let current = field("VmRSS:").unwrap_or(peak);
    let reserved = field("VmPeak:").unwrap_or(peak);
    debug!("Process memory: peak {:.3} GiB, resident {:.3} GiB", peak, current);

    Some(MemoryStats {
        peak_memory_active: current,
        peak_memory_alloc: peak,
        peak_memory_reserved: reserved,
    })
}
