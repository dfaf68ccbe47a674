//! Runtime policy: device selection, hardware capabilities and precision gates

pub mod device;
pub mod precision;

pub use device::{DeviceCapabilities, DeviceKind, HostCapabilities, MemoryStats};
pub use precision::{resolve_dtype, Precision};
