//! Device placement and memory budget resolution.

use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

use crate::config::DeviceConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "ordinal", rename_all = "snake_case")]
pub enum DeviceKind {
    Cpu,
    Cuda(u32),
    Metal,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => f.write_str("cpu"),
            DeviceKind::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
            DeviceKind::Metal => f.write_str("metal"),
        }
    }
}

/// Where a model lives and how much memory that device has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DevicePlacement {
    pub kind: DeviceKind,
    pub total_memory_bytes: Option<u64>,
}

impl DevicePlacement {
    pub fn cpu() -> Self {
        Self {
            kind: DeviceKind::Cpu,
            total_memory_bytes: None,
        }
    }

    /// Parse a placement string such as `cpu`, `cuda`, `cuda:1` or `metal`.
    pub fn parse(placement: &str, total_memory_mb: Option<u64>) -> Result<Self> {
        let normalized = placement.trim().to_ascii_lowercase();
        let kind = match normalized.as_str() {
            "" | "cpu" => DeviceKind::Cpu,
            "metal" | "mps" => DeviceKind::Metal,
            "cuda" | "gpu" => DeviceKind::Cuda(0),
            other => match other.strip_prefix("cuda:") {
                Some(ordinal) => DeviceKind::Cuda(ordinal.parse().map_err(|_| {
                    Error::FatalInit(format!("invalid CUDA ordinal in placement '{}'", placement))
                })?),
                None => {
                    return Err(Error::FatalInit(format!(
                        "unknown device placement '{}'",
                        placement
                    )))
                }
            },
        };

        let total_memory_bytes = match total_memory_mb {
            Some(mb) => Some(mb.checked_mul(1024 * 1024).ok_or_else(|| {
                Error::FatalInit(format!("device memory of {} MB is out of range", mb))
            })?),
            None => None,
        };

        Ok(Self {
            kind,
            total_memory_bytes,
        })
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        Self::parse(&config.placement, config.total_memory_mb)
    }
}

/// The share of device memory reserved for this process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryBudget {
    /// Fraction asked for in configuration
    pub requested_fraction: f64,
    /// Fraction actually applied (never above the ceiling)
    pub fraction: f64,
    /// Bytes reserved, when the device size is known
    pub reserved_bytes: Option<u64>,
}

impl MemoryBudget {
    /// Clamp the requested fraction to the ceiling and size the reservation.
    pub fn resolve(requested: f64, ceiling: f64, total_bytes: Option<u64>) -> Result<Self> {
        if !requested.is_finite() || requested <= 0.0 || requested > 1.0 {
            return Err(Error::FatalInit(format!(
                "device memory fraction must be in (0, 1], got {}",
                requested
            )));
        }
        if !ceiling.is_finite() || ceiling <= 0.0 || ceiling > 1.0 {
            return Err(Error::FatalInit(format!(
                "device memory ceiling must be in (0, 1], got {}",
                ceiling
            )));
        }

        let fraction = requested.min(ceiling);
        if fraction < requested {
            info!(
                "Requested memory fraction {:.2} exceeds ceiling {:.2}; clamping",
                requested, ceiling
            );
        }

        let reserved_bytes = total_bytes.map(|total| (total as f64 * fraction).floor() as u64);
        debug!(
            "Memory budget: fraction={:.3}, reserved={:?} bytes",
            fraction, reserved_bytes
        );

        Ok(Self {
            requested_fraction: requested,
            fraction,
            reserved_bytes,
        })
    }

    pub fn from_config(config: &DeviceConfig, placement: &DevicePlacement) -> Result<Self> {
        Self::resolve(
            config.memory_fraction,
            config.memory_ceiling,
            placement.total_memory_bytes,
        )
    }
}
