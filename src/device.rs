//! Execution-device selection.
//!
//! The device is chosen once per run.  [`DevicePreference::Auto`] asks ONNX
//! Runtime whether the CUDA execution provider can be registered and falls back
//! to the CPU otherwise; an explicit preference is taken as-is.

use std::{fmt, str::FromStr};

use anyhow::{bail, Result};
use ort::ep::{self, ExecutionProvider};
use serde::Deserialize;
use tracing::debug;

/// Device the ONNX sessions run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cuda,
    Cpu,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller's device choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// CUDA when available, CPU otherwise.
    #[default]
    Auto,
    Cpu,
    Cuda,
}

impl FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => bail!("Unknown device '{}', expected auto, cpu or cuda", other),
        }
    }
}

/// Resolve a preference into a concrete device.
///
/// `cuda_available` is only consulted for [`DevicePreference::Auto`], and at
/// most once.  Forcing [`DevicePreference::Cuda`] never falls back: if the GPU
/// is missing, building the sessions fails instead.
pub fn select_device(pref: DevicePreference, cuda_available: impl FnOnce() -> bool) -> Device {
    match pref {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => Device::Cuda,
        DevicePreference::Auto => {
            if cuda_available() {
                Device::Cuda
            } else {
                Device::Cpu
            }
        }
    }
}

/// Ask ONNX Runtime whether the CUDA execution provider is usable.
///
/// A failed query counts as "not available".
pub fn cuda_available() -> bool {
    match ep::CUDA::default().is_available() {
        Ok(available) => available,
        Err(e) => {
            debug!("CUDA availability query failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_auto_follows_probe() {
        assert_eq!(select_device(DevicePreference::Auto, || true), Device::Cuda);
        assert_eq!(select_device(DevicePreference::Auto, || false), Device::Cpu);
    }

    #[test]
    fn test_explicit_preference_skips_probe() {
        let calls = Cell::new(0);
        let probe = || {
            calls.set(calls.get() + 1);
            true
        };
        assert_eq!(select_device(DevicePreference::Cpu, probe), Device::Cpu);
        assert_eq!(select_device(DevicePreference::Cuda, || false), Device::Cuda);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_selection_is_deterministic() {
        for available in [true, false] {
            let first = select_device(DevicePreference::Auto, || available);
            for _ in 0..5 {
                assert_eq!(select_device(DevicePreference::Auto, || available), first);
            }
        }
    }

    #[test]
    fn test_parse_preference() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("CPU".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!(" cuda ".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_preference_from_json() {
        let p: DevicePreference = serde_json::from_str("\"cuda\"").unwrap();
        assert_eq!(p, DevicePreference::Cuda);
    }

    #[test]
    fn test_display() {
        assert_eq!(Device::Cuda.to_string(), "cuda");
        assert_eq!(Device::Cpu.to_string(), "cpu");
    }
}
