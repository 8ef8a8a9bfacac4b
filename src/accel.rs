//! Hardware-acceleration detection and selection.
//!
//! Detection is compile-target gated: CPU is always available, Metal and
//! Core ML exist on Apple platforms, NNAPI on Android. GPU compute stacks
//! that need a runtime probe (Vulkan, OpenCL, CUDA, WebGPU) are reported as
//! unavailable unless the corresponding backend is linked in.

use crate::error::{ErrorKind, Result, SdkError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed set of accelerators the SDK can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorType {
    Cpu,
    Metal,
    #[serde(rename = "coreml")]
    CoreMl,
    Nnapi,
    Vulkan,
    #[serde(rename = "opencl")]
    OpenCl,
    Cuda,
    #[serde(rename = "webgpu")]
    WebGpu,
}

impl AcceleratorType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Metal => "metal",
            Self::CoreMl => "coreml",
            Self::Nnapi => "nnapi",
            Self::Vulkan => "vulkan",
            Self::OpenCl => "opencl",
            Self::Cuda => "cuda",
            Self::WebGpu => "webgpu",
        }
    }

    /// Every accelerator type, in detection order.
    pub fn all() -> [AcceleratorType; 8] {
        [
            Self::Cpu,
            Self::Metal,
            Self::CoreMl,
            Self::Nnapi,
            Self::Vulkan,
            Self::OpenCl,
            Self::Cuda,
            Self::WebGpu,
        ]
    }
}

impl fmt::Display for AcceleratorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detection result for one accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceleratorInfo {
    pub accel_type: AcceleratorType,
    pub available: bool,
}

/// Probe which accelerators this build can use.
pub fn detect_accelerators() -> Vec<AcceleratorInfo> {
    AcceleratorType::all()
        .into_iter()
        .map(|accel_type| AcceleratorInfo {
            accel_type,
            available: is_available(accel_type),
        })
        .collect()
}

fn is_available(accel: AcceleratorType) -> bool {
    match accel {
        AcceleratorType::Cpu => true,
        AcceleratorType::Metal | AcceleratorType::CoreMl => {
            cfg!(any(target_os = "macos", target_os = "ios"))
        }
        AcceleratorType::Nnapi => cfg!(target_os = "android"),
        AcceleratorType::Vulkan
        | AcceleratorType::OpenCl
        | AcceleratorType::Cuda
        | AcceleratorType::WebGpu => false,
    }
}

/// Accelerator preferences for an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareAccelerationConfig {
    /// Tried in order; the first available entry wins.
    pub preferred_accelerators: Vec<AcceleratorType>,
    /// Fall back to CPU when nothing in the preference list is available.
    pub fallback_to_cpu: bool,
}

impl Default for HardwareAccelerationConfig {
    fn default() -> Self {
        Self {
            preferred_accelerators: vec![AcceleratorType::Cpu],
            fallback_to_cpu: true,
        }
    }
}

impl HardwareAccelerationConfig {
    /// Platform default for speech-class models (STT/TTS): Core ML first on
    /// Apple platforms, NNAPI on Android, CPU elsewhere.
    pub fn default_for_speech() -> Self {
        let preferred = if cfg!(any(target_os = "macos", target_os = "ios")) {
            vec![AcceleratorType::CoreMl, AcceleratorType::Cpu]
        } else if cfg!(target_os = "android") {
            vec![AcceleratorType::Nnapi, AcceleratorType::Cpu]
        } else {
            vec![AcceleratorType::Cpu]
        };
        Self {
            preferred_accelerators: preferred,
            fallback_to_cpu: true,
        }
    }

    /// Platform default for text-generation models (LLM): Metal first on
    /// Apple platforms, NNAPI on Android, CPU elsewhere.
    pub fn default_for_text() -> Self {
        let preferred = if cfg!(any(target_os = "macos", target_os = "ios")) {
            vec![AcceleratorType::Metal, AcceleratorType::Cpu]
        } else if cfg!(target_os = "android") {
            vec![AcceleratorType::Nnapi, AcceleratorType::Cpu]
        } else {
            vec![AcceleratorType::Cpu]
        };
        Self {
            preferred_accelerators: preferred,
            fallback_to_cpu: true,
        }
    }
}

/// Choose an accelerator from `detected` honouring the preference order.
///
/// Returns the first preferred accelerator that is available; CPU when
/// nothing matched and `fallback_to_cpu` is set; otherwise
/// `InferenceHardwareAccelerationFailure` naming what was tried.
pub fn select_accelerator(
    config: &HardwareAccelerationConfig,
    detected: &[AcceleratorInfo],
) -> Result<AcceleratorType> {
    for preferred in &config.preferred_accelerators {
        let available = detected
            .iter()
            .any(|info| info.accel_type == *preferred && info.available);
        if available {
            return Ok(*preferred);
        }
    }
    if config.fallback_to_cpu {
        return Ok(AcceleratorType::Cpu);
    }
    let tried = config
        .preferred_accelerators
        .iter()
        .map(|a| a.as_str())
        .collect::<Vec<_>>()
        .join(",");
    Err(SdkError::new(
        ErrorKind::InferenceHardwareAccelerationFailure,
        "no preferred hardware accelerator is available",
        format!("tried=[{tried}] fallback_to_cpu=false"),
    )
    .with_recovery("enable fallback_to_cpu or prefer an available accelerator"))
}
