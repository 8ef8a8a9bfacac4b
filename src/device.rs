//! Device capability probing: RAM, storage and usable accelerators.
//!
//! Capabilities are detected once and passed into registry filtering so
//! models that cannot run on this device never reach the recommendation
//! stage.

use crate::accel::{AcceleratorType, detect_accelerators};
use std::path::Path;
use tracing::debug;

/// What this device offers to models.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCapabilities {
    /// Total physical RAM in bytes; `0` when unknown.
    pub ram_bytes: u64,
    /// Bytes available on the filesystem holding the model directory.
    pub storage_bytes: u64,
    /// Platform name, e.g. `"linux"`, `"macos"`, `"android"`.
    pub platform: String,
    /// Accelerators available to this build, CPU always included.
    pub accelerators: Vec<AcceleratorType>,
}

impl DeviceCapabilities {
    /// Probe the current device. `storage_path` should be the model
    /// directory (or any existing path on the same filesystem).
    pub fn detect(storage_path: &Path) -> Self {
        let capabilities = Self {
            ram_bytes: total_memory_bytes(),
            storage_bytes: available_storage_bytes(storage_path),
            platform: std::env::consts::OS.to_owned(),
            accelerators: detect_accelerators()
                .into_iter()
                .filter(|info| info.available)
                .map(|info| info.accel_type)
                .collect(),
        };
        debug!(
            ram_bytes = capabilities.ram_bytes,
            storage_bytes = capabilities.storage_bytes,
            platform = %capabilities.platform,
            "detected device capabilities"
        );
        capabilities
    }
}

/// Total physical RAM in bytes; `0` when the platform offers no probe.
pub fn total_memory_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        linux_total_memory_bytes().unwrap_or(0)
    }
    #[cfg(target_os = "macos")]
    {
        macos_total_memory_bytes().unwrap_or(0)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        0
    }
}

#[cfg(target_os = "linux")]
fn linux_total_memory_bytes() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
            return Some(kb.saturating_mul(1024));
        }
    }
    None
}

#[cfg(target_os = "macos")]
fn macos_total_memory_bytes() -> Option<u64> {
    let output = std::process::Command::new("sysctl")
        .arg("-n")
        .arg("hw.memsize")
        .output()
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<u64>()
        .ok()
}

/// Bytes available to unprivileged writes on the filesystem holding `path`.
///
/// Returns `0` when the path does not exist or the platform offers no
/// `statvfs`.
#[cfg(unix)]
pub fn available_storage_bytes(path: &Path) -> u64 {
    use std::os::unix::ffi::OsStrExt;
    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return 0;
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &raw mut stat) };
    if rc != 0 {
        return 0;
    }
    (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64)
}

#[cfg(not(unix))]
pub fn available_storage_bytes(_path: &Path) -> u64 {
    0
}

/// Total size in bytes of the filesystem holding `path`; `0` when unknown.
#[cfg(unix)]
pub fn total_storage_bytes(path: &Path) -> u64 {
    use std::os::unix::ffi::OsStrExt;
    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return 0;
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &raw mut stat) };
    if rc != 0 {
        return 0;
    }
    (stat.f_blocks as u64).saturating_mul(stat.f_frsize as u64)
}

#[cfg(not(unix))]
pub fn total_storage_bytes(_path: &Path) -> u64 {
    0
}
