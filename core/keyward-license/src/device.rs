//! Machine identity derivation.
//!
//! The identity is `<volume>-<cpu>`: a storage-volume signal followed by the
//! CPU signature word. Either segment may be empty when the platform cannot
//! provide it; derivation itself never fails.

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;

/// Information about the current device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Operating system name.
    pub os_name: String,
    /// Operating system version.
    pub os_version: String,
    /// Hostname.
    pub hostname: String,
    /// CPU architecture.
    pub arch: String,
}

impl DeviceInfo {
    /// Collects information about the current device.
    #[must_use]
    pub fn collect() -> Self {
        Self {
            os_name: env::consts::OS.to_string(),
            os_version: get_os_version(),
            hostname: get_hostname(),
            arch: env::consts::ARCH.to_string(),
        }
    }
}

/// Raw hardware signals feeding the machine identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineSignals {
    /// Storage-volume serial (or the platform's closest stable equivalent).
    pub volume_serial: Option<String>,
    /// CPU signature: feature word and version word, hex formatted.
    pub cpu_signature: Option<String>,
}

impl MachineSignals {
    /// Reads the signals from the local host.
    #[must_use]
    pub fn collect() -> Self {
        Self {
            volume_serial: volume_serial(),
            cpu_signature: cpu_signature(),
        }
    }
}

/// A reproducible, host-specific identity string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(String);

impl MachineId {
    /// Derives the identity of the current machine.
    #[must_use]
    pub fn derive() -> Self {
        Self::from_signals(&MachineSignals::collect())
    }

    /// Formats an identity from already collected signals.
    #[must_use]
    pub fn from_signals(signals: &MachineSignals) -> Self {
        let volume = signals.volume_serial.as_deref().unwrap_or_default();
        let cpu = signals.cpu_signature.as_deref().unwrap_or_default();
        Self(format!("{volume}-{cpu}"))
    }

    /// Returns the identity string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reads the CPU signature from CPUID leaf 1 (EDX feature flags, EAX version).
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn cpu_signature() -> Option<String> {
    #[cfg(target_arch = "x86")]
    use std::arch::x86::__cpuid;
    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::__cpuid;

    // CPUID leaf 1 is available on every CPU this target can run on.
    #[allow(unused_unsafe)]
    let leaf = unsafe { __cpuid(1) };
    Some(format!("{:08X}{:08X}", leaf.edx, leaf.eax))
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn cpu_signature() -> Option<String> {
    None
}

/// Serial number of the system volume.
#[cfg(target_os = "windows")]
fn volume_serial() -> Option<String> {
    use windows_sys::Win32::Storage::FileSystem::GetVolumeInformationW;

    let root: Vec<u16> = "C:\\".encode_utf16().chain(std::iter::once(0)).collect();
    let mut serial: u32 = 0;
    // SAFETY: `root` is NUL-terminated; every optional out-pointer is null.
    let ok = unsafe {
        GetVolumeInformationW(
            root.as_ptr(),
            std::ptr::null_mut(),
            0,
            &mut serial,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        )
    };
    (ok != 0).then(|| format!("{serial:08X}"))
}

/// Platform UUID of the machine.
#[cfg(target_os = "macos")]
fn volume_serial() -> Option<String> {
    std::process::Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .and_then(|output| {
            output
                .lines()
                .find(|l| l.contains("IOPlatformUUID"))
                .and_then(|l| l.split('"').nth(3))
                .map(|uuid| uuid.replace('-', ""))
        })
}

/// Truncated, application-keyed digest of the systemd machine id.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn volume_serial() -> Option<String> {
    use sha2::{Digest, Sha256};

    let machine_id = std::fs::read_to_string("/etc/machine-id")
        .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())?;

    let mut hasher = Sha256::new();
    hasher.update(b"keyward-machine:");
    hasher.update(machine_id.as_bytes());
    Some(hex::encode_upper(&hasher.finalize()[..4]))
}

#[cfg(not(any(
    target_os = "windows",
    target_os = "macos",
    target_os = "linux",
    target_os = "android"
)))]
fn volume_serial() -> Option<String> {
    None
}

/// Gets the machine hostname.
fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Gets the OS version string.
fn get_os_version() -> String {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("sw_vers")
            .arg("-productVersion")
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|content| {
                content
                    .lines()
                    .find(|l| l.starts_with("VERSION_ID="))
                    .map(|l| {
                        l.trim_start_matches("VERSION_ID=")
                            .trim_matches('"')
                            .to_string()
                    })
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        "unknown".to_string()
    }
}
