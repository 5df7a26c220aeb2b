//! Tamper and debugger detection.
//!
//! These are point-in-time, advisory-strength checks. They raise the cost of
//! casual instrumentation; anyone with kernel-level tooling or a patched
//! binary can defeat them. They are not a cryptographic guarantee.
//!
//! Detected signals:
//! - Debugger attachment (Linux/Android `TracerPid`, macOS `P_TRACED`,
//!   Windows `IsDebuggerPresent` / `CheckRemoteDebuggerPresent`)
//! - Single-stepping, via a timing anomaly on a trivial loop that repeats on
//!   [`TIMING_STRIKES`] consecutive checks
//! - Modification of the response translation routine, when a known-good
//!   checksum of its code window is configured

use crate::config::TrustConfig;
use crate::key::{AuthorityResponse, ValidationResult};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;
use tracing::{debug, error, warn};

/// Bytes of code covered by the integrity checksum.
pub const CODE_WINDOW_LEN: usize = 128;

/// Consecutive timing anomalies that count as tampering.
pub const TIMING_STRIKES: u8 = 2;

/// A check that can veto continued execution regardless of license validity.
pub trait TamperCheck: Send + Sync {
    /// Returns true if the process appears to be debugged or modified.
    fn is_compromised(&self) -> bool;
}

/// Default tamper checks.
#[derive(Debug, Default)]
pub struct Sentinel {
    expected_checksum: Option<u32>,
    timing_strikes: AtomicU8,
}

impl Sentinel {
    /// Creates a sentinel without a code checksum target.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sentinel using the configured checksum target, if any.
    #[must_use]
    pub fn from_config(config: &TrustConfig) -> Self {
        Self {
            expected_checksum: config.expected_code_checksum,
            ..Self::default()
        }
    }

    /// Sets the known-good checksum of the code window.
    #[must_use]
    pub fn with_expected_checksum(mut self, checksum: u32) -> Self {
        self.expected_checksum = Some(checksum);
        self
    }

    /// Checksum of the first [`CODE_WINDOW_LEN`] bytes of
    /// [`ValidationResult::from_response`] as loaded in this process.
    #[must_use]
    pub fn current_checksum() -> u32 {
        let routine: fn(AuthorityResponse) -> ValidationResult = ValidationResult::from_response;
        let start = routine as *const u8;
        // SAFETY: `start` points at mapped, readable machine code in this
        // process's text segment; the window stays inside that segment.
        let window = unsafe { std::slice::from_raw_parts(start, CODE_WINDOW_LEN) };
        checksum(window)
    }

    /// Returns true if the code window no longer matches the configured target.
    #[must_use]
    pub fn code_modified(&self) -> bool {
        match self.expected_checksum {
            Some(expected) => Self::current_checksum() != expected,
            None => false,
        }
    }

    /// Returns true if a debugger is attached to this process.
    #[must_use]
    pub fn debugger_attached() -> bool {
        debugger::attached()
    }

    /// Records one timing sample; true once [`TIMING_STRIKES`] anomalies
    /// arrive in a row. A clean sample resets the count.
    fn timing_tripped(&self, anomalous: bool) -> bool {
        if !anomalous {
            self.timing_strikes.store(0, Ordering::SeqCst);
            return false;
        }
        let strikes = self
            .timing_strikes
            .load(Ordering::SeqCst)
            .saturating_add(1);
        self.timing_strikes.store(strikes, Ordering::SeqCst);
        if strikes < TIMING_STRIKES {
            warn!(strikes, "Execution timing anomaly observed");
            return false;
        }
        true
    }
}

impl TamperCheck for Sentinel {
    fn is_compromised(&self) -> bool {
        if Self::debugger_attached() {
            error!("Debugger attachment detected");
            return true;
        }
        if self.timing_tripped(timing_anomaly()) {
            error!("Repeated execution timing anomaly detected");
            return true;
        }
        if self.code_modified() {
            error!("Code integrity mismatch detected");
            return true;
        }
        debug!("Tamper checks passed");
        false
    }
}

/// Add-then-rotate checksum over `bytes`.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)).rotate_left(1))
}

/// A trivial loop taking over 100 ms indicates breakpoints or single-stepping.
fn timing_anomaly() -> bool {
    let start = Instant::now();
    let mut sum = 0u64;
    for i in 0..1000 {
        sum = sum.wrapping_add(i);
    }
    std::hint::black_box(sum);
    start.elapsed().as_millis() > 100
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod debugger {
    pub(super) fn attached() -> bool {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| super::tracer_pid(&status))
            .is_some_and(|pid| pid != 0)
    }
}

#[cfg(target_os = "macos")]
mod debugger {
    /// `P_TRACED` from `<sys/proc.h>`.
    const P_TRACED: i32 = 0x0000_0800;
    /// Conservative size of `struct kinfo_proc`.
    const KINFO_PROC_SIZE: usize = 648;
    /// Offset of `kp_proc.p_flag`.
    const P_FLAG_OFFSET: usize = 16;

    pub(super) fn attached() -> bool {
        let mut buf = [0u8; KINFO_PROC_SIZE];
        let mut size: libc::size_t = KINFO_PROC_SIZE;
        // SAFETY: the MIB names the current process and `buf` is large
        // enough for `kinfo_proc`; sysctl writes at most `size` bytes.
        let result = unsafe {
            let mut mib: [libc::c_int; 4] = [
                libc::CTL_KERN,
                libc::KERN_PROC,
                libc::KERN_PROC_PID,
                libc::getpid(),
            ];
            libc::sysctl(
                mib.as_mut_ptr(),
                4,
                buf.as_mut_ptr().cast::<libc::c_void>(),
                &mut size,
                std::ptr::null_mut(),
                0,
            )
        };
        if result != 0 || size < P_FLAG_OFFSET + 4 {
            return false;
        }
        let mut flag = [0u8; 4];
        flag.copy_from_slice(&buf[P_FLAG_OFFSET..P_FLAG_OFFSET + 4]);
        i32::from_ne_bytes(flag) & P_TRACED != 0
    }
}

#[cfg(target_os = "windows")]
mod debugger {
    use windows_sys::Win32::System::Diagnostics::Debug::{
        CheckRemoteDebuggerPresent, IsDebuggerPresent,
    };
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    pub(super) fn attached() -> bool {
        // SAFETY: both calls only query the current process.
        unsafe {
            if IsDebuggerPresent() != 0 {
                return true;
            }
            let mut remote = 0;
            CheckRemoteDebuggerPresent(GetCurrentProcess(), &mut remote) != 0 && remote != 0
        }
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "windows"
)))]
mod debugger {
    pub(super) fn attached() -> bool {
        false
    }
}

/// Extracts `TracerPid` from the contents of `/proc/<pid>/status`.
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
fn tracer_pid(status: &str) -> Option<i32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|rest| rest.trim().parse().ok())
}
