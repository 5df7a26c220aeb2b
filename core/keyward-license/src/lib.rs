//! License trust engine for keyward.
//!
//! Software guarded by this crate runs only while a remote authority attests
//! that the presented license key is valid for this machine:
//! - Machine identity derived from a volume signal and the CPU signature
//! - Online validation against the authority over HTTPS
//! - A local trust store that remembers the last validated key
//! - Hourly background revalidation that terminates the host on failure
//! - Debugger and code-tampering checkpoints
//!
//! # Design Principles
//!
//! - **Always online**: validity is never derived from local state. The
//!   trust store only pre-fills the key; its valid flag is always written false.
//! - **Fail closed**: "could not reach the authority" is treated exactly like
//!   "the authority said no".
//! - **Fail fast**: a failed revalidation terminates the process from the
//!   background task itself, with no grace window.
//! - **Raise the cost of tampering**: the tamper checks are advisory-strength,
//!   not a proof of integrity.

mod client;
mod config;
mod device;
mod error;
mod key;
mod scheduler;
mod sentinel;
mod store;

pub use client::{Authority, HttpAuthority, parse_response};
pub use config::{DEFAULT_ENDPOINT, ENV_API_TOKEN, ENV_ENDPOINT, TrustConfig};
pub use device::{DeviceInfo, MachineId, MachineSignals};
pub use error::{LicenseError, LicenseResult};
pub use key::{AuthorityResponse, LicenseKey, NETWORK_ERROR, ValidationResult, days_until};
pub use reqwest::StatusCode;
pub use scheduler::{
    EXIT_REVOKED, KeyPrompt, ProcessExit, PromptNotice, Revocation, StartupOutcome, Terminator,
    TrustHandle, TrustPhase, TrustScheduler, TrustState,
};
pub use sentinel::{CODE_WINDOW_LEN, Sentinel, TIMING_STRIKES, TamperCheck, checksum};
pub use store::{
    OBFUSCATION_KEY, RECORD_FILE_NAME, TrustCacheRecord, TrustStore, decode_record,
    encode_record, obfuscate,
};
