//! Error types for the license trust engine.

use thiserror::Error;

/// Licensing-specific errors.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// Invalid license key format.
    #[error("invalid license key format: {0}")]
    InvalidKeyFormat(String),

    /// Transport-level failure talking to the authority.
    #[error("network error: {0}")]
    Network(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Authority answered with a body we could not interpret.
    #[error("invalid authority response: {0}")]
    InvalidResponse(String),

    /// Trust store error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No validated key is held, so there is nothing to revalidate.
    #[error("license not activated")]
    NotActivated,

    /// Debugger or code tampering detected.
    #[error("security violation detected")]
    SecurityViolation,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for license operations.
pub type LicenseResult<T> = Result<T, LicenseError>;
