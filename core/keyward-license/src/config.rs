//! Configuration for the trust engine.

use crate::error::{LicenseError, LicenseResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding [`TrustConfig::endpoint`].
pub const ENV_ENDPOINT: &str = "KEYWARD_ENDPOINT";
/// Environment variable overriding [`TrustConfig::api_token`].
pub const ENV_API_TOKEN: &str = "KEYWARD_API_TOKEN";

/// Default authority endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://licensing.keyward.dev/functions/v1/validate-key";

/// Trust engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Validation endpoint of the authority.
    pub endpoint: String,
    /// Bearer credential sent in the `Authorization` header.
    pub api_token: String,
    /// Upper bound for one validation round trip (seconds).
    pub timeout_secs: u64,
    /// Revalidation cadence while the host runs (seconds).
    pub revalidation_interval_secs: u64,
    /// Granularity of the background loop (milliseconds).
    pub heartbeat_millis: u64,
    /// Overrides the per-OS trust cache location.
    pub cache_path: Option<PathBuf>,
    /// Known-good checksum of the response translation routine.
    pub expected_code_checksum: Option<u32>,
    /// Allows plain `http://` endpoints. Local mock authorities only.
    pub allow_insecure_transport: bool,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_token: String::new(),
            timeout_secs: 10,
            revalidation_interval_secs: 60 * 60,
            heartbeat_millis: 1_000,
            cache_path: None,
            expected_code_checksum: None,
            allow_insecure_transport: false,
        }
    }
}

impl TrustConfig {
    /// Reads a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: &Path) -> LicenseResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            LicenseError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Overlays `KEYWARD_ENDPOINT` / `KEYWARD_API_TOKEN` when they are set.
    #[must_use]
    pub fn apply_env(mut self) -> Self {
        if let Ok(endpoint) = std::env::var(ENV_ENDPOINT) {
            if !endpoint.trim().is_empty() {
                self.endpoint = endpoint.trim().to_string();
            }
        }
        if let Ok(token) = std::env::var(ENV_API_TOKEN) {
            if !token.trim().is_empty() {
                self.api_token = token.trim().to_string();
            }
        }
        self
    }

    /// Checks that the configuration can drive a live authority.
    pub fn validate(&self) -> LicenseResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(LicenseError::Config("endpoint is empty".to_string()));
        }
        if !self.endpoint.starts_with("https://") && !self.allow_insecure_transport {
            return Err(LicenseError::Config(format!(
                "endpoint must use https: {}",
                self.endpoint
            )));
        }
        if self.api_token.trim().is_empty() {
            return Err(LicenseError::Config("API token is empty".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(LicenseError::Config("timeout must be non-zero".to_string()));
        }
        if self.revalidation_interval_secs == 0 || self.heartbeat_millis == 0 {
            return Err(LicenseError::Config(
                "revalidation interval and heartbeat must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Round-trip timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Revalidation interval.
    #[must_use]
    pub fn revalidation_interval(&self) -> Duration {
        Duration::from_secs(self.revalidation_interval_secs)
    }

    /// Background loop heartbeat.
    #[must_use]
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_millis)
    }
}
