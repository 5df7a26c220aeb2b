//! Validation client for the licensing authority.
//!
//! One round trip is a `POST` of `{"key": .., "machine_id": ..}` with a
//! bearer credential. Every failure mode (connect, TLS, timeout, non-2xx,
//! unreadable body) folds into a denied [`ValidationResult`]; only the
//! error text tells them apart. Response authenticity rests on TLS alone.

use crate::config::TrustConfig;
use crate::device::{DeviceInfo, MachineId};
use crate::error::{LicenseError, LicenseResult};
use crate::key::{AuthorityResponse, LicenseKey, ValidationResult};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, info, warn};

/// The remote authority deciding which keys are valid on which machines.
#[async_trait]
pub trait Authority: Send + Sync {
    /// Validates `key` for `machine_id`. Never fails: problems become denials.
    async fn validate(&self, key: &LicenseKey, machine_id: &MachineId) -> ValidationResult;
}

/// Request body sent to the authority.
#[derive(Debug, Serialize)]
struct ValidationRequest<'a> {
    key: &'a str,
    machine_id: &'a str,
}

/// HTTPS implementation of [`Authority`].
pub struct HttpAuthority {
    client: Client,
    endpoint: String,
    api_token: String,
}

impl HttpAuthority {
    /// Builds a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Config`] for an unusable configuration, or
    /// [`LicenseError::Http`] if the TLS client cannot be initialised.
    pub fn new(config: &TrustConfig) -> LicenseResult<Self> {
        config.validate()?;

        let device = DeviceInfo::collect();
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .https_only(!config.allow_insecure_transport)
            .user_agent(format!(
                "keyward/{} ({}; {})",
                env!("CARGO_PKG_VERSION"),
                device.os_name,
                device.arch
            ))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_token: config.api_token.clone(),
        })
    }

    /// Returns the configured endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn round_trip(
        &self,
        key: &LicenseKey,
        machine_id: &MachineId,
    ) -> LicenseResult<(StatusCode, String)> {
        let body = ValidationRequest {
            key: key.as_str(),
            machine_id: machine_id.as_str(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_token))
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LicenseError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LicenseError::Network(e.to_string()))?;
        Ok((status, text))
    }
}

#[async_trait]
impl Authority for HttpAuthority {
    async fn validate(&self, key: &LicenseKey, machine_id: &MachineId) -> ValidationResult {
        debug!(key = %key.masked(), machine_id = %machine_id, "Validating license with authority");

        let result = match self.round_trip(key, machine_id).await {
            Ok((status, body)) => parse_response(status, &body),
            Err(e) => {
                warn!(error = %e, "License validation round trip failed");
                ValidationResult::network_error()
            }
        };

        if result.is_valid() {
            info!(days_remaining = ?result.days_remaining(), "Authority attested license");
        } else {
            warn!(error = result.error().unwrap_or_default(), "Authority denied license");
        }
        result
    }
}

/// Interprets an authority response.
///
/// A 2xx body must carry a boolean `valid`; otherwise the result is a network
/// error. A non-2xx status is always a denial, carrying the authority's
/// `error` message when the body has one.
#[must_use]
pub fn parse_response(status: StatusCode, body: &str) -> ValidationResult {
    let parsed = decode_body(body);

    if !status.is_success() {
        debug!(status = %status, "Authority returned non-success status");
        return match parsed {
            Ok(AuthorityResponse {
                error: Some(message),
                ..
            }) if !message.trim().is_empty() => ValidationResult::denied(message),
            _ => ValidationResult::network_error(),
        };
    }

    match parsed {
        Ok(response) => ValidationResult::from_response(response),
        Err(e) => {
            warn!(error = %e, "Unreadable authority response");
            ValidationResult::network_error()
        }
    }
}

fn decode_body(body: &str) -> LicenseResult<AuthorityResponse> {
    serde_json::from_str(body).map_err(|e| LicenseError::InvalidResponse(e.to_string()))
}
