//! License keys and validation results.
//!
//! Keys are opaque to this crate: only the authority decides validity.
//! Issued keys look like `ABCDE-FGH23-JKLMN-PQRS4` (four dash-delimited
//! segments), but a key of any other shape is still sent for validation.
//!
//! A [`ValidationResult`] with `valid == true` can only be obtained by
//! translating an [`AuthorityResponse`], i.e. a body the authority returned.

use crate::error::{LicenseError, LicenseResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error text used when the authority could not be reached or understood.
pub const NETWORK_ERROR: &str = "Network error";

const SECS_PER_DAY: i64 = 24 * 60 * 60;

/// A user-supplied license key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LicenseKey(String);

impl LicenseKey {
    /// Wraps a raw key, trimming surrounding whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::InvalidKeyFormat`] if the key is empty after trimming.
    pub fn new(raw: &str) -> LicenseResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(LicenseError::InvalidKeyFormat(
                "license key cannot be empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the raw key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the key has the issued shape: at least two
    /// dash-delimited, non-empty, ASCII alphanumeric segments.
    #[must_use]
    pub fn looks_well_formed(&self) -> bool {
        let segments: Vec<&str> = self.0.split('-').collect();
        segments.len() >= 2
            && segments
                .iter()
                .all(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric()))
    }

    /// Returns the key with every segment but the first and last hidden.
    #[must_use]
    pub fn masked(&self) -> String {
        let segments: Vec<&str> = self.0.split('-').collect();
        if segments.len() < 3 {
            let visible: String = self.0.chars().take(4).collect();
            return format!("{visible}****");
        }
        let last = segments.len() - 1;
        segments
            .iter()
            .enumerate()
            .map(|(i, s)| {
                if i == 0 || i == last {
                    (*s).to_string()
                } else {
                    "*".repeat(s.len())
                }
            })
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl TryFrom<String> for LicenseKey {
    type Error = LicenseError;

    fn try_from(raw: String) -> LicenseResult<Self> {
        Self::new(&raw)
    }
}

impl From<LicenseKey> for String {
    fn from(key: LicenseKey) -> Self {
        key.0
    }
}

impl fmt::Debug for LicenseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LicenseKey").field(&self.masked()).finish()
    }
}

/// The authority's response body.
///
/// `valid` is required; everything else is optional and unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityResponse {
    /// Whether the key is valid for the presented machine.
    pub valid: bool,
    /// Denial reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Expiry timestamp as sent by the authority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    /// Whole days until expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_remaining: Option<i64>,
}

/// Outcome of one validation round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    valid: bool,
    error: Option<String>,
    expires_at: Option<String>,
    days_remaining: Option<i64>,
}

impl ValidationResult {
    /// Translates the authority's attestation verbatim.
    #[must_use]
    pub fn from_response(response: AuthorityResponse) -> Self {
        if response.valid {
            Self {
                valid: true,
                error: None,
                expires_at: response.expires_at,
                days_remaining: response.days_remaining,
            }
        } else {
            Self::denied(response.error.unwrap_or_else(|| "License key rejected".to_string()))
        }
    }

    /// A denial with the given reason.
    #[must_use]
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(reason.into()),
            expires_at: None,
            days_remaining: None,
        }
    }

    /// A denial caused by transport failure or an unreadable response.
    #[must_use]
    pub fn network_error() -> Self {
        Self::denied(NETWORK_ERROR)
    }

    /// Returns true if the authority attested validity.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Returns the denial reason.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Returns the expiry exactly as the authority sent it.
    #[must_use]
    pub fn expires_at(&self) -> Option<&str> {
        self.expires_at.as_deref()
    }

    /// Parses the expiry as an RFC 3339 timestamp.
    #[must_use]
    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        self.expires_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Returns the remaining days reported by the authority.
    #[must_use]
    pub fn days_remaining(&self) -> Option<i64> {
        self.days_remaining
    }

    /// Expiry as seconds since the epoch: the parsed `expires_at`, or
    /// `now + days_remaining` days when only the day count is known.
    /// `None` if the day count overflows.
    #[must_use]
    pub fn expiry_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at_utc().map(|dt| dt.timestamp()).or_else(|| {
            self.days_remaining
                .and_then(|d| d.checked_mul(SECS_PER_DAY))
                .and_then(|secs| now.timestamp().checked_add(secs))
        })
    }
}

/// Whole days from `now` until `expiry`, rounded up and never negative.
#[must_use]
pub fn days_until(expiry: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let secs = (expiry - now).num_seconds();
    if secs <= 0 {
        return 0;
    }
    (secs + SECS_PER_DAY - 1) / SECS_PER_DAY
}
