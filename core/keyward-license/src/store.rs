//! Local persistence of the last validated key.
//!
//! The record is four pipe-delimited fields
//! (`key|last_validated_at|cached_expires_at|cached_valid`) with every byte
//! XORed with [`OBFUSCATION_KEY`]. The transform hides the key from casual
//! inspection and nothing more: it is not a confidentiality control, and a
//! loaded record is never evidence that a license is valid. The record only
//! pre-fills the key for the next startup validation.

use crate::error::{LicenseError, LicenseResult};
use crate::key::{LicenseKey, ValidationResult};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Single-byte XOR key applied to the record.
pub const OBFUSCATION_KEY: u8 = 0xAB;

/// File name of the record inside the config directory.
pub const RECORD_FILE_NAME: &str = "license.dat";

const FIELD_DELIMITER: char = '|';

/// The persisted trust cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustCacheRecord {
    /// Last key that validated successfully. Empty when absent.
    pub key: String,
    /// When that validation happened (seconds since epoch).
    pub last_validated_at: i64,
    /// Expiry reported at that validation (seconds since epoch, 0 if unknown).
    pub cached_expires_at: i64,
    /// Hint flag; always written false and never consulted for authorization.
    pub cached_valid: bool,
}

impl TrustCacheRecord {
    /// The empty record returned for a missing or unreadable file.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if no key is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.key.trim().is_empty()
    }

    /// Builds the record written after a confirmed-valid round trip.
    #[must_use]
    pub fn for_validation(key: &LicenseKey, result: &ValidationResult, now: DateTime<Utc>) -> Self {
        Self {
            key: key.as_str().to_string(),
            last_validated_at: now.timestamp(),
            cached_expires_at: result.expiry_secs(now).unwrap_or(0),
            cached_valid: false,
        }
    }

    /// Returns the cached key, if one is present and usable.
    #[must_use]
    pub fn license_key(&self) -> Option<LicenseKey> {
        LicenseKey::new(&self.key).ok()
    }
}

/// Applies the symmetric XOR transform in place.
pub fn obfuscate(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        *b ^= OBFUSCATION_KEY;
    }
}

/// Serializes and obfuscates a record.
///
/// # Errors
///
/// Returns [`LicenseError::Storage`] if the key contains the field delimiter.
pub fn encode_record(record: &TrustCacheRecord) -> LicenseResult<Vec<u8>> {
    if record.key.contains(FIELD_DELIMITER) {
        return Err(LicenseError::Storage(
            "key contains the record delimiter".to_string(),
        ));
    }
    let mut bytes = format!(
        "{}|{}|{}|{}",
        record.key,
        record.last_validated_at,
        record.cached_expires_at,
        u8::from(record.cached_valid)
    )
    .into_bytes();
    obfuscate(&mut bytes);
    Ok(bytes)
}

/// Reverses [`encode_record`]. Anything malformed yields `None`.
#[must_use]
pub fn decode_record(bytes: &[u8]) -> Option<TrustCacheRecord> {
    let mut plain = bytes.to_vec();
    obfuscate(&mut plain);
    let text = String::from_utf8(plain).ok()?;

    let mut fields = text.splitn(4, FIELD_DELIMITER);
    let key = fields.next()?;
    let last_validated_at = fields.next()?.trim().parse::<i64>().ok()?;
    let cached_expires_at = fields.next()?.trim().parse::<i64>().ok()?;
    let cached_valid = fields.next()?.trim().parse::<i64>().ok()? != 0;

    Some(TrustCacheRecord {
        key: key.to_string(),
        last_validated_at,
        cached_expires_at,
        cached_valid,
    })
}

/// File-backed trust store.
#[derive(Debug, Clone)]
pub struct TrustStore {
    path: PathBuf,
}

impl TrustStore {
    /// Creates a store at an explicit path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Creates a store in the per-OS user config directory
    /// (`$XDG_CONFIG_HOME/keyward`, `~/Library/Application Support/keyward`,
    /// `%APPDATA%\keyward`), falling back to the working directory.
    #[must_use]
    pub fn at_default_location() -> Self {
        let dir = dirs::config_dir()
            .map(|d| d.join("keyward"))
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(dir.join(RECORD_FILE_NAME))
    }

    /// Returns the record path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the record. A missing, unreadable or malformed file yields the empty record.
    #[must_use]
    pub fn load(&self) -> TrustCacheRecord {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "No trust cache available");
                return TrustCacheRecord::empty();
            }
        };
        decode_record(&bytes).unwrap_or_else(|| {
            debug!(path = %self.path.display(), "Trust cache malformed, ignoring");
            TrustCacheRecord::empty()
        })
    }

    /// Overwrites the record.
    pub fn save(&self, record: &TrustCacheRecord) -> LicenseResult<()> {
        let bytes = encode_record(record)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    LicenseError::Storage(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }
        fs::write(&self.path, bytes).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Failed to write trust cache");
            LicenseError::Storage(format!("cannot write {}: {e}", self.path.display()))
        })
    }
}
