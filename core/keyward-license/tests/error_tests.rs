use keyward_license::LicenseError;

#[test]
fn error_display_invalid_key_format() {
    let err = LicenseError::InvalidKeyFormat("bad format".into());
    assert!(format!("{err}").contains("invalid license key format"));
}

#[test]
fn error_display_network() {
    let err = LicenseError::Network("timeout".into());
    let msg = format!("{err}");
    assert!(msg.contains("network"));
    assert!(msg.contains("timeout"));
}

#[test]
fn error_display_invalid_response() {
    let err = LicenseError::InvalidResponse("missing valid".into());
    assert!(format!("{err}").contains("invalid authority response"));
}

#[test]
fn error_display_storage() {
    let err = LicenseError::Storage("disk full".into());
    assert!(format!("{err}").contains("storage"));
}

#[test]
fn error_display_config() {
    let err = LicenseError::Config("endpoint is empty".into());
    assert!(format!("{err}").contains("invalid configuration"));
}

#[test]
fn error_display_not_activated() {
    let err = LicenseError::NotActivated;
    assert!(format!("{err}").contains("not activated"));
}

#[test]
fn error_display_security_violation() {
    let err = LicenseError::SecurityViolation;
    assert!(format!("{err}").contains("security violation"));
}

#[test]
fn error_from_serde_json() {
    let serde_err: Result<serde_json::Value, _> = serde_json::from_str("not json");
    let license_err: LicenseError = serde_err.unwrap_err().into();
    assert!(format!("{license_err}").contains("serialization"));
}

#[test]
fn error_is_debug() {
    let err = LicenseError::NotActivated;
    let _ = format!("{err:?}");
}
