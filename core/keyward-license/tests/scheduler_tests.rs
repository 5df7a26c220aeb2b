mod common;

use common::{
    FixedSentinel, GatedAuthority, RecordingTerminator, ScriptedAuthority, ScriptedPrompt,
    TEST_KEY, attested, scheduler, test_machine_id,
};
use keyward_license::{
    AuthorityResponse, LicenseError, NETWORK_ERROR, PromptNotice, Revocation, StartupOutcome,
    TrustCacheRecord, TrustPhase, TrustStore, ValidationResult,
};
use std::time::Duration;
use tempfile::TempDir;

const HOUR: Duration = Duration::from_secs(60 * 60);

fn seed_cache(dir: &TempDir, key: &str) {
    TrustStore::new(dir.path().join("license.dat"))
        .save(&TrustCacheRecord {
            key: key.to_string(),
            last_validated_at: 1_700_000_000,
            cached_expires_at: 1_702_592_000,
            cached_valid: false,
        })
        .unwrap();
}

// ── Startup ─────────────────────────────────────────────────────

#[tokio::test]
async fn first_run_persists_key_and_trusts() {
    let dir = TempDir::new().unwrap();
    let authority = ScriptedAuthority::new(vec![attested(30)]);
    let mut scheduler = scheduler(
        dir.path(),
        authority.clone(),
        FixedSentinel::clean(),
        RecordingTerminator::new(),
    );
    assert_eq!(scheduler.phase(), TrustPhase::Unstarted);

    let mut prompt = ScriptedPrompt::with_inputs(&[TEST_KEY]);
    let outcome = scheduler.establish(&mut prompt).await.unwrap();

    match outcome {
        StartupOutcome::Trusted(result) => assert_eq!(result.days_remaining(), Some(30)),
        StartupOutcome::Aborted => panic!("expected trust"),
    }
    assert!(scheduler.is_trusted());
    assert_eq!(scheduler.phase(), TrustPhase::Trusted);
    assert_eq!(
        authority.calls(),
        vec![(TEST_KEY.to_string(), test_machine_id().as_str().to_string())]
    );

    let record = scheduler.store().load();
    assert_eq!(record.key, TEST_KEY);
    assert!(!record.cached_valid);
    assert!(record.last_validated_at > 0);
    assert!(prompt.notices.contains(&PromptNotice::Validating));
}

#[tokio::test]
async fn cached_key_validates_without_prompting() {
    let dir = TempDir::new().unwrap();
    seed_cache(&dir, TEST_KEY);
    let authority = ScriptedAuthority::new(vec![attested(12)]);
    let mut scheduler = scheduler(
        dir.path(),
        authority.clone(),
        FixedSentinel::clean(),
        RecordingTerminator::new(),
    );

    let mut prompt = ScriptedPrompt::default();
    let outcome = scheduler.establish(&mut prompt).await.unwrap();

    assert!(matches!(outcome, StartupOutcome::Trusted(_)));
    assert_eq!(prompt.reads, 0);
    assert_eq!(prompt.notices[0], PromptNotice::CachedKeyFound);
    assert_eq!(authority.calls().len(), 1);

    let record = scheduler.store().load();
    assert!(record.last_validated_at > 1_700_000_000);
}

#[tokio::test]
async fn invalid_cached_key_reprompts_and_rejects_empty_input() {
    let dir = TempDir::new().unwrap();
    seed_cache(&dir, "OLD0-0000-0000-0000");
    let authority = ScriptedAuthority::new(vec![
        ValidationResult::denied("License key has been revoked"),
        attested(30),
    ]);
    let mut scheduler = scheduler(
        dir.path(),
        authority.clone(),
        FixedSentinel::clean(),
        RecordingTerminator::new(),
    );

    let mut prompt = ScriptedPrompt::with_inputs(&["", "   ", TEST_KEY]);
    let outcome = scheduler.establish(&mut prompt).await.unwrap();

    assert!(matches!(outcome, StartupOutcome::Trusted(_)));
    assert_eq!(prompt.reads, 3);
    assert_eq!(
        prompt
            .notices
            .iter()
            .filter(|n| **n == PromptNotice::EmptyKey)
            .count(),
        2
    );
    assert!(prompt.notices.contains(&PromptNotice::CachedKeyRejected(
        "License key has been revoked".to_string()
    )));

    // Empty entries never reach the authority.
    let keys: Vec<String> = authority.calls().into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["OLD0-0000-0000-0000".to_string(), TEST_KEY.to_string()]);
    assert_eq!(scheduler.store().load().key, TEST_KEY);
}

#[tokio::test]
async fn oversized_day_count_does_not_break_startup() {
    let dir = TempDir::new().unwrap();
    let huge = ValidationResult::from_response(AuthorityResponse {
        valid: true,
        error: None,
        expires_at: None,
        days_remaining: Some(i64::MAX),
    });
    let mut scheduler = scheduler(
        dir.path(),
        ScriptedAuthority::new(vec![huge]),
        FixedSentinel::clean(),
        RecordingTerminator::new(),
    );

    let mut prompt = ScriptedPrompt::with_inputs(&[TEST_KEY]);
    let outcome = scheduler.establish(&mut prompt).await.unwrap();

    assert!(matches!(outcome, StartupOutcome::Trusted(_)));
    let record = scheduler.store().load();
    assert_eq!(record.key, TEST_KEY);
    assert_eq!(record.cached_expires_at, 0);
}

#[tokio::test]
async fn denied_key_is_not_persisted() {
    let dir = TempDir::new().unwrap();
    let authority = ScriptedAuthority::new(vec![ValidationResult::denied("Invalid license key")]);
    let mut scheduler = scheduler(
        dir.path(),
        authority,
        FixedSentinel::clean(),
        RecordingTerminator::new(),
    );

    let mut prompt = ScriptedPrompt::with_inputs(&[TEST_KEY]).retry_answers(&[false]);
    let outcome = scheduler.establish(&mut prompt).await.unwrap();

    assert_eq!(outcome, StartupOutcome::Aborted);
    assert!(!scheduler.is_trusted());
    assert_eq!(scheduler.phase(), TrustPhase::Unstarted);
    assert!(scheduler.store().load().is_empty());
    assert!(prompt
        .notices
        .contains(&PromptNotice::Rejected("Invalid license key".to_string())));
}

#[tokio::test]
async fn retry_after_denial_accepts_second_key() {
    let dir = TempDir::new().unwrap();
    let authority = ScriptedAuthority::new(vec![
        ValidationResult::network_error(),
        attested(7),
    ]);
    let mut scheduler = scheduler(
        dir.path(),
        authority,
        FixedSentinel::clean(),
        RecordingTerminator::new(),
    );

    let mut prompt =
        ScriptedPrompt::with_inputs(&["WRNG-0000-0000-0000", TEST_KEY]).retry_answers(&[true]);
    let outcome = scheduler.establish(&mut prompt).await.unwrap();

    assert!(matches!(outcome, StartupOutcome::Trusted(_)));
    assert!(prompt
        .notices
        .contains(&PromptNotice::Rejected(NETWORK_ERROR.to_string())));
    assert_eq!(scheduler.store().load().key, TEST_KEY);
}

#[tokio::test]
async fn closed_input_aborts_cleanly() {
    let dir = TempDir::new().unwrap();
    let terminator = RecordingTerminator::new();
    let mut scheduler = scheduler(
        dir.path(),
        ScriptedAuthority::new(vec![]),
        FixedSentinel::clean(),
        terminator.clone(),
    );

    let mut prompt = ScriptedPrompt::default();
    let outcome = scheduler.establish(&mut prompt).await.unwrap();

    assert_eq!(outcome, StartupOutcome::Aborted);
    assert!(terminator.revocations().is_empty());
}

#[tokio::test]
async fn tamper_detection_blocks_startup() {
    let dir = TempDir::new().unwrap();
    let authority = ScriptedAuthority::new(vec![attested(30)]);
    let mut scheduler = scheduler(
        dir.path(),
        authority.clone(),
        FixedSentinel::compromised(),
        RecordingTerminator::new(),
    );

    let mut prompt = ScriptedPrompt::with_inputs(&[TEST_KEY]);
    let err = scheduler.establish(&mut prompt).await.unwrap_err();

    assert!(matches!(err, LicenseError::SecurityViolation));
    assert_eq!(prompt.reads, 0);
    assert!(authority.calls().is_empty());
    assert!(!scheduler.is_trusted());
    assert_eq!(prompt.notices, vec![PromptNotice::SecurityViolation]);
}

#[tokio::test]
async fn start_requires_trust() {
    let dir = TempDir::new().unwrap();
    let mut scheduler = scheduler(
        dir.path(),
        ScriptedAuthority::new(vec![]),
        FixedSentinel::clean(),
        RecordingTerminator::new(),
    );
    assert!(matches!(scheduler.start(), Err(LicenseError::NotActivated)));
    assert!(!scheduler.is_running());
}

// ── Background revalidation ─────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn successful_revalidation_keeps_trust() {
    let dir = TempDir::new().unwrap();
    let authority = ScriptedAuthority::new(vec![attested(30), attested(29), attested(28)]);
    let terminator = RecordingTerminator::new();
    let mut scheduler = scheduler(
        dir.path(),
        authority.clone(),
        FixedSentinel::clean(),
        terminator.clone(),
    );

    let mut prompt = ScriptedPrompt::with_inputs(&[TEST_KEY]);
    scheduler.establish(&mut prompt).await.unwrap();
    scheduler.start().unwrap();
    assert!(scheduler.is_running());

    tokio::time::sleep(HOUR * 2 + Duration::from_secs(30)).await;

    assert_eq!(authority.calls().len(), 3);
    assert!(scheduler.is_trusted());
    assert!(scheduler.is_running());
    assert_eq!(scheduler.phase(), TrustPhase::Trusted);
    assert!(terminator.revocations().is_empty());

    scheduler.stop().await;
    assert!(!scheduler.is_running());
    assert!(scheduler.is_trusted());
}

#[tokio::test(start_paused = true)]
async fn no_revalidation_before_interval_elapses() {
    let dir = TempDir::new().unwrap();
    let authority = ScriptedAuthority::new(vec![attested(30)]);
    let mut scheduler = scheduler(
        dir.path(),
        authority.clone(),
        FixedSentinel::clean(),
        RecordingTerminator::new(),
    );

    let mut prompt = ScriptedPrompt::with_inputs(&[TEST_KEY]);
    scheduler.establish(&mut prompt).await.unwrap();
    scheduler.start().unwrap();

    tokio::time::sleep(HOUR - Duration::from_secs(5)).await;
    assert_eq!(authority.calls().len(), 1);
    assert!(scheduler.is_trusted());

    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn network_error_on_revalidation_revokes() {
    let dir = TempDir::new().unwrap();
    let authority = ScriptedAuthority::new(vec![attested(30), ValidationResult::network_error()]);
    let terminator = RecordingTerminator::new();
    let mut scheduler = scheduler(
        dir.path(),
        authority,
        FixedSentinel::clean(),
        terminator.clone(),
    );
    let handle = scheduler.handle();

    let mut prompt = ScriptedPrompt::with_inputs(&[TEST_KEY]);
    scheduler.establish(&mut prompt).await.unwrap();
    scheduler.start().unwrap();
    assert!(handle.is_trusted());

    tokio::time::sleep(HOUR + Duration::from_secs(5)).await;

    assert!(!handle.is_trusted());
    assert!(!handle.is_running());
    assert_eq!(handle.phase(), TrustPhase::Revoked);
    assert_eq!(
        terminator.revocations(),
        vec![Revocation::Denied(NETWORK_ERROR.to_string())]
    );

    scheduler.stop().await;
    assert_eq!(terminator.revocations().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn authority_denial_on_revalidation_revokes_with_message() {
    let dir = TempDir::new().unwrap();
    let authority = ScriptedAuthority::new(vec![
        attested(30),
        ValidationResult::denied("License key has expired"),
    ]);
    let terminator = RecordingTerminator::new();
    let mut scheduler = scheduler(
        dir.path(),
        authority,
        FixedSentinel::clean(),
        terminator.clone(),
    );

    let mut prompt = ScriptedPrompt::with_inputs(&[TEST_KEY]);
    scheduler.establish(&mut prompt).await.unwrap();
    scheduler.start().unwrap();

    tokio::time::sleep(HOUR + Duration::from_secs(5)).await;

    assert!(!scheduler.is_trusted());
    assert_eq!(
        terminator.revocations(),
        vec![Revocation::Denied("License key has expired".to_string())]
    );
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn tamper_during_run_revokes_despite_valid_license() {
    let dir = TempDir::new().unwrap();
    let sentinel = FixedSentinel::clean();
    let terminator = RecordingTerminator::new();
    let mut scheduler = scheduler(
        dir.path(),
        ScriptedAuthority::new(vec![attested(30)]),
        sentinel.clone(),
        terminator.clone(),
    );

    let mut prompt = ScriptedPrompt::with_inputs(&[TEST_KEY]);
    scheduler.establish(&mut prompt).await.unwrap();
    scheduler.start().unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(scheduler.is_trusted());

    sentinel.trip();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(!scheduler.is_trusted());
    assert_eq!(scheduler.phase(), TrustPhase::Revoked);
    assert_eq!(terminator.revocations(), vec![Revocation::SecurityViolation]);
    scheduler.stop().await;
}

#[tokio::test]
async fn stop_interrupts_interval_wait_promptly() {
    let dir = TempDir::new().unwrap();
    let terminator = RecordingTerminator::new();
    let mut scheduler = scheduler(
        dir.path(),
        ScriptedAuthority::new(vec![attested(30)]),
        FixedSentinel::clean(),
        terminator.clone(),
    );

    let mut prompt = ScriptedPrompt::with_inputs(&[TEST_KEY]);
    scheduler.establish(&mut prompt).await.unwrap();
    scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(2), scheduler.stop()).await;

    assert!(stopped.is_ok(), "stop did not complete within 2s");
    assert!(!scheduler.is_running());
    assert!(scheduler.is_trusted());
    assert!(terminator.revocations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_during_revalidation_wins_over_late_denial() {
    let dir = TempDir::new().unwrap();
    let authority = GatedAuthority::new();
    let terminator = RecordingTerminator::new();
    let mut scheduler = scheduler(
        dir.path(),
        authority.clone(),
        FixedSentinel::clean(),
        terminator.clone(),
    );

    let mut prompt = ScriptedPrompt::with_inputs(&[TEST_KEY]);
    scheduler.establish(&mut prompt).await.unwrap();
    scheduler.start().unwrap();

    // Time advances to the hourly check, which then hangs in the authority.
    authority.entered.notified().await;
    assert_eq!(scheduler.phase(), TrustPhase::Revalidating);

    let stopped = tokio::time::timeout(Duration::from_secs(2), scheduler.stop()).await;
    assert!(stopped.is_ok(), "stop waited on the in-flight round trip");

    authority.release.notify_one();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(authority.calls(), 2);
    assert!(terminator.revocations().is_empty());
    assert_eq!(scheduler.phase(), TrustPhase::Trusted);
    assert!(scheduler.is_trusted());
    assert!(!scheduler.is_running());
}

#[tokio::test]
async fn start_twice_keeps_single_loop() {
    let dir = TempDir::new().unwrap();
    let mut scheduler = scheduler(
        dir.path(),
        ScriptedAuthority::new(vec![attested(30)]),
        FixedSentinel::clean(),
        RecordingTerminator::new(),
    );

    let mut prompt = ScriptedPrompt::with_inputs(&[TEST_KEY]);
    scheduler.establish(&mut prompt).await.unwrap();
    scheduler.start().unwrap();
    scheduler.start().unwrap();
    assert!(scheduler.is_running());

    scheduler.stop().await;
    assert!(!scheduler.is_running());
}
