//! Shared test doubles for the trust engine.

#![allow(dead_code)]

use async_trait::async_trait;
use keyward_license::{
    Authority, AuthorityResponse, KeyPrompt, LicenseKey, MachineId, MachineSignals, PromptNotice,
    Revocation, TamperCheck, Terminator, TrustConfig, TrustScheduler, TrustStore,
    ValidationResult,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

pub const TEST_KEY: &str = "ABCD-1234-EFGH-5678";

/// A valid attestation as the authority would send it.
pub fn attested(days_remaining: i64) -> ValidationResult {
    ValidationResult::from_response(AuthorityResponse {
        valid: true,
        error: None,
        expires_at: Some("2030-01-01T00:00:00Z".to_string()),
        days_remaining: Some(days_remaining),
    })
}

/// Fixed machine identity for tests.
pub fn test_machine_id() -> MachineId {
    MachineId::from_signals(&MachineSignals {
        volume_serial: Some("1A2B3C4D".to_string()),
        cpu_signature: Some("178BFBFF00A20F12".to_string()),
    })
}

/// Authority replaying scripted results; a network error once the script runs out.
#[derive(Default)]
pub struct ScriptedAuthority {
    responses: Mutex<VecDeque<ValidationResult>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedAuthority {
    pub fn new(responses: Vec<ValidationResult>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Keys and machine ids seen, in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Authority for ScriptedAuthority {
    async fn validate(&self, key: &LicenseKey, machine_id: &MachineId) -> ValidationResult {
        self.calls
            .lock()
            .unwrap()
            .push((key.as_str().to_string(), machine_id.as_str().to_string()));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(ValidationResult::network_error)
    }
}

/// Authority that attests the first call, then holds every later call until
/// released and denies it.
#[derive(Default)]
pub struct GatedAuthority {
    calls: AtomicUsize,
    /// Signalled when a held call starts.
    pub entered: Notify,
    /// Lets one held call finish.
    pub release: Notify,
}

impl GatedAuthority {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authority for GatedAuthority {
    async fn validate(&self, _key: &LicenseKey, _machine_id: &MachineId) -> ValidationResult {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return attested(30);
        }
        self.entered.notify_one();
        self.release.notified().await;
        ValidationResult::denied("License key has been revoked")
    }
}

/// Prompt replaying scripted inputs and recording notices.
#[derive(Default)]
pub struct ScriptedPrompt {
    pub inputs: VecDeque<String>,
    pub retries: VecDeque<bool>,
    pub notices: Vec<PromptNotice>,
    pub reads: usize,
}

impl ScriptedPrompt {
    pub fn with_inputs(inputs: &[&str]) -> Self {
        Self {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn retry_answers(mut self, answers: &[bool]) -> Self {
        self.retries = answers.iter().copied().collect();
        self
    }
}

#[async_trait]
impl KeyPrompt for ScriptedPrompt {
    async fn read_key(&mut self) -> Option<String> {
        self.reads += 1;
        self.inputs.pop_front()
    }

    async fn confirm_retry(&mut self) -> bool {
        self.retries.pop_front().unwrap_or(false)
    }

    async fn notify(&mut self, notice: &PromptNotice) {
        self.notices.push(notice.clone());
    }
}

/// Terminator that records instead of exiting.
#[derive(Default)]
pub struct RecordingTerminator {
    revocations: Mutex<Vec<Revocation>>,
}

impl RecordingTerminator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn revocations(&self) -> Vec<Revocation> {
        self.revocations.lock().unwrap().clone()
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, revocation: &Revocation) {
        self.revocations.lock().unwrap().push(revocation.clone());
    }
}

/// Tamper check with a switchable verdict.
#[derive(Default)]
pub struct FixedSentinel {
    compromised: AtomicBool,
}

impl FixedSentinel {
    pub fn clean() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn compromised() -> Arc<Self> {
        let sentinel = Self::default();
        sentinel.compromised.store(true, Ordering::SeqCst);
        Arc::new(sentinel)
    }

    pub fn trip(&self) {
        self.compromised.store(true, Ordering::SeqCst);
    }
}

impl TamperCheck for FixedSentinel {
    fn is_compromised(&self) -> bool {
        self.compromised.load(Ordering::SeqCst)
    }
}

/// Scheduler wired to test doubles and a store under `dir`.
pub fn scheduler(
    dir: &Path,
    authority: Arc<dyn Authority>,
    sentinel: Arc<FixedSentinel>,
    terminator: Arc<RecordingTerminator>,
) -> TrustScheduler {
    let config = TrustConfig {
        api_token: "test-token".to_string(),
        ..Default::default()
    };
    TrustScheduler::new(&config, authority)
        .with_store(TrustStore::new(dir.join("license.dat")))
        .with_sentinel(sentinel)
        .with_terminator(terminator)
        .with_machine_id(test_machine_id())
}
