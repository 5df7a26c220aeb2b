//! Trust scheduler: startup validation and background revalidation.
//!
//! ```text
//! Unstarted -> AwaitingValidation -> Trusted -> Revalidating -> Trusted
//!                    ^       |                       |
//!                    +-------+ (retry)               +-> Revoked (terminal)
//! ```
//!
//! Startup failures are a clean abort back to `Unstarted`. A failed
//! revalidation, for any reason including an unreachable authority, is
//! terminal: trust is revoked and the [`Terminator`] ends the process from
//! the background task. There is no grace period and no backoff.
//!
//! The only state shared with the background task is [`TrustState`]: two
//! flags and the phase, all atomics.

use crate::client::Authority;
use crate::config::TrustConfig;
use crate::device::MachineId;
use crate::error::{LicenseError, LicenseResult};
use crate::key::{LicenseKey, NETWORK_ERROR, ValidationResult};
use crate::sentinel::{Sentinel, TamperCheck};
use crate::store::{TrustCacheRecord, TrustStore};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Process exit code used when trust is revoked.
pub const EXIT_REVOKED: i32 = 1;

/// Phase of the trust state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrustPhase {
    /// Nothing validated yet, or startup was aborted.
    Unstarted = 0,
    /// Startup is trying a cached or entered key.
    AwaitingValidation = 1,
    /// The authority attested the key.
    Trusted = 2,
    /// A scheduled round trip is in flight.
    Revalidating = 3,
    /// Trust was withdrawn. Terminal.
    Revoked = 4,
}

impl TrustPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::AwaitingValidation,
            2 => Self::Trusted,
            3 => Self::Revalidating,
            4 => Self::Revoked,
            _ => Self::Unstarted,
        }
    }
}

/// Process-wide trust flags.
#[derive(Debug)]
pub struct TrustState {
    running: AtomicBool,
    license_valid: AtomicBool,
    phase: AtomicU8,
}

impl TrustState {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            license_valid: AtomicBool::new(false),
            phase: AtomicU8::new(TrustPhase::Unstarted as u8),
        }
    }

    /// Returns true while the last attestation stands.
    pub fn is_trusted(&self) -> bool {
        self.license_valid.load(Ordering::SeqCst)
    }

    /// Returns true while the revalidation loop is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current phase.
    pub fn phase(&self) -> TrustPhase {
        TrustPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: TrustPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn mark_trusted(&self) {
        self.license_valid.store(true, Ordering::SeqCst);
        self.set_phase(TrustPhase::Trusted);
    }

    /// Sets `running`, returning false if it was already set.
    fn begin_running(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn stop_running(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn revoke(&self) {
        self.license_valid.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.set_phase(TrustPhase::Revoked);
    }
}

/// Read-only view of the trust state for the host application.
#[derive(Debug, Clone)]
pub struct TrustHandle(Arc<TrustState>);

impl TrustHandle {
    /// Returns true while the host may keep operating.
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        self.0.is_trusted()
    }

    /// Returns true while the revalidation loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.0.is_running()
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> TrustPhase {
        self.0.phase()
    }
}

/// Why trust was revoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revocation {
    /// The authority denied the key, or could not be reached.
    Denied(String),
    /// A tamper check fired.
    SecurityViolation,
}

impl fmt::Display for Revocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied(reason) => write!(f, "License validation failed: {reason}"),
            Self::SecurityViolation => f.write_str("Security violation detected"),
        }
    }
}

/// Ends the host once trust is revoked.
pub trait Terminator: Send + Sync {
    /// Called from the background task right after the flags are cleared.
    fn terminate(&self, revocation: &Revocation);
}

/// Exits the process with [`EXIT_REVOKED`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn terminate(&self, revocation: &Revocation) {
        eprintln!("\n[X] {revocation}. Application will terminate.");
        std::process::exit(EXIT_REVOKED);
    }
}

/// Messages shown to the operator during startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptNotice {
    /// A key was found in the trust store.
    CachedKeyFound,
    /// The cached key was denied.
    CachedKeyRejected(String),
    /// Input was empty.
    EmptyKey,
    /// A round trip is starting.
    Validating,
    /// The entered key was denied.
    Rejected(String),
    /// The authority attested the key.
    Accepted {
        /// Days left on the license.
        days_remaining: Option<i64>,
        /// Expiry as sent by the authority.
        expires_at: Option<String>,
    },
    /// A tamper check fired.
    SecurityViolation,
}

impl fmt::Display for PromptNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CachedKeyFound => f.write_str("Found cached license key..."),
            Self::CachedKeyRejected(reason) => {
                write!(f, "Cached key is invalid ({reason}), please enter a new one.")
            }
            Self::EmptyKey => f.write_str("License key cannot be empty!"),
            Self::Validating => f.write_str("Validating license with server..."),
            Self::Rejected(reason) => write!(f, "Validation error: {reason}"),
            Self::Accepted {
                days_remaining,
                expires_at,
            } => {
                f.write_str("License is valid!")?;
                if let Some(days) = days_remaining {
                    write!(f, " Days remaining: {days}.")?;
                }
                if let Some(expiry) = expires_at {
                    write!(f, " Expires: {expiry}.")?;
                }
                Ok(())
            }
            Self::SecurityViolation => f.write_str("Invalid environment detected."),
        }
    }
}

/// Interactive collaborator supplying keys during startup.
#[async_trait]
pub trait KeyPrompt: Send {
    /// Reads one key entry. `None` means input is closed.
    async fn read_key(&mut self) -> Option<String>;

    /// Asks whether to try another key after a denial.
    async fn confirm_retry(&mut self) -> bool;

    /// Shows a notice to the operator.
    async fn notify(&mut self, notice: &PromptNotice);
}

/// Result of the startup flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupOutcome {
    /// The authority attested a key.
    Trusted(ValidationResult),
    /// The operator gave up. Not a security event.
    Aborted,
}

/// Orchestrates startup validation and periodic revalidation.
pub struct TrustScheduler {
    authority: Arc<dyn Authority>,
    store: TrustStore,
    sentinel: Arc<dyn TamperCheck>,
    terminator: Arc<dyn Terminator>,
    machine_id: MachineId,
    interval: Duration,
    heartbeat: Duration,
    state: Arc<TrustState>,
    key: Option<LicenseKey>,
    cancel: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl TrustScheduler {
    /// Creates a scheduler with the default store location, sentinel,
    /// process-exit terminator and the derived machine identity.
    pub fn new(config: &TrustConfig, authority: Arc<dyn Authority>) -> Self {
        let store = config
            .cache_path
            .clone()
            .map(TrustStore::new)
            .unwrap_or_else(TrustStore::at_default_location);

        Self {
            authority,
            store,
            sentinel: Arc::new(Sentinel::from_config(config)),
            terminator: Arc::new(ProcessExit),
            machine_id: MachineId::derive(),
            interval: config.revalidation_interval(),
            heartbeat: config.heartbeat(),
            state: Arc::new(TrustState::new()),
            key: None,
            cancel: None,
            task: None,
        }
    }

    /// Uses a specific trust store.
    #[must_use]
    pub fn with_store(mut self, store: TrustStore) -> Self {
        self.store = store;
        self
    }

    /// Uses a specific tamper check.
    #[must_use]
    pub fn with_sentinel(mut self, sentinel: Arc<dyn TamperCheck>) -> Self {
        self.sentinel = sentinel;
        self
    }

    /// Uses a specific terminator.
    #[must_use]
    pub fn with_terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Uses a specific machine identity.
    #[must_use]
    pub fn with_machine_id(mut self, machine_id: MachineId) -> Self {
        self.machine_id = machine_id;
        self
    }

    /// Returns the machine identity presented to the authority.
    #[must_use]
    pub fn machine_id(&self) -> &MachineId {
        &self.machine_id
    }

    /// Returns the trust store.
    #[must_use]
    pub fn store(&self) -> &TrustStore {
        &self.store
    }

    /// Returns true while the host may keep operating.
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        self.state.is_trusted()
    }

    /// Returns true while the revalidation loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> TrustPhase {
        self.state.phase()
    }

    /// Returns a read-only handle for the host.
    #[must_use]
    pub fn handle(&self) -> TrustHandle {
        TrustHandle(Arc::clone(&self.state))
    }

    /// Runs the startup flow: cached key first, then interactive entry.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::SecurityViolation`] if a tamper checkpoint fires.
    pub async fn establish(&mut self, prompt: &mut dyn KeyPrompt) -> LicenseResult<StartupOutcome> {
        self.state.set_phase(TrustPhase::AwaitingValidation);
        self.checkpoint(prompt).await?;

        if let Some(key) = self.store.load().license_key() {
            info!(key = %key.masked(), "Found cached license key");
            prompt.notify(&PromptNotice::CachedKeyFound).await;
            self.checkpoint(prompt).await?;

            let result = self.validate_and_persist(&key).await;
            if result.is_valid() {
                return Ok(self.trust(key, result, prompt).await);
            }
            let reason = result.error().unwrap_or(NETWORK_ERROR).to_string();
            prompt.notify(&PromptNotice::CachedKeyRejected(reason)).await;
        }

        loop {
            let Some(raw) = prompt.read_key().await else {
                return Ok(self.abort("input closed"));
            };
            let key = match LicenseKey::new(&raw) {
                Ok(key) => key,
                Err(_) => {
                    prompt.notify(&PromptNotice::EmptyKey).await;
                    continue;
                }
            };
            if !key.looks_well_formed() {
                warn!(key = %key.masked(), "License key does not have the issued shape");
            }

            self.checkpoint(prompt).await?;
            prompt.notify(&PromptNotice::Validating).await;

            let result = self.validate_and_persist(&key).await;
            if result.is_valid() {
                return Ok(self.trust(key, result, prompt).await);
            }

            let reason = result.error().unwrap_or(NETWORK_ERROR).to_string();
            prompt.notify(&PromptNotice::Rejected(reason)).await;
            if !prompt.confirm_retry().await {
                return Ok(self.abort("operator exit"));
            }
        }
    }

    /// Starts the background revalidation loop. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::NotActivated`] unless startup reached `Trusted`.
    pub fn start(&mut self) -> LicenseResult<()> {
        let key = self.key.clone().ok_or(LicenseError::NotActivated)?;
        if !self.state.is_trusted() {
            return Err(LicenseError::NotActivated);
        }
        if !self.state.begin_running() {
            debug!("Revalidation loop already running");
            return Ok(());
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = LoopContext {
            key,
            machine_id: self.machine_id.clone(),
            authority: Arc::clone(&self.authority),
            store: self.store.clone(),
            sentinel: Arc::clone(&self.sentinel),
            terminator: Arc::clone(&self.terminator),
            state: Arc::clone(&self.state),
            interval: self.interval,
            heartbeat: self.heartbeat,
        };

        self.task = Some(tokio::spawn(revalidation_loop(ctx, cancel_rx)));
        self.cancel = Some(cancel_tx);
        info!(interval_secs = self.interval.as_secs(), "Periodic license validation started");
        Ok(())
    }

    /// Stops the loop and waits for the background task to exit.
    pub async fn stop(&mut self) {
        self.state.stop_running();
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Revalidation task ended abnormally");
            }
            info!("Periodic license validation stopped");
        }
    }

    async fn checkpoint(&self, prompt: &mut dyn KeyPrompt) -> LicenseResult<()> {
        if self.sentinel.is_compromised() {
            self.state.revoke();
            prompt.notify(&PromptNotice::SecurityViolation).await;
            return Err(LicenseError::SecurityViolation);
        }
        Ok(())
    }

    async fn validate_and_persist(&self, key: &LicenseKey) -> ValidationResult {
        let result = self.authority.validate(key, &self.machine_id).await;
        if result.is_valid() {
            persist(&self.store, key, &result);
        }
        result
    }

    async fn trust(
        &mut self,
        key: LicenseKey,
        result: ValidationResult,
        prompt: &mut dyn KeyPrompt,
    ) -> StartupOutcome {
        info!(key = %key.masked(), "License trusted");
        self.key = Some(key);
        self.state.mark_trusted();
        prompt
            .notify(&PromptNotice::Accepted {
                days_remaining: result.days_remaining(),
                expires_at: result.expires_at().map(str::to_string),
            })
            .await;
        StartupOutcome::Trusted(result)
    }

    fn abort(&mut self, reason: &str) -> StartupOutcome {
        info!(reason, "License startup aborted");
        self.state.set_phase(TrustPhase::Unstarted);
        StartupOutcome::Aborted
    }
}

impl Drop for TrustScheduler {
    fn drop(&mut self) {
        self.state.stop_running();
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(true);
        }
    }
}

/// Writes the record after a confirmed-valid round trip. Failures are logged only.
fn persist(store: &TrustStore, key: &LicenseKey, result: &ValidationResult) {
    let record = TrustCacheRecord::for_validation(key, result, chrono::Utc::now());
    if let Err(e) = store.save(&record) {
        warn!(error = %e, "Could not persist validated license key");
    }
}

/// Everything the background task owns.
struct LoopContext {
    key: LicenseKey,
    machine_id: MachineId,
    authority: Arc<dyn Authority>,
    store: TrustStore,
    sentinel: Arc<dyn TamperCheck>,
    terminator: Arc<dyn Terminator>,
    state: Arc<TrustState>,
    interval: Duration,
    heartbeat: Duration,
}

impl LoopContext {
    fn revoke(&self, revocation: Revocation) {
        error!(reason = %revocation, "License trust revoked");
        self.state.revoke();
        self.terminator.terminate(&revocation);
    }
}

async fn revalidation_loop(ctx: LoopContext, mut cancel: watch::Receiver<bool>) {
    let mut heartbeat = tokio::time::interval(ctx.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut next_check = Instant::now() + ctx.interval;

    loop {
        tokio::select! {
            biased;
            _ = cancel.changed() => break,
            _ = heartbeat.tick() => {}
        }
        if !ctx.state.is_running() {
            break;
        }

        if ctx.sentinel.is_compromised() {
            ctx.revoke(Revocation::SecurityViolation);
            return;
        }
        if Instant::now() < next_check {
            continue;
        }

        info!("Performing periodic license check");
        ctx.state.set_phase(TrustPhase::Revalidating);
        let outcome = tokio::select! {
            biased;
            _ = cancel.changed() => None,
            result = ctx.authority.validate(&ctx.key, &ctx.machine_id) => Some(result),
        };

        // A stop that lands while the round trip is in flight wins over its result.
        let result = match outcome {
            Some(result) if ctx.state.is_running() => result,
            _ => {
                debug!("Stop requested during revalidation");
                ctx.state.set_phase(TrustPhase::Trusted);
                break;
            }
        };

        if result.is_valid() {
            persist(&ctx.store, &ctx.key, &result);
            ctx.state.set_phase(TrustPhase::Trusted);
            next_check = Instant::now() + ctx.interval;
            info!(days_remaining = ?result.days_remaining(), "License still valid");
        } else {
            let reason = result.error().unwrap_or(NETWORK_ERROR).to_string();
            ctx.revoke(Revocation::Denied(reason));
            return;
        }
    }

    debug!("Revalidation loop exited");
}
