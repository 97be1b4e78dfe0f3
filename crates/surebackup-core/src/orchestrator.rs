//! Restore orchestration.
//!
//! Drives one restore point through
//! `NotStarted → Restoring → Polling → {Running, Failed, TimedOut, Cancelled}`
//! and always yields exactly one terminal [`RestoreResult`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::catalog::{BackupCatalog, RestoreRequest};
use crate::cloud::{CloudError, CloudProvider};
use crate::config::SureBackupConfig;
use crate::metrics::METRICS;
use crate::model::{RestoreMode, RestorePoint, RestoreResult, RestoreStatus, TestEnvironment};
use crate::obs;

/// Azure caps VM resource names at 64 characters.
const MAX_VM_NAME_LEN: usize = 64;
/// Hex digits of the source-name digest appended to every test VM name.
const NAME_DIGEST_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    NotStarted,
    Restoring,
    Polling,
    Running,
    Failed,
    TimedOut,
    Cancelled,
}

impl RestoreState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RestoreState::Running
                | RestoreState::Failed
                | RestoreState::TimedOut
                | RestoreState::Cancelled
        )
    }
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestoreState::NotStarted => "not_started",
            RestoreState::Restoring => "restoring",
            RestoreState::Polling => "polling",
            RestoreState::Running => "running",
            RestoreState::Failed => "failed",
            RestoreState::TimedOut => "timed_out",
            RestoreState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub vm_size: String,
    pub boot_timeout: Duration,
    pub poll_interval: Duration,
}

impl From<&SureBackupConfig> for OrchestratorConfig {
    fn from(config: &SureBackupConfig) -> Self {
        Self {
            vm_size: config.test_vm_size.clone(),
            boot_timeout: config.boot_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Name of the test VM restored from `source_vm`.
///
/// `sb-<prefix>-<digest>`: the prefix is the source name lowercased with
/// anything outside `[a-z0-9-]` replaced by `-`, and the digest is taken over
/// the untouched source name. Source VMs that sanitize to the same prefix
/// (`App_01`, `app-01`) still get distinct test VMs in the shared group.
pub fn test_vm_name(source_vm: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_vm.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let mut prefix: String = source_vm
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    prefix.truncate(MAX_VM_NAME_LEN - "sb-".len() - 1 - NAME_DIGEST_LEN);
    let prefix = prefix.trim_matches('-');

    if prefix.is_empty() {
        format!("sb-{}", &digest[..NAME_DIGEST_LEN])
    } else {
        format!("sb-{}-{}", prefix, &digest[..NAME_DIGEST_LEN])
    }
}

/// Tracks the current state and logs every transition.
struct Transitions<'a> {
    vm: &'a str,
    state: RestoreState,
}

impl Transitions<'_> {
    fn advance(&mut self, next: RestoreState) {
        obs::emit_restore_transition(self.vm, &self.state.to_string(), &next.to_string());
        self.state = next;
    }
}

enum PollOutcome {
    Running,
    Failed(String),
    TimedOut,
    Cancelled,
}

pub struct RestoreOrchestrator<'a> {
    catalog: &'a dyn BackupCatalog,
    cloud: &'a dyn CloudProvider,
    config: OrchestratorConfig,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(
        catalog: &'a dyn BackupCatalog,
        cloud: &'a dyn CloudProvider,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            catalog,
            cloud,
            config,
        }
    }

    /// Restore `point` into `env` and wait for the VM to run.
    ///
    /// Never returns an error: every failure mode is a terminal status on
    /// the result.
    pub async fn restore(
        &self,
        point: &RestorePoint,
        env: &TestEnvironment,
        cancel: &CancelSignal,
    ) -> RestoreResult {
        let started = Instant::now();
        let test_vm = test_vm_name(&point.vm_name);
        let mut transitions = Transitions {
            vm: &point.vm_name,
            state: RestoreState::NotStarted,
        };
        let finish = |status: RestoreStatus,
                      mode: RestoreMode,
                      session_id: Option<String>,
                      error: Option<String>| {
            let result = RestoreResult {
                source_vm_name: point.vm_name.clone(),
                test_vm_name: test_vm.clone(),
                status,
                mode,
                session_id,
                error,
                duration: started.elapsed(),
            };
            obs::emit_restore_finished(&result);
            result
        };

        if cancel.is_cancelled() {
            transitions.advance(RestoreState::Cancelled);
            return finish(
                RestoreStatus::Cancelled,
                RestoreMode::BackupRestore,
                None,
                Some("run cancelled before restore started".to_string()),
            );
        }

        METRICS.inc_restores_started();
        transitions.advance(RestoreState::Restoring);

        let request = RestoreRequest {
            restore_point_id: point.restore_point_id.clone(),
            resource_group: env.resource_group_name.clone(),
            vm_name: test_vm.clone(),
            vm_size: self.config.vm_size.clone(),
            region: env.region.clone(),
            network_id: env.network_id.clone(),
            subnet_id: env.subnet_id.clone(),
            power_on: true,
        };

        let submission = tokio::select! {
            biased;
            submitted = self.catalog.start_restore(&request) => submitted,
            _ = cancel.cancelled() => {
                transitions.advance(RestoreState::Cancelled);
                return finish(
                    RestoreStatus::Cancelled,
                    RestoreMode::BackupRestore,
                    None,
                    Some("run cancelled while submitting the restore".to_string()),
                );
            }
        };

        let (mode, session_id) = match submission {
            Ok(session_id) => {
                debug!(vm = %point.vm_name, session = %session_id, "restore session submitted");
                (RestoreMode::BackupRestore, Some(session_id))
            }
            Err(err) => {
                warn!(
                    vm = %point.vm_name,
                    error = %err,
                    "restore submission failed; deploying stand-in VM to validate the environment"
                );
                METRICS.inc_restore_fallbacks();
                if let Err(fallback_err) = self
                    .cloud
                    .deploy_standin_vm(env, &test_vm, &self.config.vm_size)
                    .await
                {
                    transitions.advance(RestoreState::Failed);
                    return finish(
                        RestoreStatus::Failed,
                        RestoreMode::BackupRestore,
                        None,
                        Some(format!(
                            "restore submission failed: {err}; stand-in deployment failed: {fallback_err}"
                        )),
                    );
                }
                (RestoreMode::StandIn, None)
            }
        };

        transitions.advance(RestoreState::Polling);
        let deadline = Instant::now() + self.config.boot_timeout;
        let outcome = self
            .poll_until_running(
                session_id.as_deref(),
                &env.resource_group_name,
                &test_vm,
                deadline,
                cancel,
            )
            .await;

        match outcome {
            PollOutcome::Running => {
                transitions.advance(RestoreState::Running);
                finish(RestoreStatus::Success, mode, session_id, None)
            }
            PollOutcome::Failed(message) => {
                transitions.advance(RestoreState::Failed);
                finish(RestoreStatus::Failed, mode, session_id, Some(message))
            }
            PollOutcome::TimedOut => {
                METRICS.inc_restore_timeouts();
                transitions.advance(RestoreState::TimedOut);
                let message = format!(
                    "VM {} was not observed running within {}s",
                    test_vm,
                    self.config.boot_timeout.as_secs()
                );
                finish(RestoreStatus::Timeout, mode, session_id, Some(message))
            }
            PollOutcome::Cancelled => {
                transitions.advance(RestoreState::Cancelled);
                finish(
                    RestoreStatus::Cancelled,
                    mode,
                    session_id,
                    Some("run cancelled while waiting for the VM".to_string()),
                )
            }
        }
    }

    /// Poll the catalog session to a terminal state, then the VM to running.
    async fn poll_until_running(
        &self,
        session_id: Option<&str>,
        resource_group: &str,
        vm_name: &str,
        deadline: Instant,
        cancel: &CancelSignal,
    ) -> PollOutcome {
        if let Some(session_id) = session_id {
            loop {
                let polled = self
                    .bounded(self.catalog.get_restore_session(session_id), deadline, cancel)
                    .await;
                let polled = match polled {
                    Ok(polled) => polled,
                    Err(outcome) => return outcome,
                };
                match polled {
                    Ok(session) if session.is_failed() => {
                        return PollOutcome::Failed(
                            session
                                .message
                                .unwrap_or_else(|| format!("restore session {session_id} failed")),
                        );
                    }
                    Ok(session) if session.is_terminal() => break,
                    Ok(session) => {
                        debug!(session = %session_id, state = ?session.state, "restore session in progress");
                    }
                    Err(err) => {
                        warn!(session = %session_id, error = %err, "restore session poll failed");
                    }
                }
                if let Some(outcome) = self.wait(deadline, cancel).await {
                    return outcome;
                }
            }
        }

        loop {
            let polled = self
                .bounded(self.cloud.vm_status(resource_group, vm_name), deadline, cancel)
                .await;
            let polled = match polled {
                Ok(polled) => polled,
                Err(outcome) => return outcome,
            };
            match polled {
                Ok(status) if status.is_running() => return PollOutcome::Running,
                Ok(status) => {
                    debug!(vm = %vm_name, power_state = ?status.power_state, "VM not running yet");
                }
                Err(CloudError::NotFound(_)) => {
                    debug!(vm = %vm_name, "VM not created yet");
                }
                Err(err) => {
                    warn!(vm = %vm_name, error = %err, "VM status poll failed");
                }
            }
            if let Some(outcome) = self.wait(deadline, cancel).await {
                return outcome;
            }
        }
    }

    /// Run one status call, giving up on cancellation or once it outlives
    /// both the deadline and one further poll interval. Catalog calls retry
    /// internally, so a single call can otherwise block for minutes.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = T>,
        deadline: Instant,
        cancel: &CancelSignal,
    ) -> Result<T, PollOutcome> {
        let limit = deadline.max(Instant::now() + self.config.poll_interval);
        tokio::select! {
            biased;
            value = call => Ok(value),
            _ = cancel.cancelled() => Err(PollOutcome::Cancelled),
            _ = tokio::time::sleep_until(limit) => Err(PollOutcome::TimedOut),
        }
    }

    /// Sleep one poll interval, clipped to the deadline. Returns the outcome
    /// that ends polling, if any.
    async fn wait(&self, deadline: Instant, cancel: &CancelSignal) -> Option<PollOutcome> {
        let now = Instant::now();
        if now >= deadline {
            return Some(PollOutcome::TimedOut);
        }
        let nap = self.config.poll_interval.min(deadline - now);
        match cancel.sleep(nap).await {
            Ok(()) => None,
            Err(_) => Some(PollOutcome::Cancelled),
        }
    }
}
