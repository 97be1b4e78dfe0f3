//! Structured lifecycle events for a SureBackup run.
//!
//! Every event carries a stable `event` field so log pipelines can filter on
//! it. Instrument a run's future with [`run_span`] to tag everything logged
//! during the run with its id.

use tracing::{info, warn};

use crate::model::{OverallResult, RestoreResult, TestEnvironment};

/// Run-scoped span; attach with `tracing::Instrument::instrument`.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("surebackup.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, region: &str, max_vms: usize) {
    info!(event = "run.started", run_id = %run_id, region = %region, max_vms = max_vms);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, tested: usize, passed: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        tested = tested,
        passed = passed,
    );
}

pub fn emit_candidates_selected(count: usize, fallback: bool) {
    info!(event = "candidates.selected", count = count, fallback = fallback);
}

pub fn emit_environment_provisioned(env: &TestEnvironment) {
    info!(
        event = "environment.provisioned",
        resource_group = %env.resource_group_name,
        region = %env.region,
        cidr = %env.network_cidr,
    );
}

pub fn emit_restore_transition(vm: &str, from: &str, to: &str) {
    info!(event = "restore.transition", vm = %vm, from = %from, to = %to);
}

pub fn emit_restore_finished(result: &RestoreResult) {
    info!(
        event = "restore.finished",
        vm = %result.source_vm_name,
        test_vm = %result.test_vm_name,
        status = %result.status,
        degraded = result.is_degraded(),
        duration_ms = result.duration.as_millis() as u64,
    );
}

pub fn emit_verification_finished(vm: &str, verdict: OverallResult) {
    info!(event = "verification.finished", vm = %vm, verdict = %verdict);
}

/// Retained environments still cost money; log the identifier for teardown.
pub fn emit_cleanup_retained(resource_group: &str, manual_command: &str) {
    warn!(
        event = "cleanup.retained",
        resource_group = %resource_group,
        manual_command = %manual_command,
        "test environment retained; remove it manually when done",
    );
}

pub fn emit_cleanup_failed(resource_group: &str, error: &dyn std::fmt::Display, manual_command: &str) {
    warn!(
        event = "cleanup.failed",
        resource_group = %resource_group,
        error = %error,
        manual_command = %manual_command,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let span = run_span("test-run-id");
        let _entered = span.enter();
    }
}
