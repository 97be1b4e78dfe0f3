//! Layered verification of a restored VM.
//!
//! Checks run in a fixed order: boot (the only hard gate), agent heartbeat,
//! TCP listener probes, then an optional operator script. Each check absorbs
//! its own failures; the composite verdict comes from
//! [`OverallResult::from_checks`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::cloud::{CloudProvider, OsType, RemoteScript, ScriptShell, VmStatus};
use crate::config::SureBackupConfig;
use crate::metrics::METRICS;
use crate::model::{
    OverallResult, PortDetail, RestorePoint, RestoreResult, RestoreStatus, TestEnvironment,
    VerificationResult,
};
use crate::obs;

/// How soft checks (heartbeat, ports) treat a negative signal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SoftCheckPolicy {
    /// Record a warning but mark the check verified. Agents and services on a
    /// fresh restore may legitimately still be starting.
    #[default]
    AlwaysPass,
    /// A negative signal marks the check unverified.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationConfig {
    pub ports: Vec<u16>,
    pub script_path: Option<PathBuf>,
    pub heartbeat_wait: Duration,
    pub soft_check_policy: SoftCheckPolicy,
}

impl From<&SureBackupConfig> for VerificationConfig {
    fn from(config: &SureBackupConfig) -> Self {
        Self {
            ports: config.verification_ports.clone(),
            script_path: config.verification_script_path.clone(),
            heartbeat_wait: config.heartbeat_wait(),
            soft_check_policy: config.soft_check_policy,
        }
    }
}

/// Listener probe printing `OPEN` or `CLOSED`.
fn port_probe(os: OsType, port: u16) -> RemoteScript {
    let source = match os {
        OsType::Windows => format!(
            "if (Get-NetTCPConnection -State Listen -LocalPort {port} -ErrorAction SilentlyContinue) {{ 'OPEN' }} else {{ 'CLOSED' }}"
        ),
        OsType::Linux => format!(
            "if ss -ltnH \"sport = :{port}\" | grep -q .; then echo OPEN; else echo CLOSED; fi"
        ),
    };
    RemoteScript::new(ScriptShell::for_os(os), &source)
}

fn probe_reports_open(stdout: &str) -> bool {
    stdout.lines().any(|line| line.trim() == "OPEN")
}

fn script_shell(path: &Path) -> ScriptShell {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("ps1") => ScriptShell::PowerShell,
        _ => ScriptShell::Shell,
    }
}

/// Accumulates check outcomes for one VM.
struct Checks {
    boot: bool,
    heartbeat: bool,
    ports: bool,
    port_details: Vec<PortDetail>,
    script: bool,
    script_output: Option<String>,
    details: Vec<String>,
}

impl Checks {
    fn new() -> Self {
        Self {
            boot: false,
            heartbeat: false,
            ports: false,
            port_details: Vec::new(),
            script: false,
            script_output: None,
            details: Vec::new(),
        }
    }

    fn into_result(self, restore: &RestoreResult) -> VerificationResult {
        let overall_result =
            OverallResult::from_checks(self.boot, self.heartbeat, self.ports, self.script);
        VerificationResult {
            source_vm_name: restore.source_vm_name.clone(),
            test_vm_name: restore.test_vm_name.clone(),
            restore_status: restore.status,
            degraded: restore.is_degraded(),
            boot_verified: self.boot,
            heartbeat_verified: self.heartbeat,
            ports_verified: self.ports,
            port_details: self.port_details,
            script_verified: self.script,
            script_output: self.script_output,
            overall_result,
            details: self.details,
        }
    }
}

pub struct VerificationPipeline<'a> {
    cloud: &'a dyn CloudProvider,
    config: VerificationConfig,
}

impl<'a> VerificationPipeline<'a> {
    pub fn new(cloud: &'a dyn CloudProvider, config: VerificationConfig) -> Self {
        Self { cloud, config }
    }

    /// Verify a restored VM. Restores that did not succeed are reported as
    /// `FAIL` without touching the VM.
    pub async fn verify(
        &self,
        restore: &RestoreResult,
        point: &RestorePoint,
        env: &TestEnvironment,
        cancel: &CancelSignal,
    ) -> VerificationResult {
        let mut checks = Checks::new();
        checks.details.push(format!(
            "restore point {} of {} created {}",
            point.restore_point_id,
            point.vm_name,
            point.creation_time.to_rfc3339()
        ));

        if !restore.is_success() {
            let reason = restore.error.as_deref().unwrap_or("no further detail");
            checks.details.push(match restore.status {
                RestoreStatus::Timeout => format!("restore timed out: {reason}"),
                RestoreStatus::Cancelled => format!("restore cancelled: {reason}"),
                _ => format!("restore failed: {reason}"),
            });
            return self.finish(checks, restore);
        }
        if restore.is_degraded() {
            checks.details.push(
                "stand-in VM: validates the test environment only, not backup data".to_string(),
            );
        }

        let rg = env.resource_group_name.as_str();
        let vm = restore.test_vm_name.as_str();

        let Some(status) = self.check_boot(rg, vm, &mut checks).await else {
            checks
                .details
                .push("boot not verified; remaining checks skipped".to_string());
            return self.finish(checks, restore);
        };

        if !self.check_heartbeat(rg, vm, &status, cancel, &mut checks).await {
            checks
                .details
                .push("verification cancelled; remaining checks skipped".to_string());
            return self.finish(checks, restore);
        }
        self.check_ports(rg, vm, status.os_type, &mut checks).await;
        self.check_script(rg, vm, &mut checks).await;

        self.finish(checks, restore)
    }

    fn finish(&self, checks: Checks, restore: &RestoreResult) -> VerificationResult {
        let result = checks.into_result(restore);
        if result.overall_result == OverallResult::Pass {
            METRICS.inc_verifications_passed();
        }
        obs::emit_verification_finished(&result.source_vm_name, result.overall_result);
        result
    }

    /// Returns the VM status when the VM is running.
    async fn check_boot(&self, rg: &str, vm: &str, checks: &mut Checks) -> Option<VmStatus> {
        match self.cloud.vm_status(rg, vm).await {
            Ok(status) if status.is_running() => {
                checks.boot = true;
                checks.details.push("boot: VM is running".to_string());
                Some(status)
            }
            Ok(status) => {
                checks.details.push(format!(
                    "boot: VM power state is {:?} (provisioning {})",
                    status.power_state, status.provisioning_state
                ));
                None
            }
            Err(err) => {
                checks.details.push(format!("boot: status query failed: {err}"));
                None
            }
        }
    }

    /// Returns false if cancelled during the wait.
    async fn check_heartbeat(
        &self,
        rg: &str,
        vm: &str,
        status: &VmStatus,
        cancel: &CancelSignal,
        checks: &mut Checks,
    ) -> bool {
        if status.agent_ready {
            checks.heartbeat = true;
            checks.details.push("heartbeat: agent ready".to_string());
            return true;
        }

        debug!(vm = %vm, wait_secs = self.config.heartbeat_wait.as_secs(), "agent not ready, waiting once");
        if cancel.sleep(self.config.heartbeat_wait).await.is_err() {
            return false;
        }

        let ready = match self.cloud.vm_status(rg, vm).await {
            Ok(status) => status.agent_ready,
            Err(err) => {
                warn!(vm = %vm, error = %err, "heartbeat re-check failed");
                false
            }
        };
        if ready {
            checks.heartbeat = true;
            checks
                .details
                .push("heartbeat: agent ready after wait".to_string());
            return true;
        }

        match self.config.soft_check_policy {
            SoftCheckPolicy::AlwaysPass => {
                warn!(vm = %vm, "agent still not ready; passing heartbeat under always_pass policy");
                checks.heartbeat = true;
                checks.details.push(
                    "heartbeat: agent not ready after wait (warning, soft check passed)".to_string(),
                );
            }
            SoftCheckPolicy::Strict => {
                checks
                    .details
                    .push("heartbeat: agent not ready after wait".to_string());
            }
        }
        true
    }

    async fn check_ports(&self, rg: &str, vm: &str, os: OsType, checks: &mut Checks) {
        if self.config.ports.is_empty() {
            checks.ports = true;
            checks.details.push("ports: none configured".to_string());
            return;
        }

        for &port in &self.config.ports {
            let detail = match self.cloud.run_command(rg, vm, &port_probe(os, port)).await {
                Ok(output) => PortDetail {
                    port,
                    listening: probe_reports_open(&output.stdout),
                    error: None,
                },
                Err(err) => PortDetail {
                    port,
                    listening: false,
                    error: Some(err.to_string()),
                },
            };
            checks.port_details.push(detail);
        }

        let listening: Vec<u16> = checks
            .port_details
            .iter()
            .filter(|d| d.listening)
            .map(|d| d.port)
            .collect();
        if !listening.is_empty() {
            checks.ports = true;
            checks
                .details
                .push(format!("ports: listening on {listening:?}"));
            return;
        }

        match self.config.soft_check_policy {
            SoftCheckPolicy::AlwaysPass => {
                warn!(vm = %vm, ports = ?self.config.ports, "no configured port is listening; passing under always_pass policy");
                checks.ports = true;
                checks.details.push(format!(
                    "ports: none of {:?} listening (warning, soft check passed)",
                    self.config.ports
                ));
            }
            SoftCheckPolicy::Strict => {
                checks.details.push(format!(
                    "ports: none of {:?} listening",
                    self.config.ports
                ));
            }
        }
    }

    async fn check_script(&self, rg: &str, vm: &str, checks: &mut Checks) {
        let Some(path) = &self.config.script_path else {
            checks.script = true;
            checks
                .details
                .push("script: not configured".to_string());
            return;
        };

        let source = match tokio::fs::read_to_string(path).await {
            Ok(source) => source,
            Err(err) => {
                checks.details.push(format!(
                    "script: cannot read {}: {}",
                    path.display(),
                    err
                ));
                return;
            }
        };

        let script = RemoteScript::new(script_shell(path), &source);
        match self.cloud.run_command(rg, vm, &script).await {
            Ok(output) => {
                checks.script = output.stderr.trim().is_empty();
                if checks.script {
                    checks.details.push("script: completed cleanly".to_string());
                } else {
                    checks
                        .details
                        .push(format!("script: error output: {}", output.stderr.trim()));
                }
                checks.script_output = Some(output.stdout);
            }
            Err(err) => {
                checks
                    .details
                    .push(format!("script: execution failed: {err}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudError, CommandOutput, PowerState};
    use crate::fakes::MemoryCloud;
    use crate::model::RestoreMode;
    use chrono::Utc;

    fn point() -> RestorePoint {
        RestorePoint {
            backup_name: "Azure Prod".into(),
            backup_id: "b1".into(),
            restore_point_id: "rp-1".into(),
            vm_name: "vmA".into(),
            creation_time: Utc::now(),
            job_name: None,
        }
    }

    fn env() -> TestEnvironment {
        TestEnvironment {
            resource_group_name: "rg".into(),
            region: "eastus".into(),
            network_cidr: "10.255.0.0/24".into(),
            network_id: "net".into(),
            subnet_id: "subnet".into(),
            security_ruleset_id: "nsg".into(),
        }
    }

    fn restore(status: RestoreStatus, mode: RestoreMode) -> RestoreResult {
        RestoreResult {
            source_vm_name: "vmA".into(),
            test_vm_name: "sb-vma".into(),
            status,
            mode,
            session_id: None,
            error: (status != RestoreStatus::Success).then(|| "VM was not observed running".into()),
            duration: Duration::from_secs(60),
        }
    }

    fn config() -> VerificationConfig {
        VerificationConfig {
            ports: Vec::new(),
            script_path: None,
            heartbeat_wait: Duration::from_secs(60),
            soft_check_policy: SoftCheckPolicy::AlwaysPass,
        }
    }

    async fn verify(cloud: &MemoryCloud, config: VerificationConfig, restore: RestoreResult) -> VerificationResult {
        VerificationPipeline::new(cloud, config)
            .verify(&restore, &point(), &env(), &CancelSignal::never())
            .await
    }

    #[test]
    fn test_script_shell_by_extension() {
        assert_eq!(script_shell(Path::new("check.PS1")), ScriptShell::PowerShell);
        assert_eq!(script_shell(Path::new("check.sh")), ScriptShell::Shell);
        assert_eq!(script_shell(Path::new("check")), ScriptShell::Shell);
    }

    #[test]
    fn test_port_probe_per_os() {
        let windows = port_probe(OsType::Windows, 443);
        assert_eq!(windows.shell, ScriptShell::PowerShell);
        assert!(windows.lines[0].contains("-LocalPort 443"));
        let linux = port_probe(OsType::Linux, 22);
        assert_eq!(linux.shell, ScriptShell::Shell);
        assert!(linux.lines[0].contains("sport = :22"));
    }

    #[test]
    fn test_soft_check_policy_defaults_to_always_pass() {
        assert_eq!(SoftCheckPolicy::default(), SoftCheckPolicy::AlwaysPass);
        let policy: SoftCheckPolicy = serde_json::from_str("\"strict\"").unwrap();
        assert_eq!(policy, SoftCheckPolicy::Strict);
    }

    #[tokio::test]
    async fn test_timed_out_restore_fails_without_checks() {
        let cloud = MemoryCloud::new();
        let result = verify(
            &cloud,
            config(),
            restore(RestoreStatus::Timeout, RestoreMode::BackupRestore),
        )
        .await;

        assert_eq!(result.overall_result, OverallResult::Fail);
        assert!(!result.boot_verified);
        assert!(result.details.iter().any(|d| d.contains("timed out")));
        assert_eq!(cloud.vm_status_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_wait_then_soft_pass() {
        let cloud = MemoryCloud::new();
        let not_ready = cloud.status(PowerState::Running, false);
        let cloud = cloud.script_vm("sb-vma", vec![not_ready]);

        let result = verify(
            &cloud,
            config(),
            restore(RestoreStatus::Success, RestoreMode::BackupRestore),
        )
        .await;

        assert!(result.boot_verified);
        assert!(result.heartbeat_verified);
        assert!(result.ports_verified);
        assert!(result.script_verified);
        assert_eq!(result.overall_result, OverallResult::Pass);
        assert!(result.details.iter().any(|d| d.contains("warning")));
        assert_eq!(cloud.vm_status_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_heartbeat_is_partial() {
        let cloud = MemoryCloud::new();
        let not_ready = cloud.status(PowerState::Running, false);
        let cloud = cloud.script_vm("sb-vma", vec![not_ready]);
        let mut config = config();
        config.soft_check_policy = SoftCheckPolicy::Strict;

        let result = verify(
            &cloud,
            config,
            restore(RestoreStatus::Success, RestoreMode::BackupRestore),
        )
        .await;

        assert!(!result.heartbeat_verified);
        assert_eq!(result.overall_result, OverallResult::Partial);
    }

    #[tokio::test]
    async fn test_vm_not_running_is_fail() {
        let cloud = MemoryCloud::new();
        let stopped = cloud.status(PowerState::Stopped, false);
        let cloud = cloud.script_vm("sb-vma", vec![stopped]);

        let result = verify(
            &cloud,
            config(),
            restore(RestoreStatus::Success, RestoreMode::BackupRestore),
        )
        .await;

        assert!(!result.boot_verified);
        assert_eq!(result.overall_result, OverallResult::Fail);
        assert!(cloud.commands().is_empty());
    }

    #[tokio::test]
    async fn test_any_listening_port_verifies() {
        let cloud = MemoryCloud::new().with_command_handler(|_, script| {
            let stdout = if script.lines.iter().any(|l| l.contains(":443")) {
                "OPEN"
            } else {
                "CLOSED"
            };
            Ok(CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
            })
        });
        let mut config = config();
        config.ports = vec![22, 443];
        config.soft_check_policy = SoftCheckPolicy::Strict;

        let result = verify(
            &cloud,
            config,
            restore(RestoreStatus::Success, RestoreMode::BackupRestore),
        )
        .await;

        assert!(result.ports_verified);
        assert_eq!(result.port_details.len(), 2);
        assert!(!result.port_details[0].listening);
        assert!(result.port_details[1].listening);
        assert_eq!(result.overall_result, OverallResult::Pass);
    }

    #[tokio::test]
    async fn test_probe_errors_are_recorded_per_port() {
        let cloud = MemoryCloud::new().with_command_handler(|_, _| {
            Err(CloudError::OperationFailed("agent unavailable".into()))
        });
        let mut config = config();
        config.ports = vec![3389];

        let result = verify(
            &cloud,
            config,
            restore(RestoreStatus::Success, RestoreMode::BackupRestore),
        )
        .await;

        // Soft check under the default policy.
        assert!(result.ports_verified);
        assert!(result.port_details[0]
            .error
            .as_deref()
            .unwrap()
            .contains("agent unavailable"));
    }

    #[tokio::test]
    async fn test_script_with_stderr_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("check.ps1");
        std::fs::write(&path, "Get-Service W3SVC\n").unwrap();

        let cloud = MemoryCloud::new()
            .with_os_type(OsType::Windows)
            .with_command_handler(|_, _| {
                Ok(CommandOutput {
                    stdout: "Stopped".into(),
                    stderr: "service not running".into(),
                })
            });
        let mut config = config();
        config.script_path = Some(path);

        let result = verify(
            &cloud,
            config,
            restore(RestoreStatus::Success, RestoreMode::BackupRestore),
        )
        .await;

        assert!(!result.script_verified);
        assert_eq!(result.script_output.as_deref(), Some("Stopped"));
        assert_eq!(result.overall_result, OverallResult::Partial);
        let commands = cloud.commands();
        assert_eq!(commands[0].1.shell, ScriptShell::PowerShell);
    }

    #[tokio::test]
    async fn test_missing_script_is_unverified() {
        let cloud = MemoryCloud::new();
        let mut config = config();
        config.script_path = Some(PathBuf::from("/nonexistent/surebackup/check.sh"));

        let result = verify(
            &cloud,
            config,
            restore(RestoreStatus::Success, RestoreMode::BackupRestore),
        )
        .await;

        assert!(!result.script_verified);
        assert_eq!(result.overall_result, OverallResult::Partial);
        assert!(cloud.commands().is_empty());
    }

    #[tokio::test]
    async fn test_standin_is_reported_degraded() {
        let cloud = MemoryCloud::new();
        let result = verify(
            &cloud,
            config(),
            restore(RestoreStatus::Success, RestoreMode::StandIn),
        )
        .await;

        assert!(result.degraded);
        assert_eq!(result.overall_result, OverallResult::Pass);
        assert!(result.details.iter().any(|d| d.contains("stand-in")));
    }
}
