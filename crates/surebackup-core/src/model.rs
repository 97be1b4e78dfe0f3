//! Data model for a SureBackup run.
//!
//! Lifecycle: a [`RestorePoint`] is consumed once by the orchestrator, which
//! produces one [`RestoreResult`]; that is consumed once by the verification
//! pipeline, which produces one [`VerificationResult`]. Nothing is mutated
//! after construction.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point-in-time backup of a single VM, selected for test restore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestorePoint {
    pub backup_name: String,
    pub backup_id: String,
    pub restore_point_id: String,
    pub vm_name: String,
    pub creation_time: DateTime<Utc>,
    pub job_name: Option<String>,
}

/// Isolated network sandbox shared by every test restore in one run.
///
/// Created once by the provisioner and read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestEnvironment {
    pub resource_group_name: String,
    pub region: String,
    pub network_cidr: String,
    pub network_id: String,
    pub subnet_id: String,
    pub security_ruleset_id: String,
}

/// Terminal status of one restore attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    Success,
    Failed,
    /// The VM was not observed running before the boot deadline.
    Timeout,
    /// Aborted by the run's cancellation signal.
    Cancelled,
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestoreStatus::Success => "success",
            RestoreStatus::Failed => "failed",
            RestoreStatus::Timeout => "timeout",
            RestoreStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// How the test VM came to exist.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Restored from the backup catalog.
    BackupRestore,
    /// The catalog restore could not be submitted and a blank stand-in VM was
    /// deployed instead. This validates the test environment only, not the
    /// backup data.
    StandIn,
}

/// Outcome of driving one restore point through the restore state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoreResult {
    pub source_vm_name: String,
    pub test_vm_name: String,
    pub status: RestoreStatus,
    pub mode: RestoreMode,
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl RestoreResult {
    pub fn is_success(&self) -> bool {
        self.status == RestoreStatus::Success
    }

    /// True when the VM is a stand-in rather than restored backup data.
    pub fn is_degraded(&self) -> bool {
        self.mode == RestoreMode::StandIn
    }
}

/// Composite verdict for one VM.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallResult {
    Pass,
    Partial,
    Fail,
}

impl OverallResult {
    /// Roll up individual check outcomes.
    ///
    /// Boot is the only hard gate: without it the verdict is `Fail` no matter
    /// what the other checks say.
    pub fn from_checks(boot: bool, heartbeat: bool, ports: bool, script: bool) -> Self {
        if !boot {
            OverallResult::Fail
        } else if heartbeat && ports && script {
            OverallResult::Pass
        } else {
            OverallResult::Partial
        }
    }
}

impl fmt::Display for OverallResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverallResult::Pass => "PASS",
            OverallResult::Partial => "PARTIAL",
            OverallResult::Fail => "FAIL",
        };
        f.write_str(s)
    }
}

/// Listener probe outcome for one TCP port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortDetail {
    pub port: u16,
    pub listening: bool,
    /// Set when the probe itself could not run.
    pub error: Option<String>,
}

/// Verification verdict for one VM; the unit handed to report exporters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationResult {
    pub source_vm_name: String,
    pub test_vm_name: String,
    pub restore_status: RestoreStatus,
    pub degraded: bool,
    pub boot_verified: bool,
    pub heartbeat_verified: bool,
    pub ports_verified: bool,
    pub port_details: Vec<PortDetail>,
    pub script_verified: bool,
    pub script_output: Option<String>,
    pub overall_result: OverallResult,
    pub details: Vec<String>,
}
