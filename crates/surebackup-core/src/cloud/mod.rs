//! Cloud provisioning seam.
//!
//! The orchestrator, provisioner, verification pipeline and cleanup manager
//! only see [`CloudProvider`]. [`azure::AzureCloud`] drives Azure Resource
//! Manager; `crate::fakes::MemoryCloud` is the scripted test double.

pub mod azure;
pub mod error;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::environment::SecurityRule;
use crate::model::TestEnvironment;

pub use azure::AzureCloud;
pub use error::CloudError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Deallocated,
    Unknown,
}

impl PowerState {
    /// Parse the suffix of an Azure `PowerState/<state>` status code.
    pub fn from_code(code: &str) -> Self {
        match code.to_ascii_lowercase().as_str() {
            "starting" => PowerState::Starting,
            "running" => PowerState::Running,
            "stopping" => PowerState::Stopping,
            "stopped" => PowerState::Stopped,
            "deallocated" | "deallocating" => PowerState::Deallocated,
            _ => PowerState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OsType {
    Windows,
    Linux,
}

/// Power, provisioning and guest-agent state of a VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmStatus {
    pub power_state: PowerState,
    pub provisioning_state: String,
    pub agent_ready: bool,
    pub os_type: OsType,
}

impl VmStatus {
    pub fn is_running(&self) -> bool {
        self.power_state == PowerState::Running
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScriptShell {
    PowerShell,
    Shell,
}

impl ScriptShell {
    pub fn for_os(os: OsType) -> Self {
        match os {
            OsType::Windows => ScriptShell::PowerShell,
            OsType::Linux => ScriptShell::Shell,
        }
    }
}

/// A script executed inside a VM through the platform agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteScript {
    pub shell: ScriptShell,
    pub lines: Vec<String>,
}

impl RemoteScript {
    pub fn new(shell: ScriptShell, source: &str) -> Self {
        Self {
            shell,
            lines: source.lines().map(str::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Identifiers of a freshly created isolated network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkIds {
    pub network_id: String,
    pub subnet_id: String,
}

/// Management-plane operations the engine needs from a cloud platform.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Returns the resource group id.
    async fn create_resource_group(&self, name: &str, region: &str) -> Result<String, CloudError>;

    /// Create a security ruleset; `cidr` resolves `AddressScope::IsolatedNetwork`.
    async fn create_security_group(
        &self,
        resource_group: &str,
        name: &str,
        region: &str,
        cidr: &str,
        rules: &[SecurityRule],
    ) -> Result<String, CloudError>;

    async fn create_network(
        &self,
        resource_group: &str,
        name: &str,
        region: &str,
        cidr: &str,
        security_group_id: &str,
    ) -> Result<NetworkIds, CloudError>;

    /// Deploy a blank VM into the environment; used when a catalog restore
    /// cannot be submitted.
    async fn deploy_standin_vm(
        &self,
        env: &TestEnvironment,
        vm_name: &str,
        vm_size: &str,
    ) -> Result<(), CloudError>;

    async fn vm_status(&self, resource_group: &str, vm_name: &str) -> Result<VmStatus, CloudError>;

    async fn run_command(
        &self,
        resource_group: &str,
        vm_name: &str,
        script: &RemoteScript,
    ) -> Result<CommandOutput, CloudError>;

    async fn delete_resource_group(&self, name: &str) -> Result<(), CloudError>;

    /// Command an operator can run to remove the resource group by hand.
    fn manual_teardown_hint(&self, resource_group: &str) -> String;
}
