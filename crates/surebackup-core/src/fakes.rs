//! In-memory fakes for the collaborator traits (testing only)
//!
//! Provides `MemoryCatalog` and `MemoryCloud`, scripted implementations of
//! [`BackupCatalog`] and [`CloudProvider`] that record every call.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::catalog::{
    Backup, BackupCatalog, CatalogError, CatalogRestorePoint, Job, RestoreRequest, RestoreSession,
    SessionResult, SessionState,
};
use crate::cloud::{
    CloudError, CloudProvider, CommandOutput, NetworkIds, OsType, PowerState, RemoteScript,
    VmStatus,
};
use crate::environment::SecurityRule;
use crate::model::TestEnvironment;

// ---------------------------------------------------------------------------
// MemoryCatalog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CatalogState {
    jobs: Vec<Job>,
    backups: Vec<Backup>,
    restore_points: HashMap<String, Vec<CatalogRestorePoint>>,
    fail_auth: bool,
    rejected_restores: HashSet<String>,
    /// Per restore point: session snapshots returned in order; the last repeats.
    session_scripts: HashMap<String, Vec<(SessionState, Option<SessionResult>)>>,
    /// session id -> (restore point id, polls served)
    sessions: HashMap<String, (String, usize)>,
    restore_requests: Vec<RestoreRequest>,
    auth_calls: usize,
    /// Session polls that fail with a 503 before the script is served.
    failing_session_polls: usize,
    /// Latency added to every session poll.
    session_poll_delay: Option<Duration>,
    session_polls: usize,
}

/// Scripted backup catalog. Restores complete immediately unless scripted.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(self, job: Job) -> Self {
        self.state.lock().unwrap().jobs.push(job);
        self
    }

    pub fn with_backup(self, backup: Backup, points: Vec<CatalogRestorePoint>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.restore_points.insert(backup.id.clone(), points);
            state.backups.push(backup);
        }
        self
    }

    pub fn fail_authentication(self) -> Self {
        self.state.lock().unwrap().fail_auth = true;
        self
    }

    /// Make `start_restore` fail for this restore point.
    pub fn reject_restore(self, restore_point_id: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .rejected_restores
            .insert(restore_point_id.to_string());
        self
    }

    pub fn script_session(
        self,
        restore_point_id: &str,
        snapshots: Vec<(SessionState, Option<SessionResult>)>,
    ) -> Self {
        self.state
            .lock()
            .unwrap()
            .session_scripts
            .insert(restore_point_id.to_string(), snapshots);
        self
    }

    /// Fail the next `count` session polls with a transient error.
    pub fn fail_session_polls(self, count: usize) -> Self {
        self.state.lock().unwrap().failing_session_polls = count;
        self
    }

    /// Make every session poll take `delay`, as a catalog backing off would.
    pub fn delay_session_polls(self, delay: Duration) -> Self {
        self.state.lock().unwrap().session_poll_delay = Some(delay);
        self
    }

    pub fn session_polls(&self) -> usize {
        self.state.lock().unwrap().session_polls
    }

    pub fn restore_requests(&self) -> Vec<RestoreRequest> {
        self.state.lock().unwrap().restore_requests.clone()
    }

    pub fn auth_calls(&self) -> usize {
        self.state.lock().unwrap().auth_calls
    }
}

#[async_trait]
impl BackupCatalog for MemoryCatalog {
    async fn authenticate(&self) -> Result<(), CatalogError> {
        let mut state = self.state.lock().unwrap();
        state.auth_calls += 1;
        if state.fail_auth {
            return Err(CatalogError::Auth("invalid credentials".into()));
        }
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, CatalogError> {
        Ok(self.state.lock().unwrap().jobs.clone())
    }

    async fn list_backups(&self) -> Result<Vec<Backup>, CatalogError> {
        Ok(self.state.lock().unwrap().backups.clone())
    }

    async fn list_restore_points(
        &self,
        backup_id: &str,
    ) -> Result<Vec<CatalogRestorePoint>, CatalogError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .restore_points
            .get(backup_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn start_restore(&self, request: &RestoreRequest) -> Result<String, CatalogError> {
        let mut state = self.state.lock().unwrap();
        state.restore_requests.push(request.clone());
        if state.rejected_restores.contains(&request.restore_point_id) {
            return Err(CatalogError::Api {
                status: StatusCode::BAD_REQUEST.as_u16(),
                body: "restore point is not restorable to this target".into(),
            });
        }
        let session_id = format!("session-{}", state.sessions.len() + 1);
        state
            .sessions
            .insert(session_id.clone(), (request.restore_point_id.clone(), 0));
        Ok(session_id)
    }

    async fn get_restore_session(&self, session_id: &str) -> Result<RestoreSession, CatalogError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.session_polls += 1;
            state.session_poll_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut guard = self.state.lock().unwrap();
        if guard.failing_session_polls > 0 {
            guard.failing_session_polls -= 1;
            return Err(CatalogError::Transient {
                status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                body: "catalog busy".into(),
                retry_after: None,
            });
        }
        let state = &mut *guard;
        let (restore_point_id, polls) = state.sessions.get_mut(session_id).ok_or_else(|| {
            CatalogError::Api {
                status: StatusCode::NOT_FOUND.as_u16(),
                body: format!("session {session_id} not found"),
            }
        })?;
        let snapshot = match state.session_scripts.get(restore_point_id.as_str()) {
            Some(script) if !script.is_empty() => script[(*polls).min(script.len() - 1)],
            _ => (SessionState::Completed, Some(SessionResult::Success)),
        };
        *polls += 1;
        Ok(RestoreSession {
            id: session_id.to_string(),
            state: snapshot.0,
            result: snapshot.1,
            message: (snapshot.1 == Some(SessionResult::Failed))
                .then(|| "restore session failed".to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryCloud
// ---------------------------------------------------------------------------

type CommandHandler =
    Box<dyn Fn(&str, &RemoteScript) -> Result<CommandOutput, CloudError> + Send + Sync>;

#[derive(Default)]
struct CloudState {
    resource_groups: Vec<String>,
    deleted_groups: Vec<String>,
    security_rules: Vec<SecurityRule>,
    standin_vms: Vec<String>,
    /// Per VM: statuses returned in order; the last repeats.
    vm_scripts: HashMap<String, VecDeque<VmStatus>>,
    vm_status_calls: usize,
    commands: Vec<(String, RemoteScript)>,
    failing: HashSet<String>,
    failing_vm_status: usize,
}

/// Scripted cloud provider. VMs report running with a ready agent unless
/// scripted otherwise; commands produce empty output unless a handler is set.
#[derive(Default)]
pub struct MemoryCloud {
    state: Mutex<CloudState>,
    os_type: Option<OsType>,
    command_handler: Option<CommandHandler>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named trait operation (e.g. `"create_network"`) fail.
    pub fn fail_operation(self, operation: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(operation.to_string());
        self
    }

    /// Fail the next `count` `vm_status` calls with a transient error.
    pub fn fail_vm_status(self, count: usize) -> Self {
        self.state.lock().unwrap().failing_vm_status = count;
        self
    }

    pub fn with_os_type(mut self, os_type: OsType) -> Self {
        self.os_type = Some(os_type);
        self
    }

    pub fn script_vm(self, vm_name: &str, statuses: Vec<VmStatus>) -> Self {
        self.state
            .lock()
            .unwrap()
            .vm_scripts
            .insert(vm_name.to_string(), statuses.into());
        self
    }

    pub fn with_command_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &RemoteScript) -> Result<CommandOutput, CloudError> + Send + Sync + 'static,
    {
        self.command_handler = Some(Box::new(handler));
        self
    }

    /// A status with the given power state and agent readiness.
    pub fn status(&self, power_state: PowerState, agent_ready: bool) -> VmStatus {
        VmStatus {
            power_state,
            provisioning_state: "Succeeded".to_string(),
            agent_ready,
            os_type: self.os_type.unwrap_or(OsType::Linux),
        }
    }

    pub fn resource_groups(&self) -> Vec<String> {
        self.state.lock().unwrap().resource_groups.clone()
    }

    pub fn deleted_groups(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_groups.clone()
    }

    pub fn security_rules(&self) -> Vec<SecurityRule> {
        self.state.lock().unwrap().security_rules.clone()
    }

    pub fn standin_vms(&self) -> Vec<String> {
        self.state.lock().unwrap().standin_vms.clone()
    }

    pub fn commands(&self) -> Vec<(String, RemoteScript)> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn vm_status_calls(&self) -> usize {
        self.state.lock().unwrap().vm_status_calls
    }

    fn check(&self, operation: &str) -> Result<(), CloudError> {
        if self.state.lock().unwrap().failing.contains(operation) {
            return Err(CloudError::Api {
                status: 500,
                message: format!("{operation} failed"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for MemoryCloud {
    async fn create_resource_group(&self, name: &str, _region: &str) -> Result<String, CloudError> {
        self.check("create_resource_group")?;
        self.state
            .lock()
            .unwrap()
            .resource_groups
            .push(name.to_string());
        Ok(format!("/resourceGroups/{name}"))
    }

    async fn create_security_group(
        &self,
        resource_group: &str,
        name: &str,
        _region: &str,
        _cidr: &str,
        rules: &[SecurityRule],
    ) -> Result<String, CloudError> {
        self.check("create_security_group")?;
        self.state
            .lock()
            .unwrap()
            .security_rules
            .extend_from_slice(rules);
        Ok(format!("/resourceGroups/{resource_group}/securityGroups/{name}"))
    }

    async fn create_network(
        &self,
        resource_group: &str,
        name: &str,
        _region: &str,
        _cidr: &str,
        _security_group_id: &str,
    ) -> Result<NetworkIds, CloudError> {
        self.check("create_network")?;
        let network_id = format!("/resourceGroups/{resource_group}/networks/{name}");
        Ok(NetworkIds {
            subnet_id: format!("{network_id}/subnets/default"),
            network_id,
        })
    }

    async fn deploy_standin_vm(
        &self,
        _env: &TestEnvironment,
        vm_name: &str,
        _vm_size: &str,
    ) -> Result<(), CloudError> {
        self.check("deploy_standin_vm")?;
        self.state
            .lock()
            .unwrap()
            .standin_vms
            .push(vm_name.to_string());
        Ok(())
    }

    async fn vm_status(&self, _resource_group: &str, vm_name: &str) -> Result<VmStatus, CloudError> {
        self.check("vm_status")?;
        let mut state = self.state.lock().unwrap();
        state.vm_status_calls += 1;
        if state.failing_vm_status > 0 {
            state.failing_vm_status -= 1;
            return Err(CloudError::Api {
                status: 503,
                message: "instance view unavailable".into(),
            });
        }
        if let Some(script) = state.vm_scripts.get_mut(vm_name) {
            if script.len() > 1 {
                if let Some(status) = script.pop_front() {
                    return Ok(status);
                }
            }
            if let Some(status) = script.front() {
                return Ok(status.clone());
            }
        }
        Ok(self.status(PowerState::Running, true))
    }

    async fn run_command(
        &self,
        _resource_group: &str,
        vm_name: &str,
        script: &RemoteScript,
    ) -> Result<CommandOutput, CloudError> {
        self.check("run_command")?;
        self.state
            .lock()
            .unwrap()
            .commands
            .push((vm_name.to_string(), script.clone()));
        match &self.command_handler {
            Some(handler) => handler(vm_name, script),
            None => Ok(CommandOutput::default()),
        }
    }

    async fn delete_resource_group(&self, name: &str) -> Result<(), CloudError> {
        self.check("delete_resource_group")?;
        let mut state = self.state.lock().unwrap();
        state.resource_groups.retain(|rg| rg != name);
        state.deleted_groups.push(name.to_string());
        Ok(())
    }

    fn manual_teardown_hint(&self, resource_group: &str) -> String {
        format!("delete resource group {resource_group}")
    }
}
