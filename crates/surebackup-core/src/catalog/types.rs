//! Wire types for the backup catalog REST API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `{ "data": [...] }` envelope used by every list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DataPage<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub job_type: String,
    #[serde(default)]
    pub is_disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub platform_name: Option<String>,
}

/// A restore point as reported by the catalog; `name` is the VM name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRestorePoint {
    pub id: String,
    pub name: String,
    pub creation_time: DateTime<Utc>,
}

/// Parameters for a restore into the isolated test environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub restore_point_id: String,
    pub resource_group: String,
    pub vm_name: String,
    pub vm_size: String,
    pub region: String,
    pub network_id: String,
    pub subnet_id: String,
    pub power_on: bool,
}

impl RestoreRequest {
    /// Body for `POST /restoreSessions`.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "restorePointId": self.restore_point_id,
            "type": "RestoreToNewLocation",
            "destination": {
                "resourceGroup": self.resource_group,
                "vmName": self.vm_name,
                "vmSize": self.vm_size,
                "region": self.region,
                "virtualNetwork": self.network_id,
                "subnet": self.subnet_id,
            },
            "powerOnAfterRestore": self.power_on,
            "reason": "SureBackup recoverability test",
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Working,
    Stopping,
    Stopped,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionResult {
    None,
    Success,
    Warning,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSession {
    pub id: String,
    pub state: SessionState,
    #[serde(default)]
    pub result: Option<SessionResult>,
    #[serde(default)]
    pub message: Option<String>,
}

impl RestoreSession {
    /// Stopped, completed and failed sessions no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SessionState::Stopped | SessionState::Completed | SessionState::Failed
        )
    }

    pub fn is_failed(&self) -> bool {
        self.state == SessionState::Failed || self.result == Some(SessionResult::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_deserializes_unknown_state() {
        let session: RestoreSession =
            serde_json::from_str(r#"{"id":"s1","state":"Resuming"}"#).unwrap();
        assert_eq!(session.state, SessionState::Unknown);
        assert!(!session.is_terminal());
    }

    #[test]
    fn test_stopped_with_failed_result_is_failed() {
        let session: RestoreSession = serde_json::from_str(
            r#"{"id":"s1","state":"Stopped","result":"Failed","message":"disk copy error"}"#,
        )
        .unwrap();
        assert!(session.is_terminal());
        assert!(session.is_failed());
    }

    #[test]
    fn test_stopped_with_warning_is_not_failed() {
        let session: RestoreSession =
            serde_json::from_str(r#"{"id":"s1","state":"Stopped","result":"Warning"}"#).unwrap();
        assert!(session.is_terminal());
        assert!(!session.is_failed());
    }

    #[test]
    fn test_restore_request_body_powers_on() {
        let request = RestoreRequest {
            restore_point_id: "rp-1".into(),
            resource_group: "rg".into(),
            vm_name: "sb-vma".into(),
            vm_size: "Standard_B2s".into(),
            region: "eastus".into(),
            network_id: "vnet-id".into(),
            subnet_id: "subnet-id".into(),
            power_on: true,
        };
        let body = request.to_body();
        assert_eq!(body["restorePointId"], "rp-1");
        assert_eq!(body["powerOnAfterRestore"], true);
        assert_eq!(body["destination"]["subnet"], "subnet-id");
    }

    #[test]
    fn test_job_type_field_renamed() {
        let job: Job =
            serde_json::from_str(r#"{"id":"j1","name":"Azure Prod","type":"AzureBackup"}"#)
                .unwrap();
        assert_eq!(job.job_type, "AzureBackup");
        assert!(!job.is_disabled);
    }
}
