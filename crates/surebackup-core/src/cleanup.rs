//! Test environment teardown.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cloud::CloudProvider;
use crate::error::{Result, SureBackupError};
use crate::model::TestEnvironment;
use crate::obs;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CleanupOutcome {
    /// Left in place at the operator's request.
    Retained,
    Deleted,
}

/// Delete the environment's resource group, or leave it in place when
/// `retain` is set. Failures carry the manual teardown command.
pub async fn cleanup(
    cloud: &dyn CloudProvider,
    env: &TestEnvironment,
    retain: bool,
) -> Result<CleanupOutcome> {
    delete_resource_group(cloud, &env.resource_group_name, retain).await
}

/// [`cleanup`] by resource group name, for environments retained by an
/// earlier run.
pub async fn delete_resource_group(
    cloud: &dyn CloudProvider,
    resource_group: &str,
    retain: bool,
) -> Result<CleanupOutcome> {
    let manual_command = cloud.manual_teardown_hint(resource_group);
    if retain {
        obs::emit_cleanup_retained(resource_group, &manual_command);
        return Ok(CleanupOutcome::Retained);
    }

    match cloud.delete_resource_group(resource_group).await {
        Ok(()) => {
            info!(resource_group = %resource_group, "test environment deleted");
            Ok(CleanupOutcome::Deleted)
        }
        Err(err) => {
            obs::emit_cleanup_failed(resource_group, &err, &manual_command);
            Err(SureBackupError::Cleanup {
                resource_group: resource_group.to_string(),
                reason: err.to_string(),
                manual_command,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryCloud;

    fn env() -> TestEnvironment {
        TestEnvironment {
            resource_group_name: "surebackup-test-1".into(),
            region: "eastus".into(),
            network_cidr: "10.255.0.0/24".into(),
            network_id: "net".into(),
            subnet_id: "subnet".into(),
            security_ruleset_id: "nsg".into(),
        }
    }

    #[tokio::test]
    async fn test_retain_skips_deletion() {
        let cloud = MemoryCloud::new();
        let outcome = cleanup(&cloud, &env(), true).await.unwrap();
        assert_eq!(outcome, CleanupOutcome::Retained);
        assert!(cloud.deleted_groups().is_empty());
    }

    #[tokio::test]
    async fn test_delete_environment() {
        let cloud = MemoryCloud::new();
        let outcome = cleanup(&cloud, &env(), false).await.unwrap();
        assert_eq!(outcome, CleanupOutcome::Deleted);
        assert_eq!(cloud.deleted_groups(), vec!["surebackup-test-1"]);
    }

    #[tokio::test]
    async fn test_failure_carries_manual_command() {
        let cloud = MemoryCloud::new().fail_operation("delete_resource_group");
        let err = cleanup(&cloud, &env(), false).await.unwrap_err();
        match err {
            SureBackupError::Cleanup {
                resource_group,
                manual_command,
                ..
            } => {
                assert_eq!(resource_group, "surebackup-test-1");
                assert!(manual_command.contains("surebackup-test-1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
