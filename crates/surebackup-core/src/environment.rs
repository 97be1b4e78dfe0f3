//! Isolated test environment: security rules and provisioning.
//!
//! The environment guarantees blast-radius isolation. Instances may talk to
//! each other and to the platform's management/agent range, and nothing
//! else. Rules are evaluated lowest priority value first, so every allow in
//! a direction must sit below every deny in that direction.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cloud::CloudProvider;
use crate::error::{Result, SureBackupError};
use crate::model::TestEnvironment;
use crate::obs;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny,
}

/// Address range a rule applies to, resolved by the provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AddressScope {
    Any,
    /// The isolated network's own CIDR.
    IsolatedNetwork,
    /// The platform's management / VM-agent service range.
    PlatformManagement,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityRule {
    pub name: String,
    /// Lower values are evaluated first.
    pub priority: u16,
    pub direction: Direction,
    pub access: Access,
    pub source: AddressScope,
    pub destination: AddressScope,
}

/// The four-rule deny-by-default set every test environment gets.
pub fn isolation_rules() -> Vec<SecurityRule> {
    vec![
        SecurityRule {
            name: "AllowIsolatedInbound".to_string(),
            priority: 100,
            direction: Direction::Inbound,
            access: Access::Allow,
            source: AddressScope::IsolatedNetwork,
            destination: AddressScope::IsolatedNetwork,
        },
        SecurityRule {
            name: "AllowPlatformManagementOutbound".to_string(),
            priority: 110,
            direction: Direction::Outbound,
            access: Access::Allow,
            source: AddressScope::IsolatedNetwork,
            destination: AddressScope::PlatformManagement,
        },
        SecurityRule {
            name: "DenyAllInbound".to_string(),
            priority: 4000,
            direction: Direction::Inbound,
            access: Access::Deny,
            source: AddressScope::Any,
            destination: AddressScope::Any,
        },
        SecurityRule {
            name: "DenyAllOutbound".to_string(),
            priority: 4010,
            direction: Direction::Outbound,
            access: Access::Deny,
            source: AddressScope::Any,
            destination: AddressScope::Any,
        },
    ]
}

/// Check that allows precede denies within each direction.
pub fn validate_rule_order(rules: &[SecurityRule]) -> Result<()> {
    for direction in [Direction::Inbound, Direction::Outbound] {
        let in_direction = rules.iter().filter(|r| r.direction == direction);
        let highest_allow = in_direction
            .clone()
            .filter(|r| r.access == Access::Allow)
            .max_by_key(|r| r.priority);
        let lowest_deny = in_direction
            .filter(|r| r.access == Access::Deny)
            .min_by_key(|r| r.priority);

        if let (Some(allow), Some(deny)) = (highest_allow, lowest_deny) {
            if allow.priority >= deny.priority {
                return Err(SureBackupError::Provisioning(format!(
                    "allow rule {} (priority {}) is shadowed by deny rule {} (priority {})",
                    allow.name, allow.priority, deny.name, deny.priority
                )));
            }
        }
    }
    Ok(())
}

/// Unique, sortable resource group name for one run.
pub fn environment_name() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("surebackup-test-{}-{}", stamp, &suffix[..8])
}

/// Creates the isolated network boundary shared by a run's test restores.
pub struct EnvironmentProvisioner<'a> {
    cloud: &'a dyn CloudProvider,
}

impl<'a> EnvironmentProvisioner<'a> {
    pub fn new(cloud: &'a dyn CloudProvider) -> Self {
        Self { cloud }
    }

    /// Provision a fresh environment. Any failure is fatal to the run; if the
    /// resource group was already created it is deleted best-effort first.
    pub async fn provision(&self, region: &str, cidr: &str) -> Result<TestEnvironment> {
        let rules = isolation_rules();
        validate_rule_order(&rules)?;

        let resource_group = environment_name();
        info!(resource_group = %resource_group, region = %region, cidr = %cidr, "provisioning isolated test environment");

        self.cloud
            .create_resource_group(&resource_group, region)
            .await
            .map_err(|e| {
                SureBackupError::Provisioning(format!("resource group {resource_group}: {e}"))
            })?;

        match self.build_network(&resource_group, region, cidr, &rules).await {
            Ok(env) => {
                obs::emit_environment_provisioned(&env);
                Ok(env)
            }
            Err(err) => {
                if let Err(cleanup_err) = self.cloud.delete_resource_group(&resource_group).await {
                    warn!(
                        resource_group = %resource_group,
                        error = %cleanup_err,
                        manual_command = %self.cloud.manual_teardown_hint(&resource_group),
                        "failed to remove partially provisioned environment",
                    );
                }
                Err(err)
            }
        }
    }

    async fn build_network(
        &self,
        resource_group: &str,
        region: &str,
        cidr: &str,
        rules: &[SecurityRule],
    ) -> Result<TestEnvironment> {
        let nsg_name = format!("{resource_group}-nsg");
        let security_ruleset_id = self
            .cloud
            .create_security_group(resource_group, &nsg_name, region, cidr, rules)
            .await
            .map_err(|e| SureBackupError::Provisioning(format!("security rules: {e}")))?;

        let vnet_name = format!("{resource_group}-vnet");
        let ids = self
            .cloud
            .create_network(resource_group, &vnet_name, region, cidr, &security_ruleset_id)
            .await
            .map_err(|e| SureBackupError::Provisioning(format!("virtual network: {e}")))?;

        Ok(TestEnvironment {
            resource_group_name: resource_group.to_string(),
            region: region.to_string(),
            network_cidr: cidr.to_string(),
            network_id: ids.network_id,
            subnet_id: ids.subnet_id,
            security_ruleset_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_rules_are_well_ordered() {
        let rules = isolation_rules();
        assert_eq!(rules.len(), 4);
        assert!(validate_rule_order(&rules).is_ok());
    }

    #[test]
    fn test_catch_all_denies_cover_both_directions() {
        let rules = isolation_rules();
        for direction in [Direction::Inbound, Direction::Outbound] {
            assert!(rules.iter().any(|r| r.direction == direction
                && r.access == Access::Deny
                && r.source == AddressScope::Any
                && r.destination == AddressScope::Any));
        }
    }

    #[test]
    fn test_outbound_allow_targets_platform_only() {
        let rules = isolation_rules();
        let outbound_allows: Vec<_> = rules
            .iter()
            .filter(|r| r.direction == Direction::Outbound && r.access == Access::Allow)
            .collect();
        assert_eq!(outbound_allows.len(), 1);
        assert_eq!(
            outbound_allows[0].destination,
            AddressScope::PlatformManagement
        );
    }

    #[test]
    fn test_shadowed_allow_is_rejected() {
        let mut rules = isolation_rules();
        rules[0].priority = 4500;
        let err = validate_rule_order(&rules).unwrap_err();
        assert!(err.to_string().contains("AllowIsolatedInbound"));
    }

    #[test]
    fn test_environment_names_are_unique() {
        let a = environment_name();
        let b = environment_name();
        assert!(a.starts_with("surebackup-test-"));
        assert_ne!(a, b);
    }
}
