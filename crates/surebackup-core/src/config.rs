//! Run configuration.
//!
//! Loaded from a TOML file; secrets can be supplied through environment
//! variables instead of being written to disk.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::retry::MAX_BACKOFF;
use crate::catalog::RetryPolicy;
use crate::error::{Result, SureBackupError};
use crate::selector::SelectionCriteria;
use crate::verification::SoftCheckPolicy;

/// Environment variable holding the catalog password.
pub const CATALOG_PASSWORD_ENV: &str = "SUREBACKUP_CATALOG_PASSWORD";
/// Environment variable holding the cloud service-principal secret.
pub const CLOUD_CLIENT_SECRET_ENV: &str = "SUREBACKUP_CLOUD_CLIENT_SECRET";

/// Narrowest Azure service tag covering VM guest management endpoints.
pub const DEFAULT_PLATFORM_SERVICE_TAG: &str = "GuestAndHybridManagement";

/// Connection settings for the backup catalog service.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CatalogConfig {
    /// Base URL, e.g. `https://vbr.example.internal:9419`.
    pub server: String,
    pub username: String,
    pub password: String,
    /// Value sent in the `x-api-version` header.
    pub api_version: String,
    /// Backup servers commonly present self-signed certificates.
    pub accept_invalid_certs: bool,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    /// At most 30; longer backoffs are rejected by `validate`.
    pub max_backoff_secs: u64,
    /// Ceiling applied to a server's `Retry-After`.
    pub max_retry_after_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            username: String::new(),
            password: String::new(),
            api_version: "1.1-rev2".to_string(),
            accept_invalid_certs: true,
            max_retries: 3,
            backoff_base_ms: 1_000,
            max_backoff_secs: 30,
            max_retry_after_secs: 120,
            request_timeout_secs: 60,
        }
    }
}

impl fmt::Debug for CatalogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogConfig")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("api_version", &self.api_version)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl CatalogConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_secs(self.max_backoff_secs).min(MAX_BACKOFF),
            max_retry_after: Duration::from_secs(self.max_retry_after_secs),
        }
    }
}

/// Credentials and endpoints for the cloud management plane.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CloudConfig {
    pub subscription_id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub management_url: String,
    pub login_url: String,
    /// Service tag the isolated network may reach outbound.
    pub platform_service_tag: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            subscription_id: String::new(),
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            management_url: "https://management.azure.com".to_string(),
            login_url: "https://login.microsoftonline.com".to_string(),
            platform_service_tag: DEFAULT_PLATFORM_SERVICE_TAG.to_string(),
        }
    }
}

impl fmt::Debug for CloudConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudConfig")
            .field("subscription_id", &self.subscription_id)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("management_url", &self.management_url)
            .field("platform_service_tag", &self.platform_service_tag)
            .finish()
    }
}

/// Complete option surface for one SureBackup run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SureBackupConfig {
    pub catalog: CatalogConfig,
    pub cloud: CloudConfig,
    pub test_region: String,
    pub test_vm_size: String,
    pub test_network_cidr: String,
    /// Explicit job-name allow-list; empty means every cloud-tier job.
    pub backup_job_filter: Vec<String>,
    pub max_restore_point_age_days: u32,
    pub max_vms_to_test: usize,
    pub verification_ports: Vec<u16>,
    pub verification_script_path: Option<PathBuf>,
    pub boot_timeout_minutes: u64,
    pub poll_interval_secs: u64,
    pub heartbeat_wait_secs: u64,
    pub retain_test_environment: bool,
    pub soft_check_policy: SoftCheckPolicy,
    /// 1 processes restore points strictly one at a time.
    pub max_parallel_restores: usize,
}

impl Default for SureBackupConfig {
    fn default() -> Self {
        Self {
            catalog: CatalogConfig::default(),
            cloud: CloudConfig::default(),
            test_region: "eastus".to_string(),
            test_vm_size: "Standard_B2s".to_string(),
            test_network_cidr: "10.255.0.0/24".to_string(),
            backup_job_filter: Vec::new(),
            max_restore_point_age_days: 7,
            max_vms_to_test: 3,
            verification_ports: Vec::new(),
            verification_script_path: None,
            boot_timeout_minutes: 30,
            poll_interval_secs: 30,
            heartbeat_wait_secs: 60,
            retain_test_environment: false,
            soft_check_policy: SoftCheckPolicy::default(),
            max_parallel_restores: 1,
        }
    }
}

impl SureBackupConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SureBackupError::Config(e.to_string()))
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SureBackupError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Fill secrets from the environment when the file leaves them empty.
    pub fn with_env_secrets(mut self) -> Self {
        if self.catalog.password.is_empty() {
            if let Ok(password) = std::env::var(CATALOG_PASSWORD_ENV) {
                self.catalog.password = password;
            }
        }
        if self.cloud.client_secret.is_empty() {
            if let Ok(secret) = std::env::var(CLOUD_CLIENT_SECRET_ENV) {
                self.cloud.client_secret = secret;
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.catalog.server.trim().is_empty() {
            return Err(SureBackupError::Config("catalog.server must be set".into()));
        }
        if self.max_vms_to_test == 0 {
            return Err(SureBackupError::Config(
                "max_vms_to_test must be at least 1".into(),
            ));
        }
        if self.boot_timeout_minutes == 0 {
            return Err(SureBackupError::Config(
                "boot_timeout_minutes must be at least 1".into(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(SureBackupError::Config(
                "poll_interval_secs must be at least 1".into(),
            ));
        }
        if self.heartbeat_wait_secs == 0 {
            return Err(SureBackupError::Config(
                "heartbeat_wait_secs must be at least 1".into(),
            ));
        }
        if Duration::from_secs(self.catalog.max_backoff_secs) > MAX_BACKOFF {
            return Err(SureBackupError::Config(format!(
                "catalog.max_backoff_secs must be at most {}",
                MAX_BACKOFF.as_secs()
            )));
        }
        if self.max_parallel_restores == 0 {
            return Err(SureBackupError::Config(
                "max_parallel_restores must be at least 1".into(),
            ));
        }
        if self.cloud.platform_service_tag.trim().is_empty()
            || self.cloud.platform_service_tag.contains('*')
        {
            return Err(SureBackupError::Config(
                "cloud.platform_service_tag must name a service tag".into(),
            ));
        }
        if parse_ipv4_cidr(&self.test_network_cidr).is_none() {
            return Err(SureBackupError::Config(format!(
                "test_network_cidr is not a valid IPv4 CIDR: {}",
                self.test_network_cidr
            )));
        }
        if self.verification_ports.contains(&0) {
            return Err(SureBackupError::Config(
                "verification_ports must be in 1..=65535".into(),
            ));
        }
        Ok(())
    }

    pub fn selection_criteria(&self) -> SelectionCriteria {
        SelectionCriteria {
            max_age_days: self.max_restore_point_age_days,
            job_name_filter: self.backup_job_filter.clone(),
            max_count: self.max_vms_to_test,
        }
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_minutes * 60)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_wait(&self) -> Duration {
        Duration::from_secs(self.heartbeat_wait_secs)
    }
}

/// Parse `a.b.c.d/n`, returning the address and prefix length.
pub fn parse_ipv4_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr.trim().split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    (prefix <= 32).then_some((addr, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SureBackupConfig {
        let mut config = SureBackupConfig::default();
        config.catalog.server = "https://vbr.local:9419".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = SureBackupConfig::default();
        assert_eq!(config.max_restore_point_age_days, 7);
        assert_eq!(config.max_vms_to_test, 3);
        assert_eq!(config.boot_timeout_minutes, 30);
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.heartbeat_wait(), Duration::from_secs(60));
        assert_eq!(config.catalog.max_retries, 3);
        assert!(config.catalog.accept_invalid_certs);
        assert_eq!(config.max_parallel_restores, 1);
    }

    #[test]
    fn test_parse_toml() {
        let config = SureBackupConfig::from_toml_str(
            r#"
            test_region = "westeurope"
            max_vms_to_test = 5
            verification_ports = [22, 443]
            backup_job_filter = ["Prod VMs"]
            soft_check_policy = "strict"

            [catalog]
            server = "https://vbr.local:9419"
            username = "svc-surebackup"
            "#,
        )
        .unwrap();
        assert_eq!(config.test_region, "westeurope");
        assert_eq!(config.max_vms_to_test, 5);
        assert_eq!(config.verification_ports, vec![22, 443]);
        assert_eq!(config.soft_check_policy, SoftCheckPolicy::Strict);
        assert_eq!(config.catalog.username, "svc-surebackup");
        // Unspecified fields keep their defaults.
        assert_eq!(config.catalog.max_retries, 3);
        assert_eq!(config.boot_timeout_minutes, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = SureBackupConfig::from_toml_str("max_vms_to_test = \"many\"").unwrap_err();
        assert!(matches!(err, SureBackupError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = valid();
        config.max_vms_to_test = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.test_network_cidr = "10.0.0.0/33".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.verification_ports = vec![0];
        assert!(config.validate().is_err());

        let mut config = valid();
        config.catalog.server = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.max_parallel_restores = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.heartbeat_wait_secs = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.catalog.max_backoff_secs = 600;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.cloud.platform_service_tag = "*".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_policy_keeps_backoff_cap() {
        let mut config = valid();
        config.catalog.max_backoff_secs = 600;
        let policy = config.catalog.retry_policy();
        assert_eq!(policy.delay_for(6, None), Duration::from_secs(30));
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(3600))),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = valid();
        config.catalog.password = "hunter2".to_string();
        config.cloud.client_secret = "s3cret".to_string();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_parse_ipv4_cidr() {
        assert_eq!(
            parse_ipv4_cidr("10.255.0.0/24"),
            Some((Ipv4Addr::new(10, 255, 0, 0), 24))
        );
        assert!(parse_ipv4_cidr("10.255.0.0").is_none());
        assert!(parse_ipv4_cidr("not-an-ip/24").is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("surebackup.toml");
        std::fs::write(&path, "[catalog]\nserver = \"https://vbr:9419\"\n").unwrap();
        let config = SureBackupConfig::load(&path).unwrap();
        assert_eq!(config.catalog.server, "https://vbr:9419");
    }
}
