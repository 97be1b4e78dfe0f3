//! Run-level error taxonomy for SureBackup.
//!
//! Errors scoped to a single VM (restore, verification) never surface here;
//! they are captured in that VM's result. Only failures that prevent any work
//! from being discovered or hosted abort a run.

use crate::catalog::CatalogError;
use crate::cloud::CloudError;

/// SureBackup run errors.
#[derive(Debug, thiserror::Error)]
pub enum SureBackupError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("test environment provisioning failed: {0}")]
    Provisioning(String),

    #[error("cleanup of {resource_group} failed: {reason} (remove manually with: {manual_command})")]
    Cleanup {
        resource_group: String,
        reason: String,
        manual_command: String,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for SureBackup run operations.
pub type Result<T> = std::result::Result<T, SureBackupError>;
