//! SureBackup Core Library
//!
//! Restores a sample of recent backup restore points into an isolated cloud
//! network, verifies each restored VM, and tears the environment down again.

pub mod cancel;
pub mod catalog;
pub mod cleanup;
pub mod cloud;
pub mod config;
pub mod environment;
pub mod error;
pub mod fakes;
pub mod metrics;
pub mod model;
pub mod obs;
pub mod orchestrator;
pub mod run;
pub mod selector;
pub mod telemetry;
pub mod verification;

pub use cancel::{cancellation, CancelHandle, CancelSignal, Cancelled};
pub use catalog::{BackupCatalog, CatalogClient, CatalogError, RetryPolicy};
pub use cleanup::{cleanup, CleanupOutcome};
pub use cloud::{AzureCloud, CloudError, CloudProvider};
pub use config::{CatalogConfig, CloudConfig, SureBackupConfig};
pub use environment::{isolation_rules, EnvironmentProvisioner, SecurityRule};
pub use error::{Result, SureBackupError};
pub use metrics::MetricsSnapshot;
pub use model::{
    OverallResult, PortDetail, RestoreMode, RestorePoint, RestoreResult, RestoreStatus,
    TestEnvironment, VerificationResult,
};
pub use orchestrator::{OrchestratorConfig, RestoreOrchestrator, RestoreState};
pub use run::{run, RunContext, RunReport};
pub use selector::{RestorePointSelector, SelectionCriteria};
pub use telemetry::init_tracing;
pub use verification::{SoftCheckPolicy, VerificationConfig, VerificationPipeline};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
