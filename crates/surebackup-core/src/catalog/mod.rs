//! Backup catalog access.
//!
//! - [`BackupCatalog`]: the seam the selector and orchestrator depend on
//! - [`client`]: `CatalogClient`, the token-authenticated REST implementation
//! - [`retry`]: `RetryPolicy` and the capped exponential backoff loop
//! - [`types`]: wire types (jobs, backups, restore points, sessions)
//! - [`error`]: `CatalogError` with typed transient classification

pub mod client;
pub mod error;
pub mod retry;
pub mod types;

use async_trait::async_trait;

pub use client::CatalogClient;
pub use error::CatalogError;
pub use retry::{retry_transient, retry_with, RetryPolicy};
pub use types::{
    Backup, CatalogRestorePoint, Job, RestoreRequest, RestoreSession, SessionResult, SessionState,
};

/// Operations the restore-and-verify engine needs from the backup catalog.
#[async_trait]
pub trait BackupCatalog: Send + Sync {
    /// Acquire (or refresh) the access token. Fatal for the run on failure.
    async fn authenticate(&self) -> Result<(), CatalogError>;

    async fn list_jobs(&self) -> Result<Vec<Job>, CatalogError>;

    async fn list_backups(&self) -> Result<Vec<Backup>, CatalogError>;

    async fn list_restore_points(
        &self,
        backup_id: &str,
    ) -> Result<Vec<CatalogRestorePoint>, CatalogError>;

    /// Submit a restore and return the catalog session id.
    async fn start_restore(&self, request: &RestoreRequest) -> Result<String, CatalogError>;

    async fn get_restore_session(&self, session_id: &str) -> Result<RestoreSession, CatalogError>;
}
