//! End-to-end run driver.
//!
//! authenticate → select → provision → restore + verify each candidate →
//! cleanup. Cleanup runs whenever an environment was provisioned, including
//! after cancellation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, Instrument};

use crate::cancel::CancelSignal;
use crate::catalog::BackupCatalog;
use crate::cleanup::{cleanup, CleanupOutcome};
use crate::cloud::CloudProvider;
use crate::config::SureBackupConfig;
use crate::environment::EnvironmentProvisioner;
use crate::error::{Result, SureBackupError};
use crate::metrics::{MetricsSnapshot, METRICS};
use crate::model::{
    OverallResult, RestorePoint, RestoreResult, TestEnvironment, VerificationResult,
};
use crate::obs;
use crate::orchestrator::{OrchestratorConfig, RestoreOrchestrator};
use crate::selector::RestorePointSelector;
use crate::verification::{VerificationConfig, VerificationPipeline};

/// Everything a run needs, passed explicitly to each component.
pub struct RunContext {
    pub run_id: String,
    pub config: SureBackupConfig,
    pub catalog: Arc<dyn BackupCatalog>,
    pub cloud: Arc<dyn CloudProvider>,
    pub cancel: CancelSignal,
}

impl RunContext {
    pub fn new(
        config: SureBackupConfig,
        catalog: Arc<dyn BackupCatalog>,
        cloud: Arc<dyn CloudProvider>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            config,
            catalog,
            cloud,
            cancel,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `None` when there was nothing to test.
    pub environment: Option<TestEnvironment>,
    pub restores: Vec<RestoreResult>,
    /// One entry per selected restore point, in selection order.
    pub results: Vec<VerificationResult>,
    /// `None` if nothing was provisioned or teardown failed.
    pub cleanup: Option<CleanupOutcome>,
    /// Counter activity attributable to this run.
    pub metrics: MetricsSnapshot,
}

impl RunReport {
    fn count(&self, verdict: OverallResult) -> usize {
        self.results
            .iter()
            .filter(|r| r.overall_result == verdict)
            .count()
    }

    pub fn passed(&self) -> usize {
        self.count(OverallResult::Pass)
    }

    pub fn partial(&self) -> usize {
        self.count(OverallResult::Partial)
    }

    pub fn failed(&self) -> usize {
        self.count(OverallResult::Fail)
    }

    /// True when no VM failed.
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Execute one complete run.
///
/// Authentication and provisioning failures abort the run; anything scoped
/// to a single VM is captured in that VM's result.
pub async fn run(ctx: &RunContext) -> Result<RunReport> {
    run_inner(ctx).instrument(obs::run_span(&ctx.run_id)).await
}

async fn run_inner(ctx: &RunContext) -> Result<RunReport> {
    let clock = Instant::now();
    let started_at = Utc::now();
    let baseline = METRICS.snapshot();
    let config = &ctx.config;
    obs::emit_run_started(&ctx.run_id, &config.test_region, config.max_vms_to_test);

    // Catalog retries can back off for minutes.
    let candidates = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(SureBackupError::Cancelled),
        selected = authenticate_and_select(ctx) => selected?,
    };

    let mut report = RunReport {
        run_id: ctx.run_id.clone(),
        started_at,
        finished_at: started_at,
        environment: None,
        restores: Vec::new(),
        results: Vec::new(),
        cleanup: None,
        metrics: MetricsSnapshot::default(),
    };

    if candidates.is_empty() {
        info!("no restore points qualify; nothing to test");
        return Ok(finish(report, clock, &baseline));
    }
    if ctx.cancel.is_cancelled() {
        return Err(SureBackupError::Cancelled);
    }

    let env = EnvironmentProvisioner::new(ctx.cloud.as_ref())
        .provision(&config.test_region, &config.test_network_cidr)
        .await?;

    let orchestrator = RestoreOrchestrator::new(
        ctx.catalog.as_ref(),
        ctx.cloud.as_ref(),
        OrchestratorConfig::from(config),
    );
    let pipeline = VerificationPipeline::new(ctx.cloud.as_ref(), VerificationConfig::from(config));
    let (orchestrator, pipeline, env_ref, cancel) = (&orchestrator, &pipeline, &env, &ctx.cancel);

    let outcomes: Vec<(RestoreResult, VerificationResult)> = stream::iter(candidates.iter())
        .map(move |point| async move {
            let restore = orchestrator.restore(point, env_ref, cancel).await;
            let verification = pipeline.verify(&restore, point, env_ref, cancel).await;
            (restore, verification)
        })
        .buffered(config.max_parallel_restores.max(1))
        .collect()
        .await;

    for (restore, verification) in outcomes {
        report.restores.push(restore);
        report.results.push(verification);
    }

    // Failure is logged with the manual command inside `cleanup`.
    report.cleanup = cleanup(ctx.cloud.as_ref(), &env, config.retain_test_environment)
        .await
        .ok();
    report.environment = Some(env);

    Ok(finish(report, clock, &baseline))
}

async fn authenticate_and_select(ctx: &RunContext) -> Result<Vec<RestorePoint>> {
    ctx.catalog.authenticate().await?;
    RestorePointSelector::new(ctx.catalog.as_ref())
        .select_candidates(&ctx.config.selection_criteria())
        .await
}

fn finish(mut report: RunReport, clock: Instant, baseline: &MetricsSnapshot) -> RunReport {
    report.finished_at = Utc::now();
    report.metrics = METRICS.flush_since(&report.run_id, baseline);
    obs::emit_run_finished(
        &report.run_id,
        clock.elapsed().as_millis() as u64,
        report.results.len(),
        report.passed(),
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation;
    use crate::catalog::{Backup, CatalogRestorePoint, Job};
    use crate::fakes::{MemoryCatalog, MemoryCloud};

    fn catalog_with(vms: &[&str]) -> MemoryCatalog {
        let points = vms
            .iter()
            .enumerate()
            .map(|(i, vm)| CatalogRestorePoint {
                id: format!("rp-{i}"),
                name: vm.to_string(),
                creation_time: Utc::now(),
            })
            .collect();
        MemoryCatalog::new()
            .with_job(Job {
                id: "j1".into(),
                name: "Azure Prod".into(),
                job_type: "AzureBackup".into(),
                is_disabled: false,
            })
            .with_backup(
                Backup {
                    id: "b1".into(),
                    name: "Azure Prod".into(),
                    job_id: Some("j1".into()),
                    platform_name: None,
                },
                points,
            )
    }

    fn context(catalog: MemoryCatalog, cloud: Arc<MemoryCloud>) -> RunContext {
        let mut config = SureBackupConfig::default();
        config.catalog.server = "https://vbr.local:9419".into();
        RunContext::new(config, Arc::new(catalog), cloud, CancelSignal::never())
    }

    #[tokio::test]
    async fn test_empty_selection_is_clean_completion() {
        let cloud = Arc::new(MemoryCloud::new());
        let ctx = context(MemoryCatalog::new(), cloud.clone());
        let report = run(&ctx).await.unwrap();

        assert!(report.results.is_empty());
        assert!(report.environment.is_none());
        assert!(report.cleanup.is_none());
        assert!(report.is_success());
        assert!(cloud.resource_groups().is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_run() {
        let cloud = Arc::new(MemoryCloud::new());
        let ctx = context(catalog_with(&["vmA"]).fail_authentication(), cloud.clone());
        let err = run(&ctx).await.unwrap_err();
        assert!(matches!(err, SureBackupError::Catalog(_)));
        assert!(cloud.resource_groups().is_empty());
    }

    #[tokio::test]
    async fn test_results_follow_selection_order() {
        let cloud = Arc::new(MemoryCloud::new());
        let ctx = context(catalog_with(&["vmA", "vmB"]), cloud.clone());
        let report = run(&ctx).await.unwrap();

        let names: Vec<_> = report
            .results
            .iter()
            .map(|r| r.source_vm_name.as_str())
            .collect();
        assert_eq!(names, vec!["vmA", "vmB"]);
        assert_eq!(report.passed(), 2);
        // Other runs in this process may add to the shared counters.
        assert!(report.metrics.restores_started >= 2);
        assert!(report.metrics.verifications_passed >= 2);
        assert_eq!(report.cleanup, Some(CleanupOutcome::Deleted));
        assert!(cloud.resource_groups().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_provisioning_creates_nothing() {
        let (handle, signal) = cancellation();
        let cloud = Arc::new(MemoryCloud::new());
        let mut ctx = context(catalog_with(&["vmA"]), cloud.clone());
        ctx.cancel = signal;
        handle.cancel();

        let err = run(&ctx).await.unwrap_err();
        assert!(matches!(err, SureBackupError::Cancelled));
        assert!(cloud.resource_groups().is_empty());
        assert!(cloud.deleted_groups().is_empty());
    }
}
