//! SureBackup - automated backup recoverability testing
//!
//! The `surebackup` command restores recent backups into an isolated cloud
//! network, verifies the restored VMs, and tears the network down.
//!
//! ## Commands
//!
//! - `run`: Restore and verify the selected restore points
//! - `candidates`: Show which restore points a run would test
//! - `cleanup`: Delete a test environment retained by an earlier run

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{warn, Level};

use surebackup_core::cleanup::delete_resource_group;
use surebackup_core::{
    cancellation, run, AzureCloud, CatalogClient, CleanupOutcome, RestorePointSelector,
    RunContext, RunReport, SureBackupConfig, VerificationResult,
};

#[derive(Parser)]
#[command(name = "surebackup")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Automated recoverability testing for cloud VM backups", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Path to the TOML configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "SUREBACKUP_CONFIG",
        default_value = "surebackup.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore and verify recent restore points in an isolated environment
    Run {
        /// Keep the test environment after the run
        #[arg(long)]
        retain: bool,

        /// Override the maximum number of VMs to test
        #[arg(long)]
        max_vms: Option<usize>,

        /// Number of restore points processed concurrently
        #[arg(long)]
        parallel: Option<usize>,
    },

    /// List the restore points a run would test, without restoring anything
    Candidates {
        /// Override the maximum number of VMs to test
        #[arg(long)]
        max_vms: Option<usize>,
    },

    /// Delete a retained test environment
    Cleanup {
        /// Resource group reported by the retaining run
        #[arg(long)]
        resource_group: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    surebackup_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            retain,
            max_vms,
            parallel,
        } => cmd_run(&cli.config, retain, max_vms, parallel).await,
        Commands::Candidates { max_vms } => cmd_candidates(&cli.config, max_vms).await,
        Commands::Cleanup { resource_group } => cmd_cleanup(&cli.config, &resource_group).await,
    }
}

fn load_config(path: &Path) -> Result<SureBackupConfig> {
    let config = SureBackupConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    Ok(config.with_env_secrets())
}

/// Run the full restore-and-verify pipeline
async fn cmd_run(
    config_path: &Path,
    retain: bool,
    max_vms: Option<usize>,
    parallel: Option<usize>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if retain {
        config.retain_test_environment = true;
    }
    if let Some(max_vms) = max_vms {
        config.max_vms_to_test = max_vms;
    }
    if let Some(parallel) = parallel {
        config.max_parallel_restores = parallel;
    }
    config.validate().context("Invalid configuration")?;

    let catalog = CatalogClient::new(&config.catalog).context("Failed to create catalog client")?;
    let cloud = AzureCloud::new(config.cloud.clone()).context("Failed to create cloud client")?;

    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run (cleanup will still run)");
            handle.cancel();
        }
    });

    let ctx = RunContext::new(config, Arc::new(catalog), Arc::new(cloud), signal);
    let report = run(&ctx).await.context("SureBackup run failed")?;

    print_report(&report);

    if !report.is_success() {
        bail!("{} VM(s) failed verification", report.failed());
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("Run: {}", report.run_id);
    if report.results.is_empty() {
        println!("No restore points qualified for testing.");
        return;
    }
    if let Some(env) = &report.environment {
        println!("Environment: {} ({})", env.resource_group_name, env.region);
    }
    println!();
    for result in &report.results {
        print_result(result);
    }
    println!(
        "Summary: {} passed, {} partial, {} failed",
        report.passed(),
        report.partial(),
        report.failed()
    );
    match report.cleanup {
        Some(CleanupOutcome::Deleted) => println!("Cleanup: environment deleted"),
        Some(CleanupOutcome::Retained) => println!("Cleanup: environment retained"),
        None => println!("Cleanup: FAILED, see log for the manual teardown command"),
    }
}

fn print_result(result: &VerificationResult) {
    let flag = |verified: bool| if verified { "ok" } else { "--" };
    println!(
        "{:<8} {} -> {}{}",
        result.overall_result.to_string(),
        result.source_vm_name,
        result.test_vm_name,
        if result.degraded { " [stand-in]" } else { "" }
    );
    println!(
        "         restore={} boot={} heartbeat={} ports={} script={}",
        result.restore_status,
        flag(result.boot_verified),
        flag(result.heartbeat_verified),
        flag(result.ports_verified),
        flag(result.script_verified)
    );
    for detail in &result.details {
        println!("         - {}", detail);
    }
}

/// Show the restore points a run would test
async fn cmd_candidates(config_path: &Path, max_vms: Option<usize>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(max_vms) = max_vms {
        config.max_vms_to_test = max_vms;
    }
    config.validate().context("Invalid configuration")?;

    let catalog = CatalogClient::new(&config.catalog).context("Failed to create catalog client")?;
    catalog
        .authenticate()
        .await
        .context("Failed to authenticate to the backup catalog")?;

    let candidates = RestorePointSelector::new(&catalog)
        .select_candidates(&config.selection_criteria())
        .await
        .context("Failed to select restore points")?;

    if candidates.is_empty() {
        println!("No restore points qualify for testing.");
        return Ok(());
    }

    for point in candidates {
        println!("{}", point.vm_name);
        println!("    Restore point: {}", point.restore_point_id);
        println!("    Backup:        {}", point.backup_name);
        if let Some(job) = &point.job_name {
            println!("    Job:           {}", job);
        }
        println!(
            "    Created:       {}",
            point.creation_time.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    Ok(())
}

/// Delete a retained test environment
async fn cmd_cleanup(config_path: &Path, resource_group: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let cloud = AzureCloud::new(config.cloud).context("Failed to create cloud client")?;

    match delete_resource_group(&cloud, resource_group, false).await {
        Ok(_) => {
            println!("Deleted test environment {}", resource_group);
            Ok(())
        }
        Err(e) => Err(e).context(format!("Failed to delete {}", resource_group)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "surebackup",
            "--config",
            "/etc/surebackup.toml",
            "run",
            "--retain",
            "--max-vms",
            "5",
            "--parallel",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/surebackup.toml"));
        match cli.command {
            Commands::Run {
                retain,
                max_vms,
                parallel,
            } => {
                assert!(retain);
                assert_eq!(max_vms, Some(5));
                assert_eq!(parallel, Some(2));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cleanup_requires_resource_group() {
        assert!(Cli::try_parse_from(["surebackup", "cleanup"]).is_err());
        let cli = Cli::try_parse_from([
            "surebackup",
            "cleanup",
            "--resource-group",
            "surebackup-test-20240520120000-abcd1234",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Cleanup { .. }));
    }

    #[test]
    fn test_load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("surebackup.toml");
        std::fs::write(&path, "max_vms_to_test = 2\n[catalog]\nserver = \"https://vbr:9419\"\n")
            .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.max_vms_to_test, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_config_is_error() {
        assert!(load_config(Path::new("/nonexistent/surebackup.toml")).is_err());
    }
}
