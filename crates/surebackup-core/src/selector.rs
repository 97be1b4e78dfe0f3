//! Restore point selection.
//!
//! Picks at most one recent restore point per VM from backups that target the
//! cloud tier, capped at the configured maximum. Output order is the order in
//! which each VM was first seen while enumerating backups.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::{Backup, BackupCatalog, Job};
use crate::error::Result;
use crate::model::RestorePoint;
use crate::obs;

/// Job types and names containing one of these mark the cloud backup tier.
const CLOUD_TIER_MARKERS: &[&str] = &["azure", "cloud"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionCriteria {
    pub max_age_days: u32,
    /// Optional allow-list of job names (case-insensitive). Empty = all.
    pub job_name_filter: Vec<String>,
    pub max_count: usize,
}

fn matches_cloud_tier(value: &str) -> bool {
    let value = value.to_ascii_lowercase();
    CLOUD_TIER_MARKERS.iter().any(|marker| value.contains(marker))
}

fn allowed(name: &str, filter: &[String]) -> bool {
    filter.is_empty() || filter.iter().any(|f| f.eq_ignore_ascii_case(name))
}

fn job_qualifies(job: &Job, filter: &[String]) -> bool {
    (matches_cloud_tier(&job.job_type) || matches_cloud_tier(&job.name))
        && allowed(&job.name, filter)
}

fn backup_qualifies_loosely(backup: &Backup, filter: &[String]) -> bool {
    let heuristic = matches_cloud_tier(&backup.name)
        || backup
            .platform_name
            .as_deref()
            .is_some_and(matches_cloud_tier);
    heuristic && allowed(&backup.name, filter)
}

/// Keeps the newest restore point per VM, preserving first-seen order.
#[derive(Debug, Default)]
struct LatestPerVm {
    points: Vec<RestorePoint>,
    index: HashMap<String, usize>,
}

impl LatestPerVm {
    fn offer(&mut self, point: RestorePoint) {
        match self.index.get(&point.vm_name) {
            Some(&i) => {
                if point.creation_time > self.points[i].creation_time {
                    self.points[i] = point;
                }
            }
            None => {
                self.index.insert(point.vm_name.clone(), self.points.len());
                self.points.push(point);
            }
        }
    }

    fn into_vec(self) -> Vec<RestorePoint> {
        self.points
    }
}

pub struct RestorePointSelector<'a> {
    catalog: &'a dyn BackupCatalog,
}

impl<'a> RestorePointSelector<'a> {
    pub fn new(catalog: &'a dyn BackupCatalog) -> Self {
        Self { catalog }
    }

    pub async fn select_candidates(&self, criteria: &SelectionCriteria) -> Result<Vec<RestorePoint>> {
        self.select_candidates_at(criteria, Utc::now()).await
    }

    /// Select relative to an explicit `now`.
    pub async fn select_candidates_at(
        &self,
        criteria: &SelectionCriteria,
        now: DateTime<Utc>,
    ) -> Result<Vec<RestorePoint>> {
        let jobs = self.catalog.list_jobs().await?;
        let qualifying: HashMap<&str, &Job> = jobs
            .iter()
            .filter(|job| job_qualifies(job, &criteria.job_name_filter))
            .map(|job| (job.id.as_str(), job))
            .collect();

        let backups = self.catalog.list_backups().await?;
        let fallback = qualifying.is_empty();
        let selected: Vec<(&Backup, Option<String>)> = if fallback {
            warn!(
                jobs = jobs.len(),
                "no cloud-tier backup jobs found; falling back to backup name heuristics"
            );
            backups
                .iter()
                .filter(|b| backup_qualifies_loosely(b, &criteria.job_name_filter))
                .map(|b| (b, None))
                .collect()
        } else {
            backups
                .iter()
                .filter_map(|b| {
                    let job = qualifying.get(b.job_id.as_deref()?)?;
                    Some((b, Some(job.name.clone())))
                })
                .collect()
        };

        let cutoff = now - Duration::days(i64::from(criteria.max_age_days));
        let mut latest = LatestPerVm::default();
        for (backup, job_name) in selected {
            let points = self.catalog.list_restore_points(&backup.id).await?;
            debug!(backup = %backup.name, points = points.len(), "enumerated restore points");
            for point in points.into_iter().filter(|p| p.creation_time > cutoff) {
                latest.offer(RestorePoint {
                    backup_name: backup.name.clone(),
                    backup_id: backup.id.clone(),
                    restore_point_id: point.id,
                    vm_name: point.name,
                    creation_time: point.creation_time,
                    job_name: job_name.clone(),
                });
            }
        }

        let mut candidates = latest.into_vec();
        candidates.truncate(criteria.max_count);
        obs::emit_candidates_selected(candidates.len(), fallback);
        Ok(candidates)
    }
}
