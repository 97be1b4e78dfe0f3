//! Process-wide counters for restore and verification activity.
//!
//! Components bump [`METRICS`] where the event happens. A run takes a
//! [`MetricsSnapshot`] when it starts and reports the difference when it
//! finishes, so overlapping runs in one process never zero each other's
//! counts.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    catalog_retries: AtomicU64,
    restores_started: AtomicU64,
    restore_fallbacks: AtomicU64,
    restore_timeouts: AtomicU64,
    verifications_passed: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub catalog_retries: u64,
    pub restores_started: u64,
    pub restore_fallbacks: u64,
    pub restore_timeouts: u64,
    pub verifications_passed: u64,
}

impl MetricsSnapshot {
    /// Counts accumulated between `earlier` and `self`.
    pub fn since(&self, earlier: &MetricsSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            catalog_retries: self.catalog_retries.saturating_sub(earlier.catalog_retries),
            restores_started: self.restores_started.saturating_sub(earlier.restores_started),
            restore_fallbacks: self
                .restore_fallbacks
                .saturating_sub(earlier.restore_fallbacks),
            restore_timeouts: self.restore_timeouts.saturating_sub(earlier.restore_timeouts),
            verifications_passed: self
                .verifications_passed
                .saturating_sub(earlier.verifications_passed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            catalog_retries: AtomicU64::new(0),
            restores_started: AtomicU64::new(0),
            restore_fallbacks: AtomicU64::new(0),
            restore_timeouts: AtomicU64::new(0),
            verifications_passed: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = name, "counter incremented");
    }

    pub fn inc_catalog_retries(&self) {
        Self::bump(&self.catalog_retries, "catalog_retries");
    }

    pub fn inc_restores_started(&self) {
        Self::bump(&self.restores_started, "restores_started");
    }

    /// A catalog restore was rejected and a stand-in VM was deployed.
    pub fn inc_restore_fallbacks(&self) {
        Self::bump(&self.restore_fallbacks, "restore_fallbacks");
    }

    pub fn inc_restore_timeouts(&self) {
        Self::bump(&self.restore_timeouts, "restore_timeouts");
    }

    pub fn inc_verifications_passed(&self) {
        Self::bump(&self.verifications_passed, "verifications_passed");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            catalog_retries: self.catalog_retries.load(Ordering::Relaxed),
            restores_started: self.restores_started.load(Ordering::Relaxed),
            restore_fallbacks: self.restore_fallbacks.load(Ordering::Relaxed),
            restore_timeouts: self.restore_timeouts.load(Ordering::Relaxed),
            verifications_passed: self.verifications_passed.load(Ordering::Relaxed),
        }
    }

    /// Log the counts accumulated since `start` as one `info!` event and
    /// return them.
    pub fn flush_since(&self, run_id: &str, start: &MetricsSnapshot) -> MetricsSnapshot {
        let delta = self.snapshot().since(start);
        tracing::info!(
            metric = "flush",
            run_id = %run_id,
            catalog_retries = delta.catalog_retries,
            restores_started = delta.restores_started,
            restore_fallbacks = delta.restore_fallbacks,
            restore_timeouts = delta.restore_timeouts,
            verifications_passed = delta.verifications_passed,
        );
        delta
    }
}
