//! Pruning Metrics
//!
//! Thread-safe counters accumulated across pruning runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::orchestrator::CleanupStats;

/// Thread-safe metrics for tracking pruning runs
#[derive(Debug, Clone, Default)]
pub struct PruneMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    /// Runs where the decision called for pruning
    runs_started: AtomicU64,
    /// Runs skipped by the decision
    runs_skipped: AtomicU64,
    /// Runs that reported more work left over
    runs_needing_retry: AtomicU64,
    transactions_removed: AtomicU64,
    docs_cleaned: AtomicU64,
    stash_documents_removed: AtomicU64,
    /// Total duration of completed runs in milliseconds
    total_duration_ms: AtomicU64,
}

impl PruneMetrics {
    /// Create a new metrics tracker
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run_started(&self) {
        self.inner.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_skipped(&self) {
        self.inner.runs_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a completed run
    pub fn record_cleanup(&self, stats: &CleanupStats) {
        self.inner
            .transactions_removed
            .fetch_add(stats.transactions_removed, Ordering::Relaxed);
        self.inner
            .docs_cleaned
            .fetch_add(stats.docs_cleaned, Ordering::Relaxed);
        self.inner
            .stash_documents_removed
            .fetch_add(stats.stash_documents_removed, Ordering::Relaxed);
        if stats.should_retry {
            self.inner.runs_needing_retry.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_duration_ms(&self, duration_ms: u64) {
        self.inner
            .total_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn runs_started(&self) -> u64 {
        self.inner.runs_started.load(Ordering::Relaxed)
    }

    pub fn runs_skipped(&self) -> u64 {
        self.inner.runs_skipped.load(Ordering::Relaxed)
    }

    pub fn runs_needing_retry(&self) -> u64 {
        self.inner.runs_needing_retry.load(Ordering::Relaxed)
    }

    pub fn transactions_removed(&self) -> u64 {
        self.inner.transactions_removed.load(Ordering::Relaxed)
    }

    pub fn docs_cleaned(&self) -> u64 {
        self.inner.docs_cleaned.load(Ordering::Relaxed)
    }

    pub fn stash_documents_removed(&self) -> u64 {
        self.inner.stash_documents_removed.load(Ordering::Relaxed)
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.inner.total_duration_ms.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = PruneMetrics::new();
        assert_eq!(metrics.runs_started(), 0);
        assert_eq!(metrics.runs_skipped(), 0);
        assert_eq!(metrics.transactions_removed(), 0);
    }

    #[test]
    fn test_record_cleanup_accumulates() {
        let metrics = PruneMetrics::new();
        let stats = CleanupStats {
            collections_inspected: 3,
            docs_inspected: 40,
            docs_cleaned: 12,
            stash_documents_removed: 2,
            transactions_removed: 30,
            should_retry: true,
        };

        metrics.record_run_started();
        metrics.record_cleanup(&stats);
        metrics.record_cleanup(&CleanupStats {
            should_retry: false,
            ..stats
        });
        metrics.record_duration_ms(250);

        assert_eq!(metrics.runs_started(), 1);
        assert_eq!(metrics.transactions_removed(), 60);
        assert_eq!(metrics.docs_cleaned(), 24);
        assert_eq!(metrics.stash_documents_removed(), 4);
        assert_eq!(metrics.runs_needing_retry(), 1);
        assert_eq!(metrics.total_duration_ms(), 250);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = PruneMetrics::new();
        let clone = metrics.clone();
        clone.record_run_skipped();
        assert_eq!(metrics.runs_skipped(), 1);
    }
}
