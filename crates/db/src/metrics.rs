//! Persistence metrics for monitoring resilience behavior.
//!
//! This module provides atomic counters for retries, classified failures,
//! position conflicts, connection recovery and degradation transitions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use sqlx::SqlitePool;
use ts_rs::TS;

use crate::classify::ErrorKind;

/// Persistence metrics collector.
///
/// All metrics are tracked using atomic operations for thread-safety
/// without locking overhead.
#[derive(Debug, Clone, Default)]
pub struct DbMetrics {
    inner: Arc<DbMetricsInner>,
}

#[derive(Debug, Default)]
struct DbMetricsInner {
    // Retry loop
    retry_attempts: AtomicU64,
    retry_successes: AtomicU64,
    retry_failures: AtomicU64,

    // Final classified failures, indexed by ErrorKind
    classified: [AtomicU64; ErrorKind::ALL.len()],

    position_conflicts: AtomicU64,

    // Connection recovery
    recovery_attempts: AtomicU64,
    recovery_successes: AtomicU64,
    recovery_exhaustions: AtomicU64,

    mode_transitions: AtomicU64,
}

impl DbMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a retried operation and whether it eventually succeeded.
    pub fn record_retry(&self, succeeded: bool) {
        self.inner.retry_attempts.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.inner.retry_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.retry_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a failure surfaced to a caller.
    pub fn record_classified(&self, kind: ErrorKind) {
        self.inner.classified[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_position_conflict(&self) {
        self.inner.position_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one connection recovery attempt and its outcome.
    pub fn record_recovery(&self, succeeded: bool) {
        self.inner.recovery_attempts.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.inner.recovery_successes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_recovery_exhausted(&self) {
        self.inner
            .recovery_exhaustions
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mode_transition(&self) {
        self.inner.mode_transitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current pool statistics from SQLx.
    pub fn get_pool_stats(&self, pool: &SqlitePool) -> PoolStats {
        PoolStats {
            size: pool.size(),
            idle: pool.num_idle() as u32,
            acquired: pool.size().saturating_sub(pool.num_idle() as u32),
        }
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> DbMetricsSnapshot {
        let classified_failures = ErrorKind::ALL
            .into_iter()
            .map(|kind| {
                (
                    kind.to_string(),
                    self.inner.classified[kind.index()].load(Ordering::Relaxed),
                )
            })
            .filter(|(_, count)| *count > 0)
            .collect();

        DbMetricsSnapshot {
            retry_attempts: self.inner.retry_attempts.load(Ordering::Relaxed),
            retry_successes: self.inner.retry_successes.load(Ordering::Relaxed),
            retry_failures: self.inner.retry_failures.load(Ordering::Relaxed),
            classified_failures,
            position_conflicts: self.inner.position_conflicts.load(Ordering::Relaxed),
            recovery_attempts: self.inner.recovery_attempts.load(Ordering::Relaxed),
            recovery_successes: self.inner.recovery_successes.load(Ordering::Relaxed),
            recovery_exhaustions: self.inner.recovery_exhaustions.load(Ordering::Relaxed),
            mode_transitions: self.inner.mode_transitions.load(Ordering::Relaxed),
        }
    }
}

/// Connection pool statistics.
#[derive(Debug, Clone, Serialize, TS)]
pub struct PoolStats {
    /// Total connections in the pool.
    pub size: u32,
    /// Idle connections available.
    pub idle: u32,
    /// Currently acquired connections.
    pub acquired: u32,
}

/// Snapshot of all persistence metrics.
#[derive(Debug, Clone, Serialize, TS)]
pub struct DbMetricsSnapshot {
    /// Operations that needed at least one retry.
    pub retry_attempts: u64,
    /// Retried operations that eventually succeeded.
    pub retry_successes: u64,
    /// Retried operations that exhausted their attempts.
    pub retry_failures: u64,
    /// Surfaced failures per kind (kinds with zero count omitted).
    pub classified_failures: BTreeMap<String, u64>,
    /// Ordering mutations rejected because their precondition went stale.
    pub position_conflicts: u64,
    pub recovery_attempts: u64,
    pub recovery_successes: u64,
    /// Times the recovery budget ran out.
    pub recovery_exhaustions: u64,
    /// Degradation mode changes.
    pub mode_transitions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = DbMetrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.retry_attempts, 0);
        assert!(snapshot.classified_failures.is_empty());
    }

    #[test]
    fn test_record_retry() {
        let metrics = DbMetrics::new();

        metrics.record_retry(true);
        metrics.record_retry(true);
        metrics.record_retry(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.retry_attempts, 3);
        assert_eq!(snapshot.retry_successes, 2);
        assert_eq!(snapshot.retry_failures, 1);
    }

    #[test]
    fn test_record_classified_per_kind() {
        let metrics = DbMetrics::new();
        metrics.record_classified(ErrorKind::Timeout);
        metrics.record_classified(ErrorKind::Timeout);
        metrics.record_classified(ErrorKind::ConstraintViolation);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.classified_failures.get("TIMEOUT"), Some(&2));
        assert_eq!(
            snapshot.classified_failures.get("CONSTRAINT_VIOLATION"),
            Some(&1)
        );
        assert!(!snapshot.classified_failures.contains_key("UNKNOWN"));
    }

    #[test]
    fn test_recovery_counters() {
        let metrics = DbMetrics::new();
        metrics.record_recovery(false);
        metrics.record_recovery(true);
        metrics.record_recovery_exhausted();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.recovery_attempts, 2);
        assert_eq!(snapshot.recovery_successes, 1);
        assert_eq!(snapshot.recovery_exhaustions, 1);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = DbMetrics::new();
        let clone = metrics.clone();
        clone.record_position_conflict();
        clone.record_mode_transition();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.position_conflicts, 1);
        assert_eq!(snapshot.mode_transitions, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = DbMetrics::new();
        metrics.record_classified(ErrorKind::NotFound);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["classified_failures"]["NOT_FOUND"], 1);
    }
}
