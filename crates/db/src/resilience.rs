//! Request-facing composition of the resilience components.
//!
//! A [`ResilienceContext`] is constructed once at process start and cloned
//! into request handlers. Each wrapped operation flows through:
//!
//! ```text
//! operation ─fail─▶ classify ─▶ should_retry? ─yes─▶ backoff, re-attempt
//!                                   │
//!                                   no / exhausted
//!                                   ▼
//!                  metrics + degradation (+ background recovery)
//!                                   ▼
//!                           PersistenceError
//! ```
//!
//! Domain outcomes (validation, position conflict, missing entity) skip the
//! whole pipeline and reach the caller unchanged.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::classify::{ClassifiedError, ErrorClassifier, ErrorKind, StorageFailure};
use crate::degradation::{DegradationController, DegradationMode};
use crate::metrics::DbMetrics;
use crate::ordering::{OrderingError, PositionConflict};
use crate::recovery::{
    ConnectionRecoveryMonitor, DEFAULT_MAX_RECOVERY_ATTEMPTS, RecoverableConnection,
};
use crate::retry::{RetryConfig, with_retry_until};
use crate::validation::ValidationError;

/// What a caller of a wrapped operation can see.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Re-read and retry at the application level.
    #[error(transparent)]
    Conflict(#[from] PositionConflict),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("Writes are unavailable in {mode} mode")]
    Unavailable { mode: DegradationMode },
    /// Classified storage failure, after any retries.
    #[error(transparent)]
    Storage(ClassifiedError),
}

impl PersistenceError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, PersistenceError::Conflict(_))
    }

    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            PersistenceError::Storage(classified) => Some(classified),
            _ => None,
        }
    }
}

impl From<OrderingError> for PersistenceError {
    fn from(error: OrderingError) -> Self {
        match error {
            OrderingError::Validation(e) => PersistenceError::Validation(e),
            OrderingError::Conflict(e) => PersistenceError::Conflict(e),
            OrderingError::NotFound { entity, id } => PersistenceError::NotFound { entity, id },
            OrderingError::NotDense(report) => PersistenceError::Storage(
                ClassifiedError::new(ErrorKind::TransactionFailed, report.to_string())
                    .with_context("parent_id", report.parent_id.to_string()),
            ),
            OrderingError::Database(e) => e.into(),
        }
    }
}

/// Classify with the default table. Used only outside a context.
fn classify_default<E>(error: E) -> PersistenceError
where
    E: StorageFailure + std::error::Error + Send + Sync + 'static,
{
    let classified = match error.signal() {
        Some(signal) => ErrorClassifier::default().classify(&signal),
        None => ClassifiedError::new(ErrorKind::Unknown, error.to_string()),
    };
    PersistenceError::Storage(classified.with_source(error))
}

impl From<sqlx::Error> for PersistenceError {
    fn from(error: sqlx::Error) -> Self {
        classify_default(error)
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(error: std::io::Error) -> Self {
        classify_default(error)
    }
}

const DEFAULT_AUTO_RECOVERY: bool = true;

#[derive(Clone, Debug)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    /// Consecutive failed reconnects before manual intervention is required.
    pub recovery_max_attempts: u32,
    /// Spawn a reconnect attempt when a request ends in `CONNECTION_FAILED`.
    pub auto_recovery: bool,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            recovery_max_attempts: std::env::var("TASKBOARD_RECOVERY_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(DEFAULT_MAX_RECOVERY_ATTEMPTS),
            auto_recovery: std::env::var("TASKBOARD_AUTO_RECOVERY")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(DEFAULT_AUTO_RECOVERY),
        }
    }
}

/// Shared resilience state for one process. Cheap to clone.
#[derive(Clone)]
pub struct ResilienceContext {
    config: Arc<ResilienceConfig>,
    classifier: Arc<ErrorClassifier>,
    degradation: Arc<DegradationController>,
    recovery: Arc<ConnectionRecoveryMonitor>,
    metrics: DbMetrics,
}

impl ResilienceContext {
    pub fn new(
        config: ResilienceConfig,
        connection: Arc<dyn RecoverableConnection>,
        metrics: DbMetrics,
    ) -> Self {
        Self::with_classifier(config, ErrorClassifier::default(), connection, metrics)
    }

    pub fn with_classifier(
        config: ResilienceConfig,
        classifier: ErrorClassifier,
        connection: Arc<dyn RecoverableConnection>,
        metrics: DbMetrics,
    ) -> Self {
        let recovery = ConnectionRecoveryMonitor::with_metrics(
            connection,
            config.recovery_max_attempts,
            metrics.clone(),
        );
        Self {
            config: Arc::new(config),
            classifier: Arc::new(classifier),
            degradation: Arc::new(DegradationController::new(metrics.clone())),
            recovery: Arc::new(recovery),
            metrics,
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn degradation(&self) -> &DegradationController {
        &self.degradation
    }

    pub fn recovery(&self) -> &ConnectionRecoveryMonitor {
        &self.recovery
    }

    pub fn metrics(&self) -> &DbMetrics {
        &self.metrics
    }

    /// Run a read with retries. Reads are served in every mode.
    pub async fn read<F, Fut, T, E>(&self, operation: &str, f: F) -> Result<T, PersistenceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StorageFailure + Into<PersistenceError> + std::error::Error + Send + Sync + 'static,
    {
        self.read_until(operation, &CancellationToken::new(), f).await
    }

    pub async fn read_until<F, Fut, T, E>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, PersistenceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StorageFailure + Into<PersistenceError> + std::error::Error + Send + Sync + 'static,
    {
        with_retry_until(
            &self.config.retry,
            &self.classifier,
            operation,
            cancel,
            Some(&self.metrics),
            f,
        )
        .await
        .map_err(|e| self.surface(operation, e))
    }

    /// Run a write with retries, refused up front when the mode forbids writes.
    pub async fn write<F, Fut, T, E>(&self, operation: &str, f: F) -> Result<T, PersistenceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StorageFailure + Into<PersistenceError> + std::error::Error + Send + Sync + 'static,
    {
        self.write_until(operation, &CancellationToken::new(), f).await
    }

    pub async fn write_until<F, Fut, T, E>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, PersistenceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StorageFailure + Into<PersistenceError> + std::error::Error + Send + Sync + 'static,
    {
        let mode = self.degradation.mode();
        if !mode.allows_writes() {
            tracing::debug!(operation = operation, mode = %mode, "Write refused");
            return Err(PersistenceError::Unavailable { mode });
        }
        self.read_until(operation, cancel, f).await
    }

    /// Attempt a reconnect now; on success return to `Normal` mode.
    pub async fn recover(&self) -> bool {
        recover_and_restore(&self.recovery, &self.degradation).await
    }

    /// Turn a final failure into what the caller sees, reporting storage
    /// failures on the way.
    fn surface<E>(&self, operation: &str, error: E) -> PersistenceError
    where
        E: StorageFailure + Into<PersistenceError> + std::error::Error + Send + Sync + 'static,
    {
        let surfaced = match error.signal() {
            Some(signal) => PersistenceError::Storage(
                self.classifier
                    .classify(&signal)
                    .with_context("operation", operation)
                    .with_source(error),
            ),
            None => error.into(),
        };

        match &surfaced {
            PersistenceError::Storage(classified) => self.report(operation, classified),
            PersistenceError::Conflict(conflict) => {
                self.metrics.record_position_conflict();
                tracing::info!(
                    operation = operation,
                    parent_id = %conflict.parent_id,
                    reason = %conflict.reason,
                    "Position conflict, caller must re-read"
                );
            }
            _ => {}
        }
        surfaced
    }

    fn report(&self, operation: &str, classified: &ClassifiedError) {
        self.metrics.record_classified(classified.kind);
        tracing::warn!(
            operation = operation,
            kind = %classified.kind,
            error = %classified,
            "Storage operation failed"
        );
        self.degradation.on_failure(classified);

        if classified.kind == ErrorKind::ConnectionFailed && self.config.auto_recovery {
            let recovery = self.recovery.clone();
            let degradation = self.degradation.clone();
            tokio::spawn(async move {
                recover_and_restore(&recovery, &degradation).await;
            });
        }
    }
}

async fn recover_and_restore(
    recovery: &ConnectionRecoveryMonitor,
    degradation: &DegradationController,
) -> bool {
    let recovered = recovery.attempt_recovery().await;
    if recovered {
        degradation.restore_normal();
    }
    recovered
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::ordering::ConflictReason;

    #[derive(Default)]
    struct StubConnection {
        healthy: AtomicBool,
        probes: AtomicU32,
    }

    #[async_trait]
    impl RecoverableConnection for StubConnection {
        async fn close(&self) {}

        async fn reopen(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn probe(&self) -> anyhow::Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                anyhow::bail!("connection refused")
            }
        }
    }

    fn context(conn: Arc<StubConnection>, auto_recovery: bool) -> ResilienceContext {
        let config = ResilienceConfig {
            retry: RetryConfig::new(2, 1),
            recovery_max_attempts: 3,
            auto_recovery,
        };
        ResilienceContext::new(config, conn, DbMetrics::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_degrades_to_read_only() {
        let ctx = context(Arc::new(StubConnection::default()), false);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = ctx
            .write("update_task", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(OrderingError::Database(sqlx::Error::Protocol("x".into()))) }
            })
            .await;
        // Unmatched protocol errors are UNKNOWN, not retried
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            result.unwrap_err().classified().map(|c| c.kind),
            Some(ErrorKind::Unknown)
        );
        assert_eq!(ctx.degradation().mode(), DegradationMode::ReducedFeatures);

        let denied: Result<(), _> = ctx
            .write("update_task", || async {
                Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "read-only filesystem",
                ))
            })
            .await;
        assert!(denied.is_err());
        assert_eq!(ctx.degradation().mode(), DegradationMode::ReadOnly);

        // Writes are now refused without calling the operation
        let refused: Result<(), PersistenceError> = ctx
            .write("create_task", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, OrderingError>(()) }
            })
            .await;
        assert!(matches!(
            refused,
            Err(PersistenceError::Unavailable {
                mode: DegradationMode::ReadOnly
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Reads still go through
        let read = ctx
            .read("list_tasks", || async { Ok::<_, sqlx::Error>(7) })
            .await;
        assert_eq!(read.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_bypasses_retry_and_degradation() {
        let ctx = context(Arc::new(StubConnection::default()), false);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = ctx
            .write("move_task", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(OrderingError::Conflict(PositionConflict {
                        parent_kind: "column",
                        parent_id: Uuid::nil(),
                        reason: ConflictReason::VersionChanged {
                            expected: 1,
                            actual: 2,
                        },
                    }))
                }
            })
            .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.degradation().mode(), DegradationMode::Normal);
        assert_eq!(ctx.metrics().snapshot().position_conflicts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_passes_through() {
        let ctx = context(Arc::new(StubConnection::default()), false);
        let result: Result<(), _> = ctx
            .write("delete_column", || async {
                Err(OrderingError::Validation(ValidationError::LastSibling {
                    kind: "column",
                }))
            })
            .await;
        assert!(matches!(
            result,
            Err(PersistenceError::Validation(ValidationError::LastSibling { .. }))
        ));
        assert_eq!(ctx.degradation().mode(), DegradationMode::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_failure_retries_then_degrades_to_cache_only() {
        let ctx = context(Arc::new(StubConnection::default()), false);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = ctx
            .read("list_boards", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(sqlx::Error::PoolClosed) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let error = result.unwrap_err();
        let classified = error.classified().unwrap();
        assert_eq!(classified.kind, ErrorKind::ConnectionFailed);
        assert_eq!(
            classified.context.get("operation").map(String::as_str),
            Some("list_boards")
        );
        assert_eq!(ctx.degradation().mode(), DegradationMode::CacheOnly);
        assert!(!ctx.degradation().allows_writes());

        let snapshot = ctx.metrics().snapshot();
        assert_eq!(snapshot.retry_failures, 1);
        assert_eq!(snapshot.classified_failures.get("CONNECTION_FAILED"), Some(&1));
    }

    #[tokio::test]
    async fn test_recover_restores_normal_mode() {
        let conn = Arc::new(StubConnection::default());
        let ctx = context(conn.clone(), false);
        ctx.degradation()
            .on_failure(&ClassifiedError::new(ErrorKind::ConnectionFailed, "down"));

        assert!(!ctx.recover().await);
        assert_eq!(ctx.degradation().mode(), DegradationMode::CacheOnly);

        conn.healthy.store(true, Ordering::SeqCst);
        assert!(ctx.recover().await);
        assert_eq!(ctx.degradation().mode(), DegradationMode::Normal);
    }

    #[tokio::test]
    async fn test_auto_recovery_spawned_on_connection_failure() {
        let conn = Arc::new(StubConnection::default());
        conn.healthy.store(true, Ordering::SeqCst);
        let ctx = ResilienceContext::new(
            ResilienceConfig {
                retry: RetryConfig::new(1, 1),
                recovery_max_attempts: 3,
                auto_recovery: true,
            },
            conn.clone(),
            DbMetrics::new(),
        );

        let result: Result<(), _> = ctx
            .read("list_boards", || async { Err(sqlx::Error::PoolClosed) })
            .await;
        assert!(result.is_err());

        // Let the background attempt run
        for _ in 0..100 {
            if ctx.degradation().mode() == DegradationMode::Normal {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(conn.probes.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.degradation().mode(), DegradationMode::Normal);
    }

    #[test]
    fn test_from_ordering_error() {
        let not_found: PersistenceError = OrderingError::NotFound {
            entity: "task",
            id: Uuid::nil(),
        }
        .into();
        assert!(matches!(not_found, PersistenceError::NotFound { entity: "task", .. }));

        let storage: PersistenceError = OrderingError::Database(sqlx::Error::PoolTimedOut).into();
        assert_eq!(
            storage.classified().map(|c| c.kind),
            Some(ErrorKind::Timeout)
        );
    }
}
