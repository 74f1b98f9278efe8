use std::{
    path::Path,
    str::FromStr,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use sqlx::{
    Error, Executor, Pool, Sqlite,
    sqlite::{
        SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
        SqliteSynchronous,
    },
};
use tracing::{error, info};
use utils::assets::database_path;

pub mod classify;
pub mod degradation;
pub mod metrics;
pub mod models;
pub mod ordering;
pub mod recovery;
pub mod resilience;
pub mod retry;
#[cfg(test)]
pub mod test_utils;
pub mod validation;

pub use classify::{
    ClassificationRule, ClassifiedError, ErrorClassifier, ErrorKind, FailureSignal, StorageFailure,
};
pub use degradation::{DegradationController, DegradationMode};
pub use metrics::{DbMetrics, DbMetricsSnapshot, PoolStats};
pub use ordering::{ChildPolicy, OrderingError, PositionConflict};
pub use recovery::{ConnectionRecoveryMonitor, RecoverableConnection, RecoveryState};
pub use resilience::{PersistenceError, ResilienceConfig, ResilienceContext};
pub use retry::{RetryConfig, delay, should_retry, with_retry, with_retry_until};
pub use validation::ValidationError;

// ============================================================================
// Connection Pool Configuration
// ============================================================================

/// Default maximum connections in the pool.
/// SQLite benefits from limited connections due to single-writer model.
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Minimum idle connections to maintain.
const DEFAULT_MIN_CONNECTIONS: u32 = 2;

/// Connection acquisition timeout in seconds.
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// How long a statement waits on a locked database before SQLITE_BUSY.
const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 5;

/// Idle connection timeout in seconds (10 minutes).
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Get max connections from environment or use default.
fn get_max_connections() -> u32 {
    std::env::var("TASKBOARD_SQLITE_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|&n| n > 0 && n <= 100)
        .unwrap_or(DEFAULT_MAX_CONNECTIONS)
}

/// Apply performance pragmas to a SQLite connection.
/// Runs on every new connection via `after_connect`.
///
/// - `temp_store = MEMORY` (2): temporary tables in memory
/// - `mmap_size`: memory-mapped I/O (64MB dev, 256MB prod)
/// - `synchronous = NORMAL`: must follow `mmap_size`, otherwise mmap'ed
///   writes can bypass fsync and surface SQLITE_IOERR (522) under load
/// - `cache_size = -64000`: 64MB page cache (negative = KB)
async fn apply_performance_pragmas(conn: &mut SqliteConnection) -> Result<(), Error> {
    conn.execute("PRAGMA temp_store = 2").await?;

    #[cfg(debug_assertions)]
    conn.execute("PRAGMA mmap_size = 67108864").await?; // 64MB

    #[cfg(not(debug_assertions))]
    conn.execute("PRAGMA mmap_size = 268435456").await?; // 256MB

    conn.execute("PRAGMA synchronous = NORMAL").await?;
    conn.execute("PRAGMA cache_size = -64000").await?;

    Ok(())
}

fn connect_options(db_path: &Path) -> Result<SqliteConnectOptions, Error> {
    let database_url = format!("sqlite://{}", db_path.to_string_lossy());
    Ok(SqliteConnectOptions::from_str(&database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(DEFAULT_BUSY_TIMEOUT_SECS)))
}

async fn build_pool(options: SqliteConnectOptions, max_connections: u32) -> Result<Pool<Sqlite>, Error> {
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .min_connections(DEFAULT_MIN_CONNECTIONS.min(max_connections))
        .acquire_timeout(Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS))
        .idle_timeout(Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)))
        .after_connect(|conn, _meta| Box::pin(async move { apply_performance_pragmas(conn).await }))
        .connect_with(options)
        .await
}

/// Owner of the SQLite pool.
///
/// The pool is swappable: connection recovery closes it and builds a fresh
/// one. Always fetch it through [`DBService::pool`] inside the operation
/// being retried, never hold a clone across retries.
#[derive(Clone)]
pub struct DBService {
    inner: Arc<DbInner>,
}

struct DbInner {
    pool: RwLock<Pool<Sqlite>>,
    options: SqliteConnectOptions,
    max_connections: u32,
    metrics: DbMetrics,
}

impl DBService {
    /// Open the database at the configured path and apply pending migrations.
    pub async fn new() -> Result<DBService, Error> {
        Self::connect_at(&database_path()).await
    }

    pub async fn connect_at(db_path: &Path) -> Result<DBService, Error> {
        let options = connect_options(db_path)?;
        let max_connections = get_max_connections();

        info!(
            path = %db_path.display(),
            max_connections = max_connections,
            min_connections = DEFAULT_MIN_CONNECTIONS,
            "Initializing SQLite connection pool"
        );

        let pool = build_pool(options.clone(), max_connections).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let db = DBService {
            inner: Arc::new(DbInner {
                pool: RwLock::new(pool),
                options,
                max_connections,
                metrics: DbMetrics::new(),
            }),
        };

        match db.quick_check().await {
            Ok(()) => info!("Database integrity check passed"),
            Err(msg) => error!(error = %msg, "DATABASE CORRUPTION DETECTED"),
        }
        Ok(db)
    }

    /// Current pool. Cheap: clones an `Arc`.
    pub fn pool(&self) -> Pool<Sqlite> {
        match self.inner.pool.read() {
            Ok(pool) => pool.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn swap_pool(&self, pool: Pool<Sqlite>) -> Pool<Sqlite> {
        let mut guard = match self.inner.pool.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, pool)
    }

    pub fn metrics(&self) -> &DbMetrics {
        &self.inner.metrics
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.metrics.get_pool_stats(&self.pool())
    }

    /// Build the resilience context supervising this database.
    pub fn resilience(&self, config: ResilienceConfig) -> ResilienceContext {
        ResilienceContext::new(
            config,
            Arc::new(self.clone()),
            self.inner.metrics.clone(),
        )
    }

    /// Run `PRAGMA quick_check`. Faster than a full integrity check and
    /// catches most corruption.
    pub async fn quick_check(&self) -> Result<(), String> {
        let result: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&self.pool())
            .await
            .map_err(|e| format!("Failed to run integrity check: {e}"))?;
        if result == "ok" {
            Ok(())
        } else {
            Err(format!("Database integrity check failed: {result}"))
        }
    }
}

#[async_trait]
impl RecoverableConnection for DBService {
    async fn close(&self) {
        self.pool().close().await;
    }

    async fn reopen(&self) -> anyhow::Result<()> {
        let pool = build_pool(self.inner.options.clone(), self.inner.max_connections).await?;
        let old = self.swap_pool(pool);
        // Normally already closed; covers a reopen without a preceding close
        old.close().await;
        Ok(())
    }

    async fn probe(&self) -> anyhow::Result<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool())
            .await?;
        anyhow::ensure!(one == 1, "liveness probe returned {one}");
        Ok(())
    }
}
