//! Test utilities for database tests.
//!
//! This module provides helper functions for creating test database pools
//! and seeding boards. It centralizes pool creation so every test gets the
//! same configuration.

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::OnceCell;

use crate::models::{
    board::{Board, CreateBoard},
    column::Column,
    task::{CreateTask, Task},
};

/// Shared template database for faster test setup.
/// The template has migrations already applied.
static TEMPLATE_DIR: OnceLock<TempDir> = OnceLock::new();
static TEMPLATE_READY: OnceCell<()> = OnceCell::const_new();

fn get_template_dir() -> &'static TempDir {
    TEMPLATE_DIR.get_or_init(|| TempDir::new().expect("Failed to create template temp dir"))
}

/// Ensure the template database is ready (migrations applied).
async fn ensure_template_ready() {
    TEMPLATE_READY
        .get_or_init(|| async {
            let template_path = get_template_dir().path().join("template.db");

            let options =
                SqliteConnectOptions::from_str(&format!("sqlite://{}", template_path.display()))
                    .expect("Invalid template database URL")
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal);

            let pool = SqlitePoolOptions::new()
                .min_connections(0)
                .max_connections(1)
                .connect_with(options)
                .await
                .expect("Failed to create template pool");

            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .expect("Failed to run migrations on template");

            // Close the pool to checkpoint and release the file
            pool.close().await;

            tracing::debug!("Template database ready at {:?}", template_path);
        })
        .await;
}

/// Create a test database pool with migrations applied.
///
/// Copies a migrated template database instead of migrating every time.
/// Returns the pool and a TempDir that must be kept alive for the test.
pub async fn create_test_pool() -> (SqlitePool, TempDir) {
    ensure_template_ready().await;

    let temp_dir = TempDir::new().expect("Failed to create test temp dir");
    let db_path = temp_dir.path().join("test.db");

    let template_path = get_template_dir().path().join("template.db");
    std::fs::copy(&template_path, &db_path).expect("Failed to copy template database");

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
        .expect("Invalid test database URL")
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await
        .expect("Failed to create test pool");

    (pool, temp_dir)
}

/// Create a board whose columns hold `tasks_per_column[i]` tasks each.
///
/// Task titles are `"{column}-{n}"` so tests can assert on order.
pub async fn seed_board(pool: &SqlitePool, tasks_per_column: &[usize]) -> (Board, Vec<Column>) {
    let titles = (0..tasks_per_column.len())
        .map(|i| format!("C{i}"))
        .collect();
    let board = Board::create(
        pool,
        &CreateBoard {
            name: "Test Board".to_string(),
            columns: titles,
        },
    )
    .await
    .expect("Failed to create board");

    let columns = Column::find_by_board(pool, board.id)
        .await
        .expect("Failed to list columns");
    for (column, &count) in columns.iter().zip(tasks_per_column) {
        for n in 0..count {
            Task::create(
                pool,
                column.id,
                &CreateTask::titled(format!("{}-{n}", column.title)),
                None,
            )
            .await
            .expect("Failed to create task");
        }
    }

    (board, columns)
}

/// Titles of a column's tasks in position order.
pub async fn task_titles(pool: &SqlitePool, column_id: uuid::Uuid) -> Vec<String> {
    Task::find_by_column(pool, column_id)
        .await
        .expect("Failed to list tasks")
        .into_iter()
        .map(|t| t.title)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_test_pool() {
        let (pool, _temp_dir) = create_test_pool().await;

        let result: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM boards")
            .fetch_one(&pool)
            .await
            .expect("Failed to query boards table");

        assert_eq!(result.0, 0);
    }

    #[tokio::test]
    async fn test_template_reuse() {
        let (pool1, _temp1) = create_test_pool().await;
        let (pool2, _temp2) = create_test_pool().await;

        seed_board(&pool1, &[1]).await;

        let count = |pool: SqlitePool| async move {
            let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM boards")
                .fetch_one(&pool)
                .await
                .expect("Pool should work");
            n
        };
        assert_eq!(count(pool1).await, 1);
        assert_eq!(count(pool2).await, 0);
    }

    #[tokio::test]
    async fn test_seed_board() {
        let (pool, _temp_dir) = create_test_pool().await;
        let (_board, columns) = seed_board(&pool, &[3, 0]).await;

        assert_eq!(columns.len(), 2);
        assert_eq!(
            task_titles(&pool, columns[0].id).await,
            vec!["C0-0", "C0-1", "C0-2"]
        );
        assert!(task_titles(&pool, columns[1].id).await.is_empty());
    }
}
