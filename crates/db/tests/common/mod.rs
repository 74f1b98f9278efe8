//! Shared setup for integration tests.

#![allow(dead_code)]

use db::{
    DBService,
    models::{
        board::{Board, CreateBoard},
        column::Column,
        task::{CreateTask, Task},
    },
    ordering,
};
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

/// Open a fresh migrated database in a temp dir.
pub async fn setup_db() -> (DBService, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = DBService::connect_at(&temp_dir.path().join("test.db"))
        .await
        .expect("Failed to open database");
    (db, temp_dir)
}

pub async fn setup_test_pool() -> (SqlitePool, TempDir) {
    let (db, temp_dir) = setup_db().await;
    (db.pool(), temp_dir)
}

/// Create a board whose columns hold `tasks_per_column[i]` tasks each.
/// Columns are titled `C{i}` and tasks `C{i}-{n}`.
pub async fn seed_board(pool: &SqlitePool, tasks_per_column: &[usize]) -> (Board, Vec<Column>) {
    let board = Board::create(
        pool,
        &CreateBoard {
            name: "Board".to_string(),
            columns: (0..tasks_per_column.len()).map(|i| format!("C{i}")).collect(),
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

pub async fn tasks(pool: &SqlitePool, column_id: Uuid) -> Vec<Task> {
    Task::find_by_column(pool, column_id)
        .await
        .expect("Failed to list tasks")
}

pub async fn titles(pool: &SqlitePool, column_id: Uuid) -> Vec<String> {
    tasks(pool, column_id)
        .await
        .into_iter()
        .map(|t| t.title)
        .collect()
}

pub async fn positions(pool: &SqlitePool, column_id: Uuid) -> Vec<i64> {
    tasks(pool, column_id)
        .await
        .into_iter()
        .map(|t| t.position)
        .collect()
}

pub async fn column_titles(pool: &SqlitePool, board_id: Uuid) -> Vec<String> {
    Column::find_by_board(pool, board_id)
        .await
        .expect("Failed to list columns")
        .into_iter()
        .map(|c| c.title)
        .collect()
}

/// Assert the board's columns and every column's tasks are dense.
pub async fn assert_board_dense(pool: &SqlitePool, board_id: Uuid) {
    let report = ordering::check_density::<Column>(pool, board_id)
        .await
        .expect("Failed to check columns");
    assert!(report.is_dense(), "columns not dense: {report}");

    for column in Column::find_by_board(pool, board_id)
        .await
        .expect("Failed to list columns")
    {
        let report = ordering::check_density::<Task>(pool, column.id)
            .await
            .expect("Failed to check tasks");
        assert!(report.is_dense(), "tasks not dense: {report}");
    }
}
