use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

use crate::ordering::OrderingError;
use crate::validation::validate_non_empty;

/// Column titles used when a board is created without any.
pub const DEFAULT_COLUMNS: [&str; 3] = ["To Do", "In Progress", "Done"];

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Board {
    pub id: Uuid,
    pub name: String,
    /// Compare-and-swap token for the ordering of this board's columns.
    pub order_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateBoard {
    pub name: String,
    /// Initial column titles, in order. Empty means [`DEFAULT_COLUMNS`].
    #[serde(default)]
    pub columns: Vec<String>,
}

const BOARD_COLUMNS: &str = "id, name, order_version, created_at, updated_at";

impl Board {
    /// Create a board together with its initial columns.
    ///
    /// A board always starts with at least one column.
    pub async fn create(pool: &SqlitePool, data: &CreateBoard) -> Result<Self, OrderingError> {
        validate_non_empty(&data.name, "name")?;
        let titles: Vec<&str> = if data.columns.is_empty() {
            DEFAULT_COLUMNS.to_vec()
        } else {
            data.columns.iter().map(String::as_str).collect()
        };
        for title in &titles {
            validate_non_empty(title, "column title")?;
        }

        let mut tx = pool.begin().await?;
        let board = sqlx::query_as::<_, Board>(&format!(
            "INSERT INTO boards (id, name) VALUES (?, ?) RETURNING {BOARD_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&data.name)
        .fetch_one(&mut *tx)
        .await?;

        for (position, title) in titles.iter().enumerate() {
            sqlx::query("INSERT INTO columns (id, board_id, title, position) VALUES (?, ?, ?, ?)")
                .bind(Uuid::new_v4())
                .bind(board.id)
                .bind(*title)
                .bind(position as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        tracing::debug!(board_id = %board.id, columns = titles.len(), "Created board");
        Ok(board)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Board>(&format!("SELECT {BOARD_COLUMNS} FROM boards WHERE id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Board>(&format!(
            "SELECT {BOARD_COLUMNS} FROM boards ORDER BY created_at, id"
        ))
        .fetch_all(pool)
        .await
    }

    /// Delete a board with its columns and tasks. Returns rows affected.
    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM boards WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
