use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

use super::task::Task;
use crate::ordering::{self, ChildPolicy, Container, Ordered, OrderingError};
use crate::validation::{ValidationError, validate_non_empty};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Column {
    pub id: Uuid,
    pub board_id: Uuid, // Foreign key to Board
    pub title: String,
    /// Zero-based rank within the board.
    pub position: i64,
    /// Compare-and-swap token for the ordering of this column's tasks.
    pub order_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateColumn {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct MoveColumn {
    pub from_board_id: Uuid,
    pub to_board_id: Uuid,
    pub position: i64,
}

/// Delete request as submitted by a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
pub struct DeleteColumn {
    /// Move the column's tasks instead of deleting them.
    #[serde(default)]
    pub move_tasks: bool,
    pub target_column_id: Option<Uuid>,
}

impl DeleteColumn {
    pub fn policy(&self) -> Result<ChildPolicy, ValidationError> {
        ChildPolicy::from_request(self.move_tasks, self.target_column_id)
    }
}

const COLUMN_COLUMNS: &str =
    "id, board_id, title, position, order_version, created_at, updated_at";

#[async_trait]
impl Ordered for Column {
    const TABLE: &'static str = "columns";
    const COLUMNS: &'static str = COLUMN_COLUMNS;
    const PARENT_KEY: &'static str = "board_id";
    const PARENT_TABLE: &'static str = "boards";
    const KIND: &'static str = "column";
    const PARENT_KIND: &'static str = "board";

    type Create = CreateColumn;

    fn id(&self) -> Uuid {
        self.id
    }

    fn parent_id(&self) -> Uuid {
        self.board_id
    }

    fn position(&self) -> i64 {
        self.position
    }

    async fn insert_row(
        conn: &mut SqliteConnection,
        id: Uuid,
        board_id: Uuid,
        position: i64,
        data: &CreateColumn,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Column>(&format!(
            "INSERT INTO columns (id, board_id, title, position)
             VALUES (?, ?, ?, ?)
             RETURNING {COLUMN_COLUMNS}"
        ))
        .bind(id)
        .bind(board_id)
        .bind(&data.title)
        .bind(position)
        .fetch_one(conn)
        .await
    }
}

impl Container for Column {
    type Child = Task;
}

impl Column {
    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Column>(&format!(
            "SELECT {COLUMN_COLUMNS} FROM columns WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Columns of a board in position order.
    pub async fn find_by_board(
        pool: &SqlitePool,
        board_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        ordering::children::<Column>(pool, board_id).await
    }

    pub async fn create(
        pool: &SqlitePool,
        board_id: Uuid,
        data: &CreateColumn,
        position: Option<i64>,
    ) -> Result<Self, OrderingError> {
        validate_non_empty(&data.title, "title")?;
        ordering::insert::<Column>(pool, board_id, position, data).await
    }

    pub async fn rename(pool: &SqlitePool, id: Uuid, title: &str) -> Result<Self, OrderingError> {
        validate_non_empty(title, "title")?;
        sqlx::query_as::<_, Column>(&format!(
            "UPDATE columns SET title = ?, updated_at = datetime('now', 'subsec')
             WHERE id = ?
             RETURNING {COLUMN_COLUMNS}"
        ))
        .bind(title)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(OrderingError::NotFound {
            entity: Column::KIND,
            id,
        })
    }

    pub async fn move_to(
        pool: &SqlitePool,
        id: Uuid,
        request: &MoveColumn,
    ) -> Result<Self, OrderingError> {
        ordering::move_item::<Column>(
            pool,
            id,
            request.from_board_id,
            request.to_board_id,
            request.position,
        )
        .await
    }

    pub async fn reorder(
        pool: &SqlitePool,
        board_id: Uuid,
        column_ids: &[Uuid],
    ) -> Result<Vec<Self>, OrderingError> {
        ordering::reorder::<Column>(pool, board_id, column_ids).await
    }

    /// Delete a column. Refused for the board's last column.
    pub async fn delete(
        pool: &SqlitePool,
        id: Uuid,
        policy: ChildPolicy,
    ) -> Result<Self, OrderingError> {
        ordering::remove_container::<Column>(pool, id, policy).await
    }
}
