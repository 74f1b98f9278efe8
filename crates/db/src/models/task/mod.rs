//! Task model: a card positioned within a column.
//!
//! Tasks are the leaves of the board hierarchy. Their `position` is dense per
//! column; every method that changes it goes through [`crate::ordering`].

mod queries;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use ts_rs::TS;
use uuid::Uuid;

use crate::ordering::Ordered;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Task {
    pub id: Uuid,
    pub column_id: Uuid, // Foreign key to Column
    pub title: String,
    pub description: Option<String>,
    /// Zero-based rank within the column.
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateTask {
    pub title: String,
    pub description: Option<String>,
}

impl CreateTask {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, TS)]
pub struct UpdateTask {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Drag-and-drop result for a single task.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct MoveTask {
    /// Column the client saw the task in.
    pub from_column_id: Uuid,
    pub to_column_id: Uuid,
    pub position: i64,
}

pub(crate) const TASK_COLUMNS: &str =
    "id, column_id, title, description, position, created_at, updated_at";

#[async_trait]
impl Ordered for Task {
    const TABLE: &'static str = "tasks";
    const COLUMNS: &'static str = TASK_COLUMNS;
    const PARENT_KEY: &'static str = "column_id";
    const PARENT_TABLE: &'static str = "columns";
    const KIND: &'static str = "task";
    const PARENT_KIND: &'static str = "column";

    type Create = CreateTask;

    fn id(&self) -> Uuid {
        self.id
    }

    fn parent_id(&self) -> Uuid {
        self.column_id
    }

    fn position(&self) -> i64 {
        self.position
    }

    async fn insert_row(
        conn: &mut SqliteConnection,
        id: Uuid,
        column_id: Uuid,
        position: i64,
        data: &CreateTask,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "INSERT INTO tasks (id, column_id, title, description, position)
             VALUES (?, ?, ?, ?, ?)
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .bind(column_id)
        .bind(&data.title)
        .bind(&data.description)
        .bind(position)
        .fetch_one(conn)
        .await
    }
}
