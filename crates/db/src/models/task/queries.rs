//! Task query and mutation entry points.

use sqlx::SqlitePool;
use uuid::Uuid;

use super::{CreateTask, MoveTask, TASK_COLUMNS, Task, UpdateTask};
use crate::ordering::{self, Ordered, OrderingError};
use crate::validation::validate_non_empty;

impl Task {
    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Tasks of a column in position order.
    pub async fn find_by_column(
        pool: &SqlitePool,
        column_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        ordering::children::<Task>(pool, column_id).await
    }

    /// Create a task, appended or inserted at `position`.
    pub async fn create(
        pool: &SqlitePool,
        column_id: Uuid,
        data: &CreateTask,
        position: Option<i64>,
    ) -> Result<Self, OrderingError> {
        validate_non_empty(&data.title, "title")?;
        ordering::insert::<Task>(pool, column_id, position, data).await
    }

    /// Update text fields. Never touches ordering.
    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdateTask,
    ) -> Result<Self, OrderingError> {
        if let Some(title) = &data.title {
            validate_non_empty(title, "title")?;
        }
        sqlx::query_as::<_, Task>(&format!(
            "UPDATE tasks
             SET title = COALESCE(?, title),
                 description = COALESCE(?, description),
                 updated_at = datetime('now', 'subsec')
             WHERE id = ?
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(&data.title)
        .bind(&data.description)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(OrderingError::NotFound {
            entity: Task::KIND,
            id,
        })
    }

    pub async fn move_to(
        pool: &SqlitePool,
        id: Uuid,
        request: &MoveTask,
    ) -> Result<Self, OrderingError> {
        ordering::move_item::<Task>(
            pool,
            id,
            request.from_column_id,
            request.to_column_id,
            request.position,
        )
        .await
    }

    /// Apply a full drag-and-drop ordering of a column's tasks.
    pub async fn reorder(
        pool: &SqlitePool,
        column_id: Uuid,
        task_ids: &[Uuid],
    ) -> Result<Vec<Self>, OrderingError> {
        ordering::reorder::<Task>(pool, column_id, task_ids).await
    }

    /// Delete a task and close the gap it leaves.
    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<Self, OrderingError> {
        ordering::remove_leaf::<Task>(pool, id).await
    }
}
