use std::fmt;

use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{Ordered, OrderingError};

/// Position statistics for one parent's children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DensityReport {
    pub parent_kind: &'static str,
    pub parent_id: Uuid,
    pub count: i64,
    pub distinct: i64,
    pub min_position: Option<i64>,
    pub max_position: Option<i64>,
}

impl DensityReport {
    /// True when positions are exactly `0..count`.
    pub fn is_dense(&self) -> bool {
        if self.count == 0 {
            return true;
        }
        self.distinct == self.count
            && self.min_position == Some(0)
            && self.max_position == Some(self.count - 1)
    }

    /// Rows sharing a position with an earlier sibling.
    pub fn duplicates(&self) -> i64 {
        self.count - self.distinct
    }
}

impl fmt::Display for DensityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} has {} children, {} distinct positions",
            self.parent_kind, self.parent_id, self.count, self.distinct
        )?;
        if let (Some(min), Some(max)) = (self.min_position, self.max_position) {
            write!(f, " in [{min}, {max}]")?;
        }
        Ok(())
    }
}

pub(super) async fn density_of<T: Ordered>(
    conn: &mut SqliteConnection,
    parent_id: Uuid,
) -> Result<DensityReport, sqlx::Error> {
    let sql = format!(
        "SELECT COUNT(*), COUNT(DISTINCT position), MIN(position), MAX(position)
         FROM {} WHERE {} = ?",
        T::TABLE,
        T::PARENT_KEY
    );
    let (count, distinct, min_position, max_position): (i64, i64, Option<i64>, Option<i64>) =
        sqlx::query_as(&sql).bind(parent_id).fetch_one(conn).await?;

    Ok(DensityReport {
        parent_kind: T::PARENT_KIND,
        parent_id,
        count,
        distinct,
        min_position,
        max_position,
    })
}

/// Fail with [`OrderingError::NotDense`] unless `parent_id`'s children are dense.
pub(super) async fn ensure_dense<T: Ordered>(
    conn: &mut SqliteConnection,
    parent_id: Uuid,
) -> Result<(), OrderingError> {
    let report = density_of::<T>(conn, parent_id).await?;
    if report.is_dense() {
        Ok(())
    } else {
        tracing::error!(
            parent_kind = T::PARENT_KIND,
            parent_id = %parent_id,
            count = report.count,
            distinct = report.distinct,
            "Mutation would leave positions non-dense, rolling back"
        );
        Err(OrderingError::NotDense(report))
    }
}

/// Report whether `parent_id`'s children are densely positioned.
pub async fn check_density<T: Ordered>(
    pool: &SqlitePool,
    parent_id: Uuid,
) -> Result<DensityReport, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    density_of::<T>(&mut *conn, parent_id).await
}

/// Rewrite `parent_id`'s children to positions `0..n`.
///
/// Existing relative order is kept; ties on `position` are broken by creation
/// time. Bumps the parent's `order_version` so concurrent writers working from
/// the old layout conflict. Returns the number of rows whose position changed.
pub async fn normalize<T: Ordered>(pool: &SqlitePool, parent_id: Uuid) -> Result<u64, OrderingError> {
    let mut tx = pool.begin().await?;

    let bumped = sqlx::query(&format!(
        "UPDATE {} SET order_version = order_version + 1 WHERE id = ?",
        T::PARENT_TABLE
    ))
    .bind(parent_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if bumped == 0 {
        return Err(OrderingError::NotFound {
            entity: T::PARENT_KIND,
            id: parent_id,
        });
    }

    let rows: Vec<(Uuid, i64)> = sqlx::query_as(&format!(
        "SELECT id, position FROM {} WHERE {} = ? ORDER BY position, created_at, id",
        T::TABLE,
        T::PARENT_KEY
    ))
    .bind(parent_id)
    .fetch_all(&mut *tx)
    .await?;

    let update = format!("UPDATE {} SET position = ? WHERE id = ?", T::TABLE);
    let mut changed = 0;
    for (index, (id, position)) in rows.into_iter().enumerate() {
        let index = index as i64;
        if position != index {
            sqlx::query(&update)
                .bind(index)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            changed += 1;
        }
    }

    ensure_dense::<T>(&mut *tx, parent_id).await?;
    tx.commit().await?;

    if changed > 0 {
        tracing::info!(
            parent_kind = T::PARENT_KIND,
            parent_id = %parent_id,
            changed = changed,
            "Normalized sibling positions"
        );
    }
    Ok(changed)
}
