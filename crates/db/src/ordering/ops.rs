use std::collections::HashSet;

use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::density::ensure_dense;
use super::{ChildPolicy, ConflictReason, Container, Ordered, OrderingError, PositionConflict};
use crate::validation::{ValidationError, validate_not_last, validate_permutation};

// ============================================================================
// Snapshot reads
// ============================================================================

async fn find<T: Ordered>(conn: &mut SqliteConnection, id: Uuid) -> Result<T, OrderingError> {
    let sql = format!("SELECT {} FROM {} WHERE id = ?", T::COLUMNS, T::TABLE);
    sqlx::query_as::<_, T>(&sql)
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(OrderingError::NotFound {
            entity: T::KIND,
            id,
        })
}

/// Item together with its parent's `order_version`, read in one statement.
///
/// Reading them separately lets a writer commit in between, pairing a stale
/// row with a fresh version that the claim would then accept.
async fn find_with_version<T: Ordered>(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<(T, i64), OrderingError> {
    let sql = format!(
        "SELECT {columns},
                (SELECT order_version FROM {parent} WHERE id = {table}.{key}) AS parent_order_version
         FROM {table} WHERE id = ?",
        columns = T::COLUMNS,
        parent = T::PARENT_TABLE,
        table = T::TABLE,
        key = T::PARENT_KEY,
    );
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(OrderingError::NotFound {
            entity: T::KIND,
            id,
        })?;
    let item = T::from_row(&row)?;
    let version: Option<i64> = row.try_get("parent_order_version")?;
    let version = version.ok_or(OrderingError::NotFound {
        entity: T::PARENT_KIND,
        id: item.parent_id(),
    })?;
    Ok((item, version))
}

/// `order_version` of the parent owning `T`'s ordering.
async fn parent_version<T: Ordered>(
    conn: &mut SqliteConnection,
    parent_id: Uuid,
) -> Result<i64, OrderingError> {
    let sql = format!("SELECT order_version FROM {} WHERE id = ?", T::PARENT_TABLE);
    sqlx::query_scalar::<_, i64>(&sql)
        .bind(parent_id)
        .fetch_optional(conn)
        .await?
        .ok_or(OrderingError::NotFound {
            entity: T::PARENT_KIND,
            id: parent_id,
        })
}

async fn child_count<T: Ordered>(
    conn: &mut SqliteConnection,
    parent_id: Uuid,
) -> Result<i64, sqlx::Error> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE {} = ?", T::TABLE, T::PARENT_KEY);
    sqlx::query_scalar::<_, i64>(&sql)
        .bind(parent_id)
        .fetch_one(conn)
        .await
}

async fn child_ids<T: Ordered>(
    conn: &mut SqliteConnection,
    parent_id: Uuid,
) -> Result<Vec<Uuid>, sqlx::Error> {
    let sql = format!(
        "SELECT id FROM {} WHERE {} = ? ORDER BY position",
        T::TABLE,
        T::PARENT_KEY
    );
    sqlx::query_scalar::<_, Uuid>(&sql)
        .bind(parent_id)
        .fetch_all(conn)
        .await
}

async fn list<T: Ordered>(
    conn: &mut SqliteConnection,
    parent_id: Uuid,
) -> Result<Vec<T>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ? ORDER BY position",
        T::COLUMNS,
        T::TABLE,
        T::PARENT_KEY
    );
    sqlx::query_as::<_, T>(&sql)
        .bind(parent_id)
        .fetch_all(conn)
        .await
}

/// Children of `parent_id` in position order.
pub async fn children<T: Ordered>(pool: &SqlitePool, parent_id: Uuid) -> Result<Vec<T>, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    list::<T>(&mut *conn, parent_id).await
}

// ============================================================================
// Transaction steps
// ============================================================================

/// Compare-and-swap the parent's `order_version`. Must be the first write of
/// the transaction so the write lock is taken before any shift.
async fn claim<T: Ordered>(
    conn: &mut SqliteConnection,
    parent_id: Uuid,
    expected: i64,
) -> Result<(), OrderingError> {
    let sql = format!(
        "UPDATE {} SET order_version = order_version + 1, updated_at = datetime('now', 'subsec')
         WHERE id = ? AND order_version = ?",
        T::PARENT_TABLE
    );
    let claimed = sqlx::query(&sql)
        .bind(parent_id)
        .bind(expected)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if claimed == 1 {
        return Ok(());
    }

    let actual = parent_version::<T>(conn, parent_id).await?;
    tracing::debug!(
        parent_kind = T::PARENT_KIND,
        parent_id = %parent_id,
        expected_version = expected,
        actual_version = actual,
        "Order version changed since snapshot"
    );
    Err(PositionConflict {
        parent_kind: T::PARENT_KIND,
        parent_id,
        reason: ConflictReason::VersionChanged { expected, actual },
    }
    .into())
}

/// Shift `position >= from` up by one.
async fn open_slot<T: Ordered>(
    conn: &mut SqliteConnection,
    parent_id: Uuid,
    from: i64,
) -> Result<(), sqlx::Error> {
    let sql = format!(
        "UPDATE {} SET position = position + 1 WHERE {} = ? AND position >= ?",
        T::TABLE,
        T::PARENT_KEY
    );
    sqlx::query(&sql)
        .bind(parent_id)
        .bind(from)
        .execute(conn)
        .await?;
    Ok(())
}

/// Shift `position > vacated` down by one.
async fn close_gap<T: Ordered>(
    conn: &mut SqliteConnection,
    parent_id: Uuid,
    vacated: i64,
) -> Result<(), sqlx::Error> {
    let sql = format!(
        "UPDATE {} SET position = position - 1 WHERE {} = ? AND position > ?",
        T::TABLE,
        T::PARENT_KEY
    );
    sqlx::query(&sql)
        .bind(parent_id)
        .bind(vacated)
        .execute(conn)
        .await?;
    Ok(())
}

async fn place<T: Ordered>(
    conn: &mut SqliteConnection,
    id: Uuid,
    parent_id: Uuid,
    position: i64,
) -> Result<(), sqlx::Error> {
    let sql = format!(
        "UPDATE {} SET {} = ?, position = ?, updated_at = datetime('now', 'subsec') WHERE id = ?",
        T::TABLE,
        T::PARENT_KEY
    );
    sqlx::query(&sql)
        .bind(parent_id)
        .bind(position)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

// ============================================================================
// Operations
// ============================================================================

/// Insert a new child under `parent_id`.
///
/// Appends when `at` is `None`; otherwise `at` is clamped into
/// `[0, count]` and every sibling at or after it shifts up.
pub async fn insert<T: Ordered>(
    pool: &SqlitePool,
    parent_id: Uuid,
    at: Option<i64>,
    data: &T::Create,
) -> Result<T, OrderingError> {
    let (version, count) = {
        let mut conn = pool.acquire().await?;
        let version = parent_version::<T>(&mut conn, parent_id).await?;
        (version, child_count::<T>(&mut conn, parent_id).await?)
    };
    let position = at.map_or(count, |at| at.clamp(0, count));

    let mut tx = pool.begin().await?;
    claim::<T>(&mut tx, parent_id, version).await?;
    open_slot::<T>(&mut tx, parent_id, position).await?;
    let item = T::insert_row(&mut tx, Uuid::new_v4(), parent_id, position, data).await?;
    ensure_dense::<T>(&mut tx, parent_id).await?;
    tx.commit().await?;

    tracing::debug!(
        kind = T::KIND,
        id = %item.id(),
        parent_id = %parent_id,
        position = position,
        "Inserted ordered item"
    );
    Ok(item)
}

/// Move an item to `new_position` under `to`, atomically.
///
/// `from` is the parent the caller believes owns the item; if it does not,
/// the caller's view is stale and a conflict is returned. Within one parent
/// `new_position` is clamped into `[0, n-1]`; across parents into
/// `[0, count(to)]`.
pub async fn move_item<T: Ordered>(
    pool: &SqlitePool,
    id: Uuid,
    from: Uuid,
    to: Uuid,
    new_position: i64,
) -> Result<T, OrderingError> {
    let mut conn = pool.acquire().await?;
    let (item, from_version) = find_with_version::<T>(&mut conn, id).await?;
    if item.parent_id() != from {
        tracing::debug!(
            kind = T::KIND,
            id = %id,
            expected_parent = %from,
            actual_parent = %item.parent_id(),
            "Move named a stale source parent"
        );
        return Err(PositionConflict {
            parent_kind: T::PARENT_KIND,
            parent_id: from,
            reason: ConflictReason::StaleParent {
                expected: from,
                actual: item.parent_id(),
            },
        }
        .into());
    }
    let old = item.position();

    if from == to {
        let count = child_count::<T>(&mut conn, from).await?;
        drop(conn);
        let target = new_position.clamp(0, (count - 1).max(0));
        if target == old {
            return Ok(item);
        }

        let mut tx = pool.begin().await?;
        claim::<T>(&mut tx, from, from_version).await?;
        let (sql, lo, hi) = if target < old {
            ("position + 1", target, old - 1)
        } else {
            ("position - 1", old + 1, target)
        };
        let shift = format!(
            "UPDATE {} SET position = {sql} WHERE {} = ? AND position BETWEEN ? AND ?",
            T::TABLE,
            T::PARENT_KEY
        );
        sqlx::query(&shift)
            .bind(from)
            .bind(lo)
            .bind(hi)
            .execute(&mut *tx)
            .await?;
        place::<T>(&mut tx, id, from, target).await?;
        ensure_dense::<T>(&mut tx, from).await?;
        let moved = find::<T>(&mut tx, id).await?;
        tx.commit().await?;

        tracing::debug!(kind = T::KIND, id = %id, from = old, to = target, "Moved item within parent");
        return Ok(moved);
    }

    let to_version = parent_version::<T>(&mut conn, to).await?;
    let to_count = child_count::<T>(&mut conn, to).await?;
    drop(conn);
    let target = new_position.clamp(0, to_count);

    let mut tx = pool.begin().await?;
    claim::<T>(&mut tx, from, from_version).await?;
    claim::<T>(&mut tx, to, to_version).await?;
    close_gap::<T>(&mut tx, from, old).await?;
    open_slot::<T>(&mut tx, to, target).await?;
    place::<T>(&mut tx, id, to, target).await?;
    ensure_dense::<T>(&mut tx, from).await?;
    ensure_dense::<T>(&mut tx, to).await?;
    let moved = find::<T>(&mut tx, id).await?;
    tx.commit().await?;

    tracing::debug!(
        kind = T::KIND,
        id = %id,
        from_parent = %from,
        to_parent = %to,
        position = target,
        "Moved item across parents"
    );
    Ok(moved)
}

/// Remove an item that has no ordered children of its own, closing the gap.
pub async fn remove_leaf<T: Ordered>(pool: &SqlitePool, id: Uuid) -> Result<T, OrderingError> {
    let (item, version) = {
        let mut conn = pool.acquire().await?;
        find_with_version::<T>(&mut conn, id).await?
    };
    let parent_id = item.parent_id();

    let mut tx = pool.begin().await?;
    claim::<T>(&mut tx, parent_id, version).await?;
    sqlx::query(&format!("DELETE FROM {} WHERE id = ?", T::TABLE))
        .bind(id)
        .execute(&mut *tx)
        .await?;
    close_gap::<T>(&mut tx, parent_id, item.position()).await?;
    ensure_dense::<T>(&mut tx, parent_id).await?;
    tx.commit().await?;

    tracing::debug!(kind = T::KIND, id = %id, parent_id = %parent_id, "Removed ordered item");
    Ok(item)
}

/// Remove a container, first moving or deleting its children per `policy`.
///
/// The last container under its parent is never removed. Every check runs
/// before any write.
pub async fn remove_container<T: Container>(
    pool: &SqlitePool,
    id: Uuid,
    policy: ChildPolicy,
) -> Result<T, OrderingError> {
    let mut conn = pool.acquire().await?;
    // Versions first: every later read is at least as fresh as the claims
    let (item, version) = find_with_version::<T>(&mut conn, id).await?;
    let parent_id = item.parent_id();
    let children_version = parent_version::<T::Child>(&mut conn, id).await?;
    let siblings = child_count::<T>(&mut conn, parent_id).await?;
    validate_not_last(siblings as usize, T::KIND)?;

    let destination = match policy {
        ChildPolicy::Delete => None,
        ChildPolicy::MoveTo(target) if target == id => {
            return Err(ValidationError::TargetIsSelf { kind: T::KIND, id }.into());
        }
        ChildPolicy::MoveTo(target) => {
            let target_row = find::<T>(&mut conn, target).await?;
            if target_row.parent_id() != parent_id {
                return Err(ValidationError::TargetOutsideParent {
                    kind: T::KIND,
                    id,
                    target,
                }
                .into());
            }
            let target_version = parent_version::<T::Child>(&mut conn, target).await?;
            let target_count = child_count::<T::Child>(&mut conn, target).await?;
            Some((target, target_version, target_count))
        }
    };
    drop(conn);

    let child = <T::Child as Ordered>::TABLE;
    let child_key = <T::Child as Ordered>::PARENT_KEY;

    let mut tx = pool.begin().await?;
    claim::<T>(&mut tx, parent_id, version).await?;
    claim::<T::Child>(&mut tx, id, children_version).await?;

    let reassigned = match destination {
        Some((target, target_version, target_count)) => {
            claim::<T::Child>(&mut tx, target, target_version).await?;
            // Append in existing order after the target's children
            let moved = sqlx::query(&format!(
                "UPDATE {child} SET {child_key} = ?, position = position + ?,
                     updated_at = datetime('now', 'subsec')
                 WHERE {child_key} = ?"
            ))
            .bind(target)
            .bind(target_count)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            ensure_dense::<T::Child>(&mut tx, target).await?;
            moved
        }
        None => {
            sqlx::query(&format!("DELETE FROM {child} WHERE {child_key} = ?"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
            0
        }
    };

    sqlx::query(&format!("DELETE FROM {} WHERE id = ?", T::TABLE))
        .bind(id)
        .execute(&mut *tx)
        .await?;
    close_gap::<T>(&mut tx, parent_id, item.position()).await?;
    ensure_dense::<T>(&mut tx, parent_id).await?;
    tx.commit().await?;

    tracing::debug!(
        kind = T::KIND,
        id = %id,
        parent_id = %parent_id,
        policy = ?policy,
        reassigned = reassigned,
        "Removed container"
    );
    Ok(item)
}

/// Rewrite positions of `parent_id`'s children to match `ids` exactly.
///
/// `ids` must list every current child once. Ids that are not current
/// children (with the right length) mean the caller's view is stale.
pub async fn reorder<T: Ordered>(
    pool: &SqlitePool,
    parent_id: Uuid,
    ids: &[Uuid],
) -> Result<Vec<T>, OrderingError> {
    let (version, current) = {
        let mut conn = pool.acquire().await?;
        let version = parent_version::<T>(&mut conn, parent_id).await?;
        (version, child_ids::<T>(&mut conn, parent_id).await?)
    };
    validate_permutation(ids, current.len())?;

    let current: HashSet<Uuid> = current.into_iter().collect();
    let stale = || PositionConflict {
        parent_kind: T::PARENT_KIND,
        parent_id,
        reason: ConflictReason::UnknownItems,
    };
    if ids.iter().any(|id| !current.contains(id)) {
        return Err(stale().into());
    }

    let mut tx = pool.begin().await?;
    claim::<T>(&mut tx, parent_id, version).await?;
    let update = format!(
        "UPDATE {} SET position = ? WHERE id = ? AND {} = ?",
        T::TABLE,
        T::PARENT_KEY
    );
    for (index, id) in ids.iter().enumerate() {
        let updated = sqlx::query(&update)
            .bind(index as i64)
            .bind(*id)
            .bind(parent_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated != 1 {
            return Err(stale().into());
        }
    }
    ensure_dense::<T>(&mut tx, parent_id).await?;
    let reordered = list::<T>(&mut tx, parent_id).await?;
    tx.commit().await?;

    tracing::debug!(
        kind = T::KIND,
        parent_id = %parent_id,
        count = ids.len(),
        "Reordered children"
    );
    Ok(reordered)
}
