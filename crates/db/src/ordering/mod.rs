//! Dense sibling ordering.
//!
//! For every parent container the `position` values of its children are
//! exactly `0..n`. Each mutation here preserves that under concurrent writers:
//!
//! 1. Read a snapshot (parent `order_version`, the item, child counts).
//! 2. In one transaction, compare-and-swap every touched parent's
//!    `order_version` against the snapshot. A mismatch is a
//!    [`PositionConflict`]: the caller's view is stale and must be re-read.
//! 3. Shift the affected rows, write the item.
//! 4. Re-check density of each touched parent before commit.
//!
//! Any failure drops the transaction, so no partial shift is ever visible.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, sqlite::SqliteRow};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

use crate::classify::{FailureSignal, StorageFailure};
use crate::validation::ValidationError;

mod density;
mod ops;

pub use density::{DensityReport, check_density, normalize};
pub use ops::{children, insert, move_item, remove_container, remove_leaf, reorder};

/// A row that participates in a sibling ordering.
///
/// Table and key names are interpolated into SQL and must be trusted
/// constants.
#[async_trait]
pub trait Ordered: for<'r> FromRow<'r, SqliteRow> + Send + Sync + Unpin + 'static {
    /// Table holding the ordered rows.
    const TABLE: &'static str;
    /// Comma-separated column list selected for `Self`.
    const COLUMNS: &'static str;
    /// Foreign key column referencing the parent.
    const PARENT_KEY: &'static str;
    /// Parent table; must have an `order_version` column.
    const PARENT_TABLE: &'static str;
    const KIND: &'static str;
    const PARENT_KIND: &'static str;

    /// Payload for a new row.
    type Create: Send + Sync;

    fn id(&self) -> Uuid;
    fn parent_id(&self) -> Uuid;
    fn position(&self) -> i64;

    /// Insert the row at an already-opened slot.
    async fn insert_row(
        conn: &mut SqliteConnection,
        id: Uuid,
        parent_id: Uuid,
        position: i64,
        data: &Self::Create,
    ) -> Result<Self, sqlx::Error>;
}

/// An ordered row that is itself the parent of another ordering
/// (a column holds tasks).
pub trait Container: Ordered {
    /// `Child::PARENT_TABLE` must be `Self::TABLE`.
    type Child: Ordered;
}

/// Why a mutation's precondition no longer held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConflictReason {
    /// Another writer reordered the parent since the snapshot.
    VersionChanged { expected: i64, actual: i64 },
    /// The item no longer lives under the parent the caller named.
    StaleParent { expected: Uuid, actual: Uuid },
    /// A reorder listed ids that are not the parent's children.
    UnknownItems,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::VersionChanged { expected, actual } => {
                write!(f, "order version is {actual}, expected {expected}")
            }
            ConflictReason::StaleParent { expected, actual } => {
                write!(f, "item is under {actual}, not {expected}")
            }
            ConflictReason::UnknownItems => write!(f, "listed items are not the current children"),
        }
    }
}

/// A concurrent modification invalidated the mutation. Re-read and retry at
/// the application level; replaying the same request will conflict again.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("Position conflict under {parent_kind} {parent_id}: {reason}")]
pub struct PositionConflict {
    pub parent_kind: &'static str,
    pub parent_id: Uuid,
    pub reason: ConflictReason,
}

#[derive(Debug, Error)]
pub enum OrderingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Conflict(#[from] PositionConflict),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("Positions are not dense: {0}")]
    NotDense(DensityReport),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StorageFailure for OrderingError {
    fn signal(&self) -> Option<FailureSignal> {
        match self {
            OrderingError::Database(e) => e.signal(),
            _ => None,
        }
    }
}

/// What happens to a container's children when it is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", content = "target", rename_all = "snake_case")]
pub enum ChildPolicy {
    /// Append the children, in order, to this sibling container.
    MoveTo(Uuid),
    Delete,
}

impl ChildPolicy {
    /// Build a policy from a delete request's flag and optional target.
    pub fn from_request(move_children: bool, target: Option<Uuid>) -> Result<Self, ValidationError> {
        match (move_children, target) {
            (true, Some(target)) => Ok(ChildPolicy::MoveTo(target)),
            (true, None) => Err(ValidationError::TargetRequired),
            (false, _) => Ok(ChildPolicy::Delete),
        }
    }
}
