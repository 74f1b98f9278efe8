//! Board, column and task rows.
//!
//! Columns are ordered within a board and tasks within a column. Position
//! changes for both go through [`crate::ordering`].

pub mod board;
pub mod column;
pub mod task;
