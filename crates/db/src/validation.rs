//! Validation for ordering requests.
//!
//! Pure checks run before any row is touched. A request rejected here never
//! reaches storage, so it is never retried and never degrades the service.

use std::collections::HashSet;

use thiserror::Error;
use uuid::Uuid;

/// Validation errors for position-mutating requests
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Cannot delete the last {kind}")]
    LastSibling { kind: &'static str },

    #[error("target required for move")]
    TargetRequired,

    #[error("Cannot move children of {kind} {id} into itself")]
    TargetIsSelf { kind: &'static str, id: Uuid },

    #[error("Target {kind} {target} does not share a parent with {id}")]
    TargetOutsideParent {
        kind: &'static str,
        id: Uuid,
        target: Uuid,
    },

    #[error("Reorder must list every item exactly once: expected {expected}, got {actual}")]
    PermutationLength { expected: usize, actual: usize },

    #[error("Reorder lists {0} more than once")]
    DuplicateInPermutation(Uuid),

    #[error("{field} must not be empty")]
    Empty { field: &'static str },
}

/// Validate that `ids` could be a permutation of `expected_len` children.
///
/// Membership is not checked here: ids unknown to the parent mean the
/// caller's view is stale, which is a conflict rather than a bad request.
///
/// # Examples
/// ```
/// use db::validation::{ValidationError, validate_permutation};
/// use uuid::Uuid;
///
/// let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
/// assert!(validate_permutation(&[a, b], 2).is_ok());
/// assert_eq!(
///     validate_permutation(&[a, a], 2),
///     Err(ValidationError::DuplicateInPermutation(a))
/// );
/// ```
pub fn validate_permutation(ids: &[Uuid], expected_len: usize) -> Result<(), ValidationError> {
    if ids.len() != expected_len {
        return Err(ValidationError::PermutationLength {
            expected: expected_len,
            actual: ids.len(),
        });
    }

    let mut seen = HashSet::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(*id) {
            return Err(ValidationError::DuplicateInPermutation(*id));
        }
    }
    Ok(())
}

/// Validate that removing one of `sibling_count` siblings leaves at least one.
pub fn validate_not_last(sibling_count: usize, kind: &'static str) -> Result<(), ValidationError> {
    if sibling_count <= 1 {
        Err(ValidationError::LastSibling { kind })
    } else {
        Ok(())
    }
}

/// Validate a required, human-entered text field.
pub fn validate_non_empty(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::Empty { field })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permutation_length_mismatch() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        assert_eq!(
            validate_permutation(&ids, 3),
            Err(ValidationError::PermutationLength {
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_permutation_duplicate() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(
            validate_permutation(&[a, b, a], 3),
            Err(ValidationError::DuplicateInPermutation(a))
        );
    }

    #[test]
    fn test_empty_permutation_of_empty_parent() {
        assert!(validate_permutation(&[], 0).is_ok());
    }

    #[test]
    fn test_last_sibling() {
        assert_eq!(
            validate_not_last(1, "column"),
            Err(ValidationError::LastSibling { kind: "column" })
        );
        assert!(validate_not_last(2, "column").is_ok());
    }

    #[test]
    fn test_non_empty() {
        assert!(validate_non_empty("Backlog", "title").is_ok());
        assert_eq!(
            validate_non_empty("   ", "title"),
            Err(ValidationError::Empty { field: "title" })
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            ValidationError::TargetRequired.to_string(),
            "target required for move"
        );
        assert_eq!(
            ValidationError::LastSibling { kind: "column" }.to_string(),
            "Cannot delete the last column"
        );
    }
}
