//! Service-mode degradation.
//!
//! Final storage failures change the service posture instead of only failing
//! one request. Modes are ordered by severity and only escalate on failure:
//!
//! ```text
//! Normal < ReducedFeatures < ReadOnly < CacheOnly
//! ```
//!
//! Returning to `Normal` is always an explicit call to
//! [`DegradationController::restore_normal`].

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use ts_rs::TS;

use crate::classify::{ClassifiedError, ErrorKind};
use crate::metrics::DbMetrics;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS, Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DegradationMode {
    Normal,
    /// Non-essential functionality disabled.
    ReducedFeatures,
    /// Reads only; every write refused.
    ReadOnly,
    /// Stale or cached reads only; every write refused.
    CacheOnly,
}

impl DegradationMode {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DegradationMode::ReducedFeatures,
            2 => DegradationMode::ReadOnly,
            3 => DegradationMode::CacheOnly,
            _ => DegradationMode::Normal,
        }
    }

    fn as_u8(self) -> u8 {
        self as u8
    }

    /// Mode a final failure of `kind` calls for.
    pub fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::ConnectionFailed => DegradationMode::CacheOnly,
            ErrorKind::PermissionDenied => DegradationMode::ReadOnly,
            _ => DegradationMode::ReducedFeatures,
        }
    }

    pub fn allows_writes(self) -> bool {
        matches!(
            self,
            DegradationMode::Normal | DegradationMode::ReducedFeatures
        )
    }

    pub fn allows_non_essential(self) -> bool {
        self == DegradationMode::Normal
    }
}

/// Owns the process-wide [`DegradationMode`].
#[derive(Debug)]
pub struct DegradationController {
    mode: AtomicU8,
    metrics: DbMetrics,
}

impl Default for DegradationController {
    fn default() -> Self {
        Self::new(DbMetrics::new())
    }
}

impl DegradationController {
    pub fn new(metrics: DbMetrics) -> Self {
        Self {
            mode: AtomicU8::new(DegradationMode::Normal.as_u8()),
            metrics,
        }
    }

    pub fn mode(&self) -> DegradationMode {
        DegradationMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub fn allows_writes(&self) -> bool {
        self.mode().allows_writes()
    }

    pub fn allows_non_essential(&self) -> bool {
        self.mode().allows_non_essential()
    }

    /// React to a final, classified failure.
    ///
    /// Returns the mode now in effect. Entering the current mode, or a less
    /// severe one, changes nothing.
    pub fn on_failure(&self, error: &ClassifiedError) -> DegradationMode {
        let wanted = DegradationMode::for_kind(error.kind);
        let result = self
            .mode
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (wanted > DegradationMode::from_u8(current)).then_some(wanted.as_u8())
            });

        match result {
            Ok(previous) => {
                let previous = DegradationMode::from_u8(previous);
                self.metrics.record_mode_transition();
                tracing::warn!(
                    kind = %error.kind,
                    previous_mode = %previous,
                    mode = %wanted,
                    at = %chrono::Utc::now().to_rfc3339(),
                    error = %error,
                    "Service degradation mode changed"
                );
                wanted
            }
            Err(current) => DegradationMode::from_u8(current),
        }
    }

    /// Explicitly return to `Normal`. Returns the mode that was left.
    pub fn restore_normal(&self) -> DegradationMode {
        let previous =
            DegradationMode::from_u8(self.mode.swap(DegradationMode::Normal.as_u8(), Ordering::AcqRel));
        if previous != DegradationMode::Normal {
            self.metrics.record_mode_transition();
            tracing::info!(
                previous_mode = %previous,
                mode = %DegradationMode::Normal,
                at = %chrono::Utc::now().to_rfc3339(),
                "Service restored to normal mode"
            );
        }
        previous
    }
}
