//! Connection recovery supervision.
//!
//! Per-request retries never tear down the storage connection. This monitor
//! owns that process-wide concern: it closes and reopens the connection and
//! probes liveness, with its own bounded attempt budget independent of
//! request volume.
//!
//! # State machine
//!
//! ```text
//! Idle ──attempt──▶ Recovering ──probe ok──▶ Idle (attempts = 0)
//!                        │
//!                        └──probe failed──▶ Idle, or Exhausted once
//!                                           attempts >= max_attempts
//! Exhausted ──reset()──▶ Idle (attempts = 0)
//! ```
//!
//! `reset()` is safe at any time. Called mid-recovery it aborts the attempt:
//! the in-flight result is discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use strum_macros::Display;
use ts_rs::TS;

use crate::metrics::DbMetrics;

/// Default number of consecutive failed recoveries before giving up.
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 5;

/// A storage connection the monitor can rebuild.
#[async_trait]
pub trait RecoverableConnection: Send + Sync {
    /// Release the current connection(s).
    async fn close(&self);
    /// Establish fresh connection(s).
    async fn reopen(&self) -> anyhow::Result<()>;
    /// Trivial liveness query.
    async fn probe(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecoveryState {
    Idle,
    Recovering,
    Exhausted,
}

impl RecoveryState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RecoveryState::Recovering,
            2 => RecoveryState::Exhausted,
            _ => RecoveryState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RecoveryState::Idle => 0,
            RecoveryState::Recovering => 1,
            RecoveryState::Exhausted => 2,
        }
    }
}

/// Point-in-time view of the recovery session.
#[derive(Debug, Clone, Serialize, TS)]
pub struct RecoveryStatus {
    pub state: RecoveryState,
    pub attempt_count: u32,
    pub max_attempts: u32,
}

/// Largest attempt budget the packed session word can count.
const MAX_ATTEMPT_BUDGET: u32 = 0x00FF_FFFF;

/// State, attempt count and reset epoch of one recovery session.
///
/// Packed into a single word (`epoch:32 | attempts:24 | state:8`) so claiming,
/// finishing and resetting are each one compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Session {
    state: RecoveryState,
    attempts: u32,
    epoch: u32,
}

impl Session {
    fn pack(self) -> u64 {
        (u64::from(self.epoch) << 32)
            | (u64::from(self.attempts & MAX_ATTEMPT_BUDGET) << 8)
            | u64::from(self.state.as_u8())
    }

    fn unpack(word: u64) -> Self {
        Self {
            state: RecoveryState::from_u8((word & 0xFF) as u8),
            attempts: ((word >> 8) as u32) & MAX_ATTEMPT_BUDGET,
            epoch: (word >> 32) as u32,
        }
    }
}

/// Supervises reconnect attempts to the storage backend.
pub struct ConnectionRecoveryMonitor {
    connection: Arc<dyn RecoverableConnection>,
    /// Packed [`Session`]. A reset bumps the epoch, so an attempt claimed
    /// before it can no longer finish.
    session: AtomicU64,
    max_attempts: u32,
    metrics: DbMetrics,
}

impl ConnectionRecoveryMonitor {
    pub fn new(connection: Arc<dyn RecoverableConnection>, max_attempts: u32) -> Self {
        Self::with_metrics(connection, max_attempts, DbMetrics::new())
    }

    pub fn with_metrics(
        connection: Arc<dyn RecoverableConnection>,
        max_attempts: u32,
        metrics: DbMetrics,
    ) -> Self {
        let idle = Session {
            state: RecoveryState::Idle,
            attempts: 0,
            epoch: 0,
        };
        Self {
            connection,
            session: AtomicU64::new(idle.pack()),
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPT_BUDGET),
            metrics,
        }
    }

    fn session(&self) -> Session {
        Session::unpack(self.session.load(Ordering::Acquire))
    }

    pub fn state(&self) -> RecoveryState {
        self.session().state
    }

    pub fn attempt_count(&self) -> u32 {
        self.session().attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// True once the budget is spent and an operator must step in.
    pub fn needs_manual_intervention(&self) -> bool {
        self.state() == RecoveryState::Exhausted
    }

    pub fn status(&self) -> RecoveryStatus {
        let session = self.session();
        RecoveryStatus {
            state: session.state,
            attempt_count: session.attempts,
            max_attempts: self.max_attempts,
        }
    }

    /// Try once to rebuild the storage connection.
    ///
    /// Returns `false` without touching the connection when a recovery is
    /// already in flight or the budget is exhausted.
    pub async fn attempt_recovery(&self) -> bool {
        let Some(claimed) = self.claim() else {
            tracing::debug!(state = %self.state(), "Recovery not started");
            return false;
        };
        let attempt = claimed.attempts;

        tracing::info!(
            attempt = attempt,
            max_attempts = self.max_attempts,
            "Attempting storage connection recovery"
        );

        self.connection.close().await;
        let outcome = match self.connection.reopen().await {
            Ok(()) => self.connection.probe().await,
            Err(e) => Err(e),
        };

        let exhausted = outcome.is_err() && attempt >= self.max_attempts;
        let next = match (&outcome, exhausted) {
            (Ok(()), _) => Session {
                state: RecoveryState::Idle,
                attempts: 0,
                ..claimed
            },
            (Err(_), true) => Session {
                state: RecoveryState::Exhausted,
                ..claimed
            },
            (Err(_), false) => Session {
                state: RecoveryState::Idle,
                ..claimed
            },
        };
        if !self.finish(claimed, next) {
            tracing::info!(attempt = attempt, "Recovery attempt aborted by reset");
            return false;
        }

        self.metrics.record_recovery(outcome.is_ok());

        match outcome {
            Ok(()) => {
                tracing::info!(attempt = attempt, "Storage connection recovered");
                true
            }
            Err(e) if exhausted => {
                self.metrics.record_recovery_exhausted();
                tracing::error!(
                    attempts = attempt,
                    error = %e,
                    "Storage connection recovery exhausted; manual intervention required"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    attempt = attempt,
                    max_attempts = self.max_attempts,
                    error = %e,
                    "Storage connection recovery failed"
                );
                false
            }
        }
    }

    /// `Idle -> Recovering`, counting the attempt. `None` unless idle.
    fn claim(&self) -> Option<Session> {
        let mut current = self.session.load(Ordering::Acquire);
        loop {
            let session = Session::unpack(current);
            if session.state != RecoveryState::Idle {
                return None;
            }
            let claimed = Session {
                state: RecoveryState::Recovering,
                attempts: session.attempts + 1,
                ..session
            };
            match self.session.compare_exchange_weak(
                current,
                claimed.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(claimed),
                Err(actual) => current = actual,
            }
        }
    }

    /// Leave the claimed session for `next`. False when a reset replaced it.
    fn finish(&self, claimed: Session, next: Session) -> bool {
        self.session
            .compare_exchange(
                claimed.pack(),
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Return to `Idle` with a fresh budget. Aborts any in-flight attempt.
    pub fn reset(&self) {
        let _ = self
            .session
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let session = Session::unpack(word);
                Some(
                    Session {
                        state: RecoveryState::Idle,
                        attempts: 0,
                        epoch: session.epoch.wrapping_add(1),
                    }
                    .pack(),
                )
            });
        tracing::info!("Connection recovery session reset");
    }
}
