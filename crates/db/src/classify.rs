//! Storage failure classification.
//!
//! Maps opaque storage-layer failures onto a closed taxonomy ([`ErrorKind`])
//! with a retryability verdict. Classification is total: every input yields a
//! [`ClassifiedError`], unrecognised failures become [`ErrorKind::Unknown`].
//!
//! # Rule table
//!
//! The classifier is driven by a pluggable table of [`ClassificationRule`]s.
//! Rules matching a structured failure code are consulted first; message
//! substring rules are only a fallback for failures without a usable code.
//! When the rules of one tier disagree about the kind, the verdict is
//! `Unknown` rather than a guess.
//!
//! [`ErrorClassifier::sqlite`] ships the table for SQLite result codes (as
//! reported by sqlx, including extended codes) and the driver-level signals
//! produced by [`StorageFailure`] implementations in this crate.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use ts_rs::TS;

/// Closed taxonomy of storage failure kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ConnectionFailed,
    Timeout,
    ConstraintViolation,
    NotFound,
    PermissionDenied,
    TransactionFailed,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::ConnectionFailed,
        ErrorKind::Timeout,
        ErrorKind::ConstraintViolation,
        ErrorKind::NotFound,
        ErrorKind::PermissionDenied,
        ErrorKind::TransactionFailed,
        ErrorKind::Unknown,
    ];

    /// Whether failures of this kind are transient.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::ConnectionFailed | ErrorKind::Timeout)
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// The raw evidence extracted from a storage failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureSignal {
    /// Structured code reported by the driver, if any.
    pub code: Option<String>,
    pub message: String,
}

impl FailureSignal {
    pub fn coded(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

/// Errors that may carry a storage-layer failure.
///
/// `None` marks a domain outcome (validation failure, position conflict,
/// missing entity) which must bypass retries and degradation entirely.
pub trait StorageFailure {
    fn signal(&self) -> Option<FailureSignal>;
}

impl StorageFailure for sqlx::Error {
    fn signal(&self) -> Option<FailureSignal> {
        use sqlx::Error;

        let signal = match self {
            Error::Database(db_err) => match db_err.code() {
                Some(code) => FailureSignal::coded(code.as_ref(), db_err.message()),
                None => FailureSignal::message(db_err.message()),
            },
            Error::Io(io_err) => return io_err.signal(),
            Error::PoolTimedOut => FailureSignal::coded("POOL_TIMED_OUT", self.to_string()),
            Error::PoolClosed => FailureSignal::coded("POOL_CLOSED", self.to_string()),
            Error::RowNotFound => FailureSignal::coded("ROW_NOT_FOUND", self.to_string()),
            Error::Tls(_) => FailureSignal::coded("TLS", self.to_string()),
            other => FailureSignal::message(other.to_string()),
        };
        Some(signal)
    }
}

impl StorageFailure for std::io::Error {
    fn signal(&self) -> Option<FailureSignal> {
        use std::io::ErrorKind as Io;

        let code = match self.kind() {
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::AddrNotAvailable => Some("IO_CONNECTION"),
            Io::TimedOut => Some("IO_TIMED_OUT"),
            Io::PermissionDenied => Some("IO_PERMISSION_DENIED"),
            Io::NotFound => Some("IO_NOT_FOUND"),
            _ => None,
        };
        Some(match code {
            Some(code) => FailureSignal::coded(code, self.to_string()),
            None => FailureSignal::message(self.to_string()),
        })
    }
}

/// What a rule inspects.
#[derive(Clone)]
pub enum Matcher {
    /// Exact structured code.
    Code(Cow<'static, str>),
    /// Structured code accepted by a predicate (e.g. an extended-code family).
    CodeWhere(fn(&str) -> bool),
    /// Case-insensitive substring of the message.
    MessageContains(Cow<'static, str>),
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Code(code) => write!(f, "Code({code})"),
            Matcher::CodeWhere(_) => write!(f, "CodeWhere(..)"),
            Matcher::MessageContains(fragment) => write!(f, "MessageContains({fragment})"),
        }
    }
}

/// One entry of the classification table.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub matcher: Matcher,
    pub kind: ErrorKind,
}

impl ClassificationRule {
    pub fn code(code: impl Into<Cow<'static, str>>, kind: ErrorKind) -> Self {
        Self {
            matcher: Matcher::Code(code.into()),
            kind,
        }
    }

    pub fn code_where(predicate: fn(&str) -> bool, kind: ErrorKind) -> Self {
        Self {
            matcher: Matcher::CodeWhere(predicate),
            kind,
        }
    }

    pub fn message(fragment: impl Into<Cow<'static, str>>, kind: ErrorKind) -> Self {
        let fragment: Cow<'static, str> = fragment.into();
        Self {
            matcher: Matcher::MessageContains(Cow::Owned(fragment.to_lowercase())),
            kind,
        }
    }

    fn is_code_rule(&self) -> bool {
        !matches!(self.matcher, Matcher::MessageContains(_))
    }

    fn matches_code(&self, code: &str) -> bool {
        match &self.matcher {
            Matcher::Code(expected) => expected.as_ref() == code,
            Matcher::CodeWhere(predicate) => predicate(code),
            Matcher::MessageContains(_) => false,
        }
    }

    fn matches_message(&self, lowered: &str) -> bool {
        match &self.matcher {
            Matcher::MessageContains(fragment) => lowered.contains(fragment.as_ref()),
            _ => false,
        }
    }
}

/// Which part of the signal decided the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum MatchTier {
    Code,
    Message,
    Ambiguous,
    Unmatched,
}

/// A failure mapped into the taxonomy.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    /// Diagnostic key/value pairs (code, match tier, operation, ...).
    pub context: BTreeMap<String, String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
            context: BTreeMap::new(),
            source: None,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach the original failure. Kept for logging only, never re-parsed.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.context.get("code").map(String::as_str)
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ClassifiedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Table-driven classifier.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::sqlite()
    }
}

/// Primary SQLite result code of a (possibly extended) numeric code string.
fn sqlite_primary(code: &str) -> Option<u32> {
    code.parse::<u32>().ok().map(|c| c & 0xFF)
}

fn sqlite_busy_or_locked(code: &str) -> bool {
    // SQLITE_BUSY (5), SQLITE_LOCKED (6): the lock wait outlived busy_timeout
    matches!(sqlite_primary(code), Some(5 | 6))
}

fn sqlite_io_or_cantopen(code: &str) -> bool {
    // SQLITE_IOERR (10) and its extended codes, SQLITE_CANTOPEN (14)
    matches!(sqlite_primary(code), Some(10 | 14))
}

fn sqlite_constraint(code: &str) -> bool {
    // SQLITE_CONSTRAINT (19): 2067 UNIQUE, 1555 PRIMARYKEY, 787 FOREIGNKEY, ...
    sqlite_primary(code) == Some(19)
}

fn sqlite_denied(code: &str) -> bool {
    // SQLITE_PERM (3), SQLITE_READONLY (8), SQLITE_AUTH (23)
    matches!(sqlite_primary(code), Some(3 | 8 | 23))
}

fn sqlite_abort(code: &str) -> bool {
    // SQLITE_ABORT (4), including SQLITE_ABORT_ROLLBACK (516)
    sqlite_primary(code) == Some(4)
}

impl ErrorClassifier {
    /// Build a classifier from an explicit rule table.
    pub fn with_rules(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    /// Message heuristics shared by every driver table.
    pub fn message_rules() -> Vec<ClassificationRule> {
        use ErrorKind::*;
        vec![
            ClassificationRule::message("connection refused", ConnectionFailed),
            ClassificationRule::message("connection reset", ConnectionFailed),
            ClassificationRule::message("connection closed", ConnectionFailed),
            ClassificationRule::message("broken pipe", ConnectionFailed),
            ClassificationRule::message("unable to open database", ConnectionFailed),
            ClassificationRule::message("unreachable", ConnectionFailed),
            ClassificationRule::message("timed out", Timeout),
            ClassificationRule::message("timeout", Timeout),
            ClassificationRule::message("deadline exceeded", Timeout),
            ClassificationRule::message("database is locked", Timeout),
            ClassificationRule::message("unique constraint", ConstraintViolation),
            ClassificationRule::message("foreign key constraint", ConstraintViolation),
            ClassificationRule::message("constraint failed", ConstraintViolation),
            ClassificationRule::message("not found", NotFound),
            ClassificationRule::message("no rows returned", NotFound),
            ClassificationRule::message("permission denied", PermissionDenied),
            ClassificationRule::message("access denied", PermissionDenied),
            ClassificationRule::message("authentication failed", PermissionDenied),
            ClassificationRule::message("readonly database", PermissionDenied),
            ClassificationRule::message("transaction aborted", TransactionFailed),
            ClassificationRule::message("transaction failed", TransactionFailed),
            ClassificationRule::message("no transaction is active", TransactionFailed),
            ClassificationRule::message("transaction within a transaction", TransactionFailed),
            ClassificationRule::message("abort due to rollback", TransactionFailed),
            ClassificationRule::message("rolled back", TransactionFailed),
        ]
    }

    /// Table for SQLite via sqlx plus the driver-level signals of this crate.
    pub fn sqlite() -> Self {
        use ErrorKind::*;
        let mut rules = vec![
            ClassificationRule::code_where(sqlite_io_or_cantopen, ConnectionFailed),
            ClassificationRule::code_where(sqlite_busy_or_locked, Timeout),
            ClassificationRule::code_where(sqlite_constraint, ConstraintViolation),
            ClassificationRule::code_where(sqlite_denied, PermissionDenied),
            ClassificationRule::code_where(sqlite_abort, TransactionFailed),
            ClassificationRule::code("POOL_CLOSED", ConnectionFailed),
            ClassificationRule::code("TLS", ConnectionFailed),
            ClassificationRule::code("IO_CONNECTION", ConnectionFailed),
            ClassificationRule::code("IO_NOT_FOUND", ConnectionFailed),
            ClassificationRule::code("POOL_TIMED_OUT", Timeout),
            ClassificationRule::code("IO_TIMED_OUT", Timeout),
            ClassificationRule::code("IO_PERMISSION_DENIED", PermissionDenied),
            ClassificationRule::code("ROW_NOT_FOUND", NotFound),
        ];
        rules.extend(Self::message_rules());
        Self { rules }
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Append a rule. Later rules never override earlier ones; a disagreement
    /// within a tier yields `Unknown`.
    pub fn push_rule(&mut self, rule: ClassificationRule) {
        self.rules.push(rule);
    }

    fn resolve(&self, signal: &FailureSignal) -> (ErrorKind, MatchTier) {
        if let Some(code) = signal.code.as_deref() {
            let kinds = self
                .rules
                .iter()
                .filter(|r| r.is_code_rule() && r.matches_code(code))
                .map(|r| r.kind);
            match single_kind(kinds) {
                Verdict::One(kind) => return (kind, MatchTier::Code),
                Verdict::Conflicting => return (ErrorKind::Unknown, MatchTier::Ambiguous),
                Verdict::Empty => {}
            }
        }

        let lowered = signal.message.to_lowercase();
        let kinds = self
            .rules
            .iter()
            .filter(|r| r.matches_message(&lowered))
            .map(|r| r.kind);
        match single_kind(kinds) {
            Verdict::One(kind) => (kind, MatchTier::Message),
            Verdict::Conflicting => (ErrorKind::Unknown, MatchTier::Ambiguous),
            Verdict::Empty => (ErrorKind::Unknown, MatchTier::Unmatched),
        }
    }

    /// Classify a raw signal. Total: never fails.
    pub fn classify(&self, signal: &FailureSignal) -> ClassifiedError {
        let (kind, tier) = self.resolve(signal);
        let mut classified =
            ClassifiedError::new(kind, signal.message.clone()).with_context("tier", tier.to_string());
        if let Some(code) = &signal.code {
            classified = classified.with_context("code", code.clone());
        }
        classified
    }

    /// Classify an owned error, keeping it as the source.
    ///
    /// Returns `None` for domain outcomes that carry no storage signal.
    pub fn classify_error<E>(&self, error: E) -> Option<ClassifiedError>
    where
        E: StorageFailure + std::error::Error + Send + Sync + 'static,
    {
        let signal = error.signal()?;
        Some(self.classify(&signal).with_source(error))
    }
}

enum Verdict {
    Empty,
    One(ErrorKind),
    Conflicting,
}

fn single_kind(kinds: impl Iterator<Item = ErrorKind>) -> Verdict {
    let mut verdict = Verdict::Empty;
    for kind in kinds {
        verdict = match verdict {
            Verdict::Empty => Verdict::One(kind),
            Verdict::One(seen) if seen == kind => Verdict::One(seen),
            _ => return Verdict::Conflicting,
        };
    }
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn classify_code(code: &str) -> ClassifiedError {
        ErrorClassifier::sqlite().classify(&FailureSignal::coded(code, "driver error"))
    }

    #[test]
    fn test_retryable_kinds() {
        let retryable: Vec<_> = ErrorKind::ALL
            .into_iter()
            .filter(|k| k.is_retryable())
            .collect();
        assert_eq!(retryable, vec![ErrorKind::ConnectionFailed, ErrorKind::Timeout]);
    }

    #[test]
    fn test_sqlite_unique_violation_is_constraint() {
        // SQLITE_CONSTRAINT_UNIQUE
        let classified = classify_code("2067");
        assert_eq!(classified.kind, ErrorKind::ConstraintViolation);
        assert!(!classified.retryable);
        assert_eq!(classified.code(), Some("2067"));
    }

    #[test]
    fn test_sqlite_extended_codes() {
        assert_eq!(classify_code("787").kind, ErrorKind::ConstraintViolation);
        assert_eq!(classify_code("5").kind, ErrorKind::Timeout);
        assert_eq!(classify_code("517").kind, ErrorKind::Timeout); // BUSY_SNAPSHOT
        assert_eq!(classify_code("6").kind, ErrorKind::Timeout);
        assert_eq!(classify_code("10").kind, ErrorKind::ConnectionFailed);
        assert_eq!(classify_code("522").kind, ErrorKind::ConnectionFailed); // IOERR_SHORT_READ
        assert_eq!(classify_code("14").kind, ErrorKind::ConnectionFailed);
        assert_eq!(classify_code("8").kind, ErrorKind::PermissionDenied);
        assert_eq!(classify_code("23").kind, ErrorKind::PermissionDenied);
        assert_eq!(classify_code("4").kind, ErrorKind::TransactionFailed);
        assert_eq!(classify_code("516").kind, ErrorKind::TransactionFailed);
    }

    #[test]
    fn test_code_takes_precedence_over_message() {
        let signal = FailureSignal::coded("2067", "connection refused while inserting");
        let classified = ErrorClassifier::sqlite().classify(&signal);
        assert_eq!(classified.kind, ErrorKind::ConstraintViolation);
        assert_eq!(classified.context.get("tier").map(String::as_str), Some("code"));
    }

    #[test]
    fn test_unmatched_code_falls_back_to_message() {
        // SQLITE_FULL has no code rule
        let signal = FailureSignal::coded("13", "operation timed out");
        let classified = ErrorClassifier::sqlite().classify(&signal);
        assert_eq!(classified.kind, ErrorKind::Timeout);
        assert_eq!(
            classified.context.get("tier").map(String::as_str),
            Some("message")
        );
    }

    #[test]
    fn test_message_heuristics() {
        let classifier = ErrorClassifier::sqlite();
        let kind = |msg: &str| classifier.classify(&FailureSignal::message(msg)).kind;

        assert_eq!(kind("Connection refused (os error 111)"), ErrorKind::ConnectionFailed);
        assert_eq!(kind("query TIMED OUT"), ErrorKind::Timeout);
        assert_eq!(kind("UNIQUE constraint failed: tasks.id"), ErrorKind::ConstraintViolation);
        assert_eq!(kind("record not found"), ErrorKind::NotFound);
        assert_eq!(kind("permission denied for table"), ErrorKind::PermissionDenied);
        assert_eq!(kind("transaction aborted"), ErrorKind::TransactionFailed);
        assert_eq!(
            kind("cannot commit - no transaction is active"),
            ErrorKind::TransactionFailed
        );
        assert_eq!(kind("abort due to ROLLBACK"), ErrorKind::TransactionFailed);
    }

    #[test]
    fn test_transaction_wording_alone_does_not_decide_kind() {
        let classifier = ErrorClassifier::sqlite();
        let kind = |msg: &str| classifier.classify(&FailureSignal::message(msg)).kind;

        assert_eq!(kind("transaction timed out"), ErrorKind::Timeout);
        assert_eq!(kind("transaction row not found"), ErrorKind::NotFound);
        assert_eq!(
            kind("connection refused while starting transaction"),
            ErrorKind::ConnectionFailed
        );
        assert!(kind("transaction timed out").is_retryable());
    }

    #[test]
    fn test_unrecognised_is_unknown_and_not_retryable() {
        let classified = ErrorClassifier::sqlite().classify(&FailureSignal::message("kaboom"));
        assert_eq!(classified.kind, ErrorKind::Unknown);
        assert!(!classified.retryable);
        assert_eq!(
            classified.context.get("tier").map(String::as_str),
            Some("unmatched")
        );
    }

    #[test]
    fn test_conflicting_message_rules_are_unknown() {
        // Matches both a Timeout and a NotFound heuristic
        let classified = ErrorClassifier::sqlite()
            .classify(&FailureSignal::message("lookup timed out: host not found"));
        assert_eq!(classified.kind, ErrorKind::Unknown);
        assert!(!classified.retryable);
        assert_eq!(
            classified.context.get("tier").map(String::as_str),
            Some("ambiguous")
        );
    }

    #[test]
    fn test_conflicting_code_rules_are_unknown() {
        let classifier = ErrorClassifier::with_rules(vec![
            ClassificationRule::code("X1", ErrorKind::Timeout),
            ClassificationRule::code("X1", ErrorKind::NotFound),
        ]);
        let classified = classifier.classify(&FailureSignal::coded("X1", "timeout"));
        assert_eq!(classified.kind, ErrorKind::Unknown);
    }

    #[test]
    fn test_pluggable_table_for_other_driver() {
        // An ORM-style error surface with its own code vocabulary
        let mut rules = vec![
            ClassificationRule::code("P2002", ErrorKind::ConstraintViolation),
            ClassificationRule::code("P2025", ErrorKind::NotFound),
            ClassificationRule::code("P1001", ErrorKind::ConnectionFailed),
        ];
        rules.extend(ErrorClassifier::message_rules());
        let classifier = ErrorClassifier::with_rules(rules);

        let classified = classifier.classify(&FailureSignal::coded(
            "P2002",
            "Unique constraint failed on the fields: (`email`)",
        ));
        assert_eq!(classified.kind, ErrorKind::ConstraintViolation);
        assert!(!classified.retryable);
        assert!(!crate::retry::should_retry(&classified));

        let unreachable = classifier.classify(&FailureSignal::coded("P1001", "cannot reach server"));
        assert_eq!(unreachable.kind, ErrorKind::ConnectionFailed);
        assert!(unreachable.retryable);
    }

    #[test]
    fn test_sqlx_driver_signals() {
        let classifier = ErrorClassifier::sqlite();

        let timed_out = classifier.classify_error(sqlx::Error::PoolTimedOut).unwrap();
        assert_eq!(timed_out.kind, ErrorKind::Timeout);

        let closed = classifier.classify_error(sqlx::Error::PoolClosed).unwrap();
        assert_eq!(closed.kind, ErrorKind::ConnectionFailed);

        let missing = classifier.classify_error(sqlx::Error::RowNotFound).unwrap();
        assert_eq!(missing.kind, ErrorKind::NotFound);
        assert!(std::error::Error::source(&missing).is_some());
    }

    #[test]
    fn test_io_signals() {
        let classifier = ErrorClassifier::sqlite();
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        assert_eq!(
            classifier.classify_error(refused).unwrap().kind,
            ErrorKind::ConnectionFailed
        );

        let wrapped = sqlx::Error::Io(io::Error::new(io::ErrorKind::TimedOut, "slow disk"));
        assert_eq!(
            classifier.classify_error(wrapped).unwrap().kind,
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_error_kind_display_roundtrip() {
        assert_eq!(ErrorKind::ConstraintViolation.to_string(), "CONSTRAINT_VIOLATION");
        let parsed: ErrorKind = "CONNECTION_FAILED".parse().unwrap();
        assert_eq!(parsed, ErrorKind::ConnectionFailed);
    }
}
