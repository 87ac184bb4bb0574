//! Error taxonomy.
//!
//! Broker failures are classified exactly once, at the adapter boundary, into
//! [`ErrorClass::Transient`] (retryable, bounded) or
//! [`ErrorClass::Permanent`] (terminal for the intent). Nothing downstream
//! re-interprets a failure as success.

use serde::Serialize;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransientKind {
    /// Caller deadline exceeded; the request may or may not have reached the venue.
    Timeout,
    /// Venue temporarily unavailable.
    Unavailable,
    /// Venue throttled the request. Retried on its own, slower backoff curve.
    RateLimited,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermanentKind {
    InvalidParameters,
    Rejected,
    InsufficientBalance,
    UnknownOrder,
}

/// Classified error kind consumed by the retry policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient(TransientKind),
    Permanent(PermanentKind),
}

impl ErrorKind {
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorKind::Transient(_) => ErrorClass::Transient,
            ErrorKind::Permanent(_) => ErrorClass::Permanent,
        }
    }

    /// Stable code used in audit payloads.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Transient(TransientKind::Timeout) => "TIMEOUT",
            ErrorKind::Transient(TransientKind::Unavailable) => "UNAVAILABLE",
            ErrorKind::Transient(TransientKind::RateLimited) => "RATE_LIMITED",
            ErrorKind::Permanent(PermanentKind::InvalidParameters) => "INVALID_PARAMETERS",
            ErrorKind::Permanent(PermanentKind::Rejected) => "REJECTED",
            ErrorKind::Permanent(PermanentKind::InsufficientBalance) => "INSUFFICIENT_BALANCE",
            ErrorKind::Permanent(PermanentKind::UnknownOrder) => "UNKNOWN_ORDER",
        }
    }
}

/// A classified broker failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("transient broker error {kind:?}: {detail}")]
    Transient { kind: TransientKind, detail: String },
    #[error("permanent broker error {kind:?}: {detail}")]
    Permanent { kind: PermanentKind, detail: String },
}

impl BrokerError {
    pub fn transient(kind: TransientKind, detail: impl Into<String>) -> Self {
        BrokerError::Transient {
            kind,
            detail: detail.into(),
        }
    }

    pub fn permanent(kind: PermanentKind, detail: impl Into<String>) -> Self {
        BrokerError::Permanent {
            kind,
            detail: detail.into(),
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::transient(TransientKind::Timeout, detail)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Transient { kind, .. } => ErrorKind::Transient(*kind),
            BrokerError::Permanent { kind, .. } => ErrorKind::Permanent(*kind),
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.kind().class()
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn detail(&self) -> &str {
        match self {
            BrokerError::Transient { detail, .. } | BrokerError::Permanent { detail, .. } => detail,
        }
    }
}

/// Contract violations around idempotency keys. These are caller bugs, not
/// transient conditions, and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdempotencyViolation {
    #[error("intent {intent_id} already reached a terminal state (broker order {existing_broker_order_id:?})")]
    DuplicateIntent {
        intent_id: String,
        existing_broker_order_id: Option<String>,
    },
    #[error("intent {intent_id} was never reserved")]
    UnknownIntent { intent_id: String },
    #[error("intent {intent_id} already confirmed as {existing}, refusing {attempted}")]
    ConflictingConfirm {
        intent_id: String,
        existing: String,
        attempted: String,
    },
    #[error("intent {intent_id} is not pending")]
    NotPending { intent_id: String },
}
