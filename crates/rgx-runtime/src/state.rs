use std::fmt;

use serde::Serialize;

use rgx_execution::IdempotencyViolation;
use rgx_integrity::PreconditionError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Init,
    PreflightOk,
    Running,
    Stopping,
    Stopped,
    PreflightFailed,
    ErrorRequiresOperator,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Init => "INIT",
            SessionState::PreflightOk => "PREFLIGHT_OK",
            SessionState::Running => "RUNNING",
            SessionState::Stopping => "STOPPING",
            SessionState::Stopped => "STOPPED",
            SessionState::PreflightFailed => "PREFLIGHT_FAILED",
            SessionState::ErrorRequiresOperator => "ERROR_REQUIRES_OPERATOR",
        }
    }

    /// No further step-driven transitions.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            SessionState::Stopped | SessionState::PreflightFailed | SessionState::ErrorRequiresOperator
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is {state}, operation requires {required}")]
    InvalidState {
        state: SessionState,
        required: &'static str,
    },
    #[error("audit write failed: {0:#}")]
    Audit(anyhow::Error),
    #[error(transparent)]
    Idempotency(#[from] IdempotencyViolation),
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
}
