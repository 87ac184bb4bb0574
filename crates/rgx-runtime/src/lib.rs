//! rgx-runtime
//!
//! [`LiveSessionOrchestrator`]: preflight, bounded steps, shutdown. It owns
//! the session's audit log, kill switch, fill tally and order gateway, and
//! is the only writer of each.
//!
//! There is deliberately no run-forever loop. Callers compose
//! [`LiveSessionOrchestrator::step`] / [`LiveSessionOrchestrator::run_n_steps`].

mod orchestrator;
mod source;
mod state;

pub use orchestrator::{LiveSessionOrchestrator, SessionStatus, StepReport};
pub use source::IntentSource;
pub use state::{SessionError, SessionState};
