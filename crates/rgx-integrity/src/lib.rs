//! rgx-integrity
//!
//! Kill switch and the invariants that trip it.
//!
//! - A fresh switch is ARMED; once tripped it only re-arms on clean
//!   reconcile evidence.
//! - TRIPPED and RECOVERING both block dispatch.
//! - All time comes from the injected clock.

mod invariants;
mod kill_switch;

pub use invariants::{check_invariants, InvariantInputs, InvariantLimits};
pub use kill_switch::{
    KillSwitch, KillSwitchState, PreconditionError, ReconcileEvidence, Transition, TripReason,
};
