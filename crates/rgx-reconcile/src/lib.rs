//! rgx-reconcile
//!
//! Local view: every fill ingested from the adapter, folded by `fill_id`
//! ([`FillTally`]). Broker view: `filled_qty` on the latest order snapshots.
//! The [`Reconciler`] diffs the two per instrument and reports drift, unknown
//! orders (working ones, and any order whose fills we cannot attribute) and
//! overfills. Fills and snapshots are separate reads, so the caller brackets
//! the snapshot reads with a [`TallyMark`]: local is the range between the
//! fold at the mark and the latest fold. A dirty report trips the kill switch and
//! carries a [`RepairPlan`]; the reconciler never places or cancels anything
//! itself.

mod engine;
mod tally;
mod types;

pub use engine::{ReconcileInput, Reconciler};
pub use tally::{FillApply, FillTally, TallyMark};
pub use types::{
    Overfill, PositionMismatch, ReconcileReport, RepairAction, RepairPlan, UnknownOrder,
};
