//! Scenario: the kill switch's full cycle under an injected clock.
//!
//! # Invariants under test
//! - TRIPPED and RECOVERING both block; only ARMED lets dispatch through.
//! - The cooldown boundary is exact: one millisecond short stays TRIPPED.
//! - Re-arm requires RECOVERING and evidence with zero mismatches.
//! - A fresh violation while RECOVERING trips again and restarts the cooldown.
//! - With auto re-arm, clean evidence after the cooldown re-arms without an
//!   operator; dirty evidence does not.

use rgx_execution::DispatchGate;
use rgx_integrity::{KillSwitch, KillSwitchState, PreconditionError, ReconcileEvidence, TripReason};
use rgx_schemas::{FixedClock, SharedClock};

struct Evidence(usize);

impl ReconcileEvidence for Evidence {
    fn mismatch_count(&self) -> usize {
        self.0
    }
}

const COOLDOWN: u64 = 60_000;

fn mismatch() -> TripReason {
    TripReason::ReconcileMismatch { mismatches: 1 }
}

#[test]
fn cooldown_then_operator_rearm() {
    let clock = FixedClock::shared(0);
    let shared: SharedClock = clock.clone();
    let mut ks = KillSwitch::new(COOLDOWN, false, shared);
    assert!(!ks.check_and_block());

    ks.trip(mismatch());
    assert!(ks.check_and_block());
    assert!(ks.blocks_dispatch());

    clock.advance_ms(COOLDOWN as i64 - 1);
    assert!(ks.check_and_block());
    assert_eq!(ks.peek().name(), "TRIPPED");

    clock.advance_ms(1);
    assert!(ks.check_and_block());
    assert_eq!(ks.peek().name(), "RECOVERING");

    assert_eq!(
        ks.arm(Some(&Evidence(2))),
        Err(PreconditionError::ReconcileNotClean { mismatches: 2 })
    );
    assert_eq!(ks.arm(None), Err(PreconditionError::NoReconcileReport));

    let t = ks.arm(Some(&Evidence(0))).unwrap().unwrap();
    assert_eq!(t.audit_code(), "KILL_SWITCH_ARMED");
    assert!(!ks.check_and_block());
    assert!(!ks.blocks_dispatch());
}

#[test]
fn retrip_while_recovering_restarts_cooldown() {
    let clock = FixedClock::shared(0);
    let shared: SharedClock = clock.clone();
    let mut ks = KillSwitch::new(COOLDOWN, false, shared);

    ks.trip(mismatch());
    clock.advance_ms(COOLDOWN as i64);
    ks.tick(None);
    assert!(matches!(ks.peek(), KillSwitchState::Recovering { .. }));

    let t = ks.trip(TripReason::NegativeBalance { cash_micros: -1 });
    assert_eq!(t.from, "RECOVERING");
    assert_eq!(ks.trip_count(), 2);

    clock.advance_ms(COOLDOWN as i64 - 1);
    ks.tick(None);
    assert_eq!(ks.peek().name(), "TRIPPED");
}

#[test]
fn auto_rearm_needs_clean_evidence() {
    let clock = FixedClock::shared(0);
    let shared: SharedClock = clock.clone();
    let mut ks = KillSwitch::new(COOLDOWN, true, shared);

    ks.trip(mismatch());
    clock.advance_ms(COOLDOWN as i64);

    let ts = ks.tick(Some(&Evidence(1)));
    assert_eq!(ts.len(), 1);
    assert_eq!(ks.peek().name(), "RECOVERING");

    let ts = ks.tick(Some(&Evidence(0)));
    assert_eq!(ts.len(), 1);
    assert_eq!(ts[0].to, "ARMED");
    assert!(ks.peek().is_armed());
}
