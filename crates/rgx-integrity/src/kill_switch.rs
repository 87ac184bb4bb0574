//! Kill switch state machine.
//!
//! | From | Event | To |
//! |---|---|---|
//! | any | `trip(reason)` | TRIPPED (cooldown restarts) |
//! | TRIPPED | cooldown elapsed (observed by `tick`/`check_and_block`) | RECOVERING |
//! | TRIPPED | `clear(clean evidence)` | RECOVERING |
//! | RECOVERING | `arm(clean evidence)` | ARMED |
//! | RECOVERING | `tick(clean evidence)` with auto re-arm | ARMED |
//!
//! Everything else is a [`PreconditionError`].

use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use rgx_config::SessionConfig;
use rgx_execution::DispatchGate;
use rgx_schemas::SharedClock;

/// Anything that can vouch for the latest reconciliation.
pub trait ReconcileEvidence {
    fn mismatch_count(&self) -> usize;

    fn is_clean(&self) -> bool {
        self.mismatch_count() == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripReason {
    ReconcileMismatch { mismatches: usize },
    NegativeBalance { cash_micros: i64 },
    DuplicateFillApplied { count: u64 },
    RetryExhaustion { count: u32, threshold: u32 },
    Manual { note: String },
}

impl TripReason {
    pub fn code(&self) -> &'static str {
        match self {
            TripReason::ReconcileMismatch { .. } => "KILL_SWITCH_RECONCILE_MISMATCH",
            TripReason::NegativeBalance { .. } => "KILL_SWITCH_NEGATIVE_BALANCE",
            TripReason::DuplicateFillApplied { .. } => "KILL_SWITCH_DUPLICATE_FILL",
            TripReason::RetryExhaustion { .. } => "KILL_SWITCH_RETRY_EXHAUSTION",
            TripReason::Manual { .. } => "KILL_SWITCH_MANUAL",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillSwitchState {
    Armed,
    Tripped { reason: TripReason, at_ms: i64 },
    Recovering { since_ms: i64, last_reason: TripReason },
}

impl KillSwitchState {
    pub fn name(&self) -> &'static str {
        match self {
            KillSwitchState::Armed => "ARMED",
            KillSwitchState::Tripped { .. } => "TRIPPED",
            KillSwitchState::Recovering { .. } => "RECOVERING",
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(self, KillSwitchState::Armed)
    }
}

impl fmt::Display for KillSwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One state change, ready to be audited.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: &'static str,
    pub to: &'static str,
    pub at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<TripReason>,
}

impl Transition {
    /// `KILL_SWITCH_TRIPPED`, `KILL_SWITCH_RECOVERING`, `KILL_SWITCH_ARMED`.
    pub fn audit_code(&self) -> String {
        format!("KILL_SWITCH_{}", self.to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionError {
    #[error("kill switch is {state}, operation requires {required}")]
    WrongState {
        state: &'static str,
        required: &'static str,
    },
    #[error("latest reconcile report has {mismatches} mismatch(es)")]
    ReconcileNotClean { mismatches: usize },
    #[error("no reconcile report available")]
    NoReconcileReport,
}

pub struct KillSwitch {
    state: KillSwitchState,
    cooldown_ms: i64,
    auto_rearm: bool,
    clock: SharedClock,
    trips: u64,
}

impl fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KillSwitch")
            .field("state", &self.state)
            .field("cooldown_ms", &self.cooldown_ms)
            .field("auto_rearm", &self.auto_rearm)
            .field("trips", &self.trips)
            .finish()
    }
}

impl KillSwitch {
    pub fn new(cooldown_ms: u64, auto_rearm: bool, clock: SharedClock) -> Self {
        Self {
            state: KillSwitchState::Armed,
            cooldown_ms: i64::try_from(cooldown_ms).unwrap_or(i64::MAX),
            auto_rearm,
            clock,
            trips: 0,
        }
    }

    pub fn from_config(cfg: &SessionConfig, clock: SharedClock) -> Self {
        Self::new(cfg.kill_switch_cooldown_ms, cfg.kill_switch_auto_rearm, clock)
    }

    /// Current state without applying any time-based transition.
    pub fn peek(&self) -> &KillSwitchState {
        &self.state
    }

    pub fn trip_count(&self) -> u64 {
        self.trips
    }

    fn transition(&mut self, to: KillSwitchState, at_ms: i64) -> Transition {
        let reason = match &to {
            KillSwitchState::Tripped { reason, .. } => Some(reason.clone()),
            _ => None,
        };
        let t = Transition {
            from: self.state.name(),
            to: to.name(),
            at_ms,
            reason,
        };
        self.state = to;
        t
    }

    /// Trip from any state. A trip while already tripped restarts the cooldown.
    pub fn trip(&mut self, reason: TripReason) -> Transition {
        let now = self.clock.now_ms();
        self.trips += 1;
        warn!(code = reason.code(), from = self.state.name(), "kill switch tripped");
        self.transition(KillSwitchState::Tripped { reason, at_ms: now }, now)
    }

    /// Apply time-based transitions. With auto re-arm enabled and clean
    /// evidence, RECOVERING moves on to ARMED in the same call.
    pub fn tick(&mut self, evidence: Option<&dyn ReconcileEvidence>) -> Vec<Transition> {
        let now = self.clock.now_ms();
        let mut out = Vec::new();
        if let KillSwitchState::Tripped { reason, at_ms } = &self.state {
            if now.saturating_sub(*at_ms) >= self.cooldown_ms {
                let next = KillSwitchState::Recovering {
                    since_ms: now,
                    last_reason: reason.clone(),
                };
                info!("kill switch cooldown elapsed; recovering");
                out.push(self.transition(next, now));
            }
        }
        if self.auto_rearm && matches!(self.state, KillSwitchState::Recovering { .. }) {
            if let Some(ev) = evidence {
                if ev.is_clean() {
                    info!("kill switch auto re-armed on clean reconcile");
                    out.push(self.transition(KillSwitchState::Armed, now));
                }
            }
        }
        out
    }

    /// `true` while TRIPPED or RECOVERING. Applies the cooldown first, which
    /// never unblocks by itself.
    pub fn check_and_block(&mut self) -> bool {
        self.tick(None);
        !self.state.is_armed()
    }

    /// Operator: end the cooldown early. Requires clean evidence.
    pub fn clear(&mut self, evidence: Option<&dyn ReconcileEvidence>) -> Result<Transition, PreconditionError> {
        let last_reason = match &self.state {
            KillSwitchState::Tripped { reason, .. } => reason.clone(),
            other => {
                return Err(PreconditionError::WrongState {
                    state: other.name(),
                    required: "TRIPPED",
                })
            }
        };
        require_clean(evidence)?;
        let now = self.clock.now_ms();
        Ok(self.transition(
            KillSwitchState::Recovering {
                since_ms: now,
                last_reason,
            },
            now,
        ))
    }

    /// Operator: RECOVERING -> ARMED. Requires clean evidence. Arming an
    /// armed switch is a no-op.
    pub fn arm(&mut self, evidence: Option<&dyn ReconcileEvidence>) -> Result<Option<Transition>, PreconditionError> {
        self.tick(None);
        match self.state {
            KillSwitchState::Armed => Ok(None),
            KillSwitchState::Tripped { .. } => Err(PreconditionError::WrongState {
                state: "TRIPPED",
                required: "RECOVERING",
            }),
            KillSwitchState::Recovering { .. } => {
                require_clean(evidence)?;
                let now = self.clock.now_ms();
                info!("kill switch re-armed by operator");
                Ok(Some(self.transition(KillSwitchState::Armed, now)))
            }
        }
    }
}

fn require_clean(evidence: Option<&dyn ReconcileEvidence>) -> Result<(), PreconditionError> {
    let ev = evidence.ok_or(PreconditionError::NoReconcileReport)?;
    match ev.mismatch_count() {
        0 => Ok(()),
        n => Err(PreconditionError::ReconcileNotClean { mismatches: n }),
    }
}

impl DispatchGate for KillSwitch {
    fn blocks_dispatch(&self) -> bool {
        !self.state.is_armed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgx_schemas::FixedClock;
    use std::sync::Arc;

    struct Evidence(usize);
    impl ReconcileEvidence for Evidence {
        fn mismatch_count(&self) -> usize {
            self.0
        }
    }

    fn ks(auto: bool) -> (KillSwitch, Arc<FixedClock>) {
        let clock = FixedClock::shared(0);
        (KillSwitch::new(1_000, auto, clock.clone()), clock)
    }

    fn mismatch() -> TripReason {
        TripReason::ReconcileMismatch { mismatches: 1 }
    }

    #[test]
    fn starts_armed_and_open() {
        let (mut k, _) = ks(false);
        assert!(!k.check_and_block());
        assert!(!k.blocks_dispatch());
    }

    #[test]
    fn blocks_through_trip_and_recovery() {
        let (mut k, clock) = ks(false);
        let t = k.trip(mismatch());
        assert_eq!(t.audit_code(), "KILL_SWITCH_TRIPPED");
        assert!(k.check_and_block());

        clock.advance_ms(999);
        assert!(k.check_and_block());
        assert_eq!(k.peek().name(), "TRIPPED");

        clock.advance_ms(1);
        assert!(k.check_and_block());
        assert_eq!(k.peek().name(), "RECOVERING");

        // Without auto re-arm, time alone never unblocks.
        clock.advance_ms(1_000_000);
        assert!(k.check_and_block());
    }

    #[test]
    fn arm_requires_recovering_and_clean_report() {
        let (mut k, clock) = ks(false);
        k.trip(mismatch());
        assert!(matches!(
            k.arm(Some(&Evidence(0))),
            Err(PreconditionError::WrongState { .. })
        ));

        clock.advance_ms(1_000);
        assert_eq!(
            k.arm(Some(&Evidence(2))),
            Err(PreconditionError::ReconcileNotClean { mismatches: 2 })
        );
        assert_eq!(k.arm(None), Err(PreconditionError::NoReconcileReport));
        let t = k.arm(Some(&Evidence(0))).unwrap().unwrap();
        assert_eq!((t.from, t.to), ("RECOVERING", "ARMED"));
        assert!(!k.check_and_block());
        assert_eq!(k.arm(Some(&Evidence(0))).unwrap(), None);
    }

    #[test]
    fn clear_skips_cooldown_only_when_clean() {
        let (mut k, _) = ks(false);
        assert!(k.clear(Some(&Evidence(0))).is_err());
        k.trip(mismatch());
        assert!(k.clear(Some(&Evidence(1))).is_err());
        let t = k.clear(Some(&Evidence(0))).unwrap();
        assert_eq!(t.to, "RECOVERING");
        assert!(k.check_and_block());
    }

    #[test]
    fn violation_while_recovering_retrips() {
        let (mut k, clock) = ks(false);
        k.trip(mismatch());
        clock.advance_ms(1_000);
        k.tick(None);
        let t = k.trip(TripReason::NegativeBalance { cash_micros: -5 });
        assert_eq!((t.from, t.to), ("RECOVERING", "TRIPPED"));
        assert_eq!(k.trip_count(), 2);

        // Cooldown restarted from the new trip.
        clock.advance_ms(500);
        k.tick(None);
        assert_eq!(k.peek().name(), "TRIPPED");
    }

    #[test]
    fn auto_rearm_needs_clean_evidence() {
        let (mut k, clock) = ks(true);
        k.trip(mismatch());
        clock.advance_ms(1_000);
        let ts = k.tick(Some(&Evidence(1)));
        assert_eq!(ts.len(), 1);
        assert_eq!(k.peek().name(), "RECOVERING");
        let ts = k.tick(Some(&Evidence(0)));
        assert_eq!(ts.last().map(|t| t.to), Some("ARMED"));
        assert!(!k.check_and_block());
    }

    #[test]
    fn state_serializes_with_reason() {
        let (mut k, _) = ks(false);
        k.trip(TripReason::Manual { note: "drill".into() });
        let v = serde_json::to_value(k.peek()).unwrap();
        assert_eq!(v["state"], "TRIPPED");
        assert_eq!(v["reason"]["kind"], "MANUAL");
    }
}
