//! Live session orchestrator.
//!
//! ```text
//! INIT ──preflight──► PREFLIGHT_OK ──start──► RUNNING ──(kill switch | stop)──► STOPPING ──► STOPPED
//!   └──────────────► PREFLIGHT_FAILED
//! any ──(audit failure | idempotency violation)──► ERROR_REQUIRES_OPERATOR
//! ```
//!
//! One `step()` while RUNNING:
//!
//! 1. kill switch tick; if it blocks, move to STOPPING and pull nothing
//! 2. resolve intents left pending by an earlier give-up (lookup only)
//! 3. pull one intent; refuse it without a broker call if it is malformed or
//!    outside the allowlist, else submit through the gateway
//! 4. ingest fills from the cursor into the tally, then mark the tally
//! 5. query every non-terminal order and record status changes
//! 6. list working orders
//! 7. ingest fills again: everything the snapshots reflect has been
//!    delivered by now, so local sits between the mark and the latest fold
//! 8. look up the venue orders behind fills nobody here placed
//! 9. reconcile, act on the repair plan per policy
//! 10. check invariants
//! 11. kill switch check; if it blocks, move to STOPPING
//!
//! Each state transition and each broker call outcome appends exactly one
//! audit record.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use rgx_audit::AuditLog;
use rgx_config::{RepairPolicy, SessionConfig};
use rgx_execution::{
    BrokerAdapter, CallDeadline, CallRecord, CancelOutcome, IdempotencyViolation, OrderGateway,
    RecordState, RetryPolicy, SubmitOutcome,
};
use rgx_integrity::{
    check_invariants, InvariantInputs, InvariantLimits, KillSwitch, KillSwitchState,
    ReconcileEvidence, Transition, TripReason,
};
use rgx_reconcile::{
    FillApply, FillTally, ReconcileInput, ReconcileReport, Reconciler, RepairAction, TallyMark,
};
use rgx_schemas::{BrokerOrder, FillCursor, OrderIntent, OrderStatus, SharedClock};

use crate::source::IntentSource;
use crate::state::{SessionError, SessionState};

#[derive(Clone, Debug)]
struct TrackedOrder {
    intent: OrderIntent,
    snapshot: Option<BrokerOrder>,
}

impl TrackedOrder {
    fn is_terminal(&self) -> bool {
        self.snapshot
            .as_ref()
            .map(|s| s.status.is_terminal())
            .unwrap_or(false)
    }
}

/// What one `step()` did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: u64,
    pub state: Option<SessionState>,
    pub intent_id: Option<String>,
    /// Audit code of the intent's outcome (`INTENT_PLACED`, `INTENT_REFUSED`, ...).
    pub intent_outcome: Option<String>,
    pub fills_applied: usize,
    pub fills_ignored: usize,
    pub reconciled: bool,
    pub report_clean: Option<bool>,
    pub blocked: bool,
}

/// Operator view. Building it has no side effects.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStatus {
    pub run_id: Uuid,
    pub session_state: SessionState,
    pub kill_switch: KillSwitchState,
    pub latest_report: Option<ReconcileReport>,
    pub retry_exhaustions: u32,
    pub open_orders: Vec<BrokerOrder>,
    pub pending_intents: Vec<String>,
    pub steps: u64,
    pub audit_events: usize,
}

pub struct LiveSessionOrchestrator<B, S> {
    cfg: SessionConfig,
    config_hash: Option<String>,
    clock: SharedClock,
    state: SessionState,
    gateway: OrderGateway<B>,
    kill_switch: KillSwitch,
    reconciler: Reconciler,
    audit: AuditLog,
    source: S,
    tally: FillTally,
    fill_cursor: FillCursor,
    /// Keyed by broker order id.
    orders: BTreeMap<String, TrackedOrder>,
    /// Intents whose submit gave up with the venue outcome unknown, by intent id.
    pending: BTreeMap<String, OrderIntent>,
    /// Venue orders behind unattributed fills, by broker order id. `None`
    /// when the venue does not know the order either.
    orphans: BTreeMap<String, Option<BrokerOrder>>,
    latest_report: Option<ReconcileReport>,
    retry_exhaustions: u32,
    steps: u64,
}

impl<B: BrokerAdapter, S: IntentSource> LiveSessionOrchestrator<B, S> {
    /// The audit log's run id is the session's run id.
    pub fn new(cfg: SessionConfig, adapter: B, source: S, clock: SharedClock, audit: AuditLog) -> Self {
        let gateway = OrderGateway::new(
            adapter,
            RetryPolicy::from_config(&cfg),
            CallDeadline::from_millis(cfg.broker_call_deadline_ms),
            clock.clone(),
        );
        let kill_switch = KillSwitch::from_config(&cfg, clock.clone());
        let reconciler = Reconciler::new(cfg.reconcile_epsilon_micros);
        Self {
            cfg,
            config_hash: None,
            clock,
            state: SessionState::Init,
            gateway,
            kill_switch,
            reconciler,
            audit,
            source,
            tally: FillTally::new(),
            fill_cursor: FillCursor::START,
            orders: BTreeMap::new(),
            pending: BTreeMap::new(),
            orphans: BTreeMap::new(),
            latest_report: None,
            retry_exhaustions: 0,
            steps: 0,
        }
    }

    /// Recorded in the preflight audit record.
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.audit.run_id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn gateway(&self) -> &OrderGateway<B> {
        &self.gateway
    }

    pub fn adapter(&self) -> &B {
        self.gateway.adapter()
    }

    pub fn kill_switch(&self) -> &KillSwitchState {
        self.kill_switch.peek()
    }

    pub fn tally(&self) -> &FillTally {
        &self.tally
    }

    pub fn latest_report(&self) -> Option<&ReconcileReport> {
        self.latest_report.as_ref()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            run_id: self.run_id(),
            session_state: self.state,
            kill_switch: self.kill_switch.peek().clone(),
            latest_report: self.latest_report.clone(),
            retry_exhaustions: self.retry_exhaustions,
            open_orders: self
                .orders
                .values()
                .filter(|o| !o.is_terminal())
                .filter_map(|o| o.snapshot.clone())
                .collect(),
            pending_intents: self.gateway.store().pending_intents(),
            steps: self.steps,
            audit_events: self.audit.len(),
        }
    }

    // ---------------------------------------------------------------------
    // audit plumbing
    // ---------------------------------------------------------------------

    fn emit(&mut self, code: &str, payload: Value) -> Result<(), SessionError> {
        match self.audit.append(code, payload) {
            Ok(_) => Ok(()),
            Err(e) => {
                // Nothing left to record the transition with.
                self.state = SessionState::ErrorRequiresOperator;
                tracing::error!(code, error = %e, "audit append failed; operator required");
                Err(SessionError::Audit(e))
            }
        }
    }

    fn emit_call(&mut self, rec: &CallRecord) -> Result<(), SessionError> {
        let payload = serde_json::to_value(rec).unwrap_or(Value::Null);
        self.emit(&rec.audit_code(), payload)
    }

    fn emit_transition(&mut self, t: &Transition) -> Result<(), SessionError> {
        let payload = serde_json::to_value(t).unwrap_or(Value::Null);
        self.emit(&t.audit_code(), payload)
    }

    fn set_state(&mut self, to: SessionState, detail: Value) -> Result<(), SessionError> {
        let from = self.state;
        self.state = to;
        info!(run_id = %self.run_id(), %from, %to, "session state");
        self.emit(
            "SESSION_STATE",
            json!({ "from": from.as_str(), "to": to.as_str(), "detail": detail }),
        )
    }

    fn fail_operator(&mut self, detail: Value) -> Result<(), SessionError> {
        self.set_state(SessionState::ErrorRequiresOperator, detail)
    }

    fn require(&self, ok: bool, required: &'static str) -> Result<(), SessionError> {
        if ok {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                state: self.state,
                required,
            })
        }
    }

    // ---------------------------------------------------------------------
    // lifecycle
    // ---------------------------------------------------------------------

    /// Governance gate. A pure precondition check over config and the kill
    /// switch; never touches the broker.
    pub fn preflight(&mut self) -> Result<SessionState, SessionError> {
        self.require(self.state == SessionState::Init, "INIT")?;

        let mut failures: Vec<&'static str> = Vec::new();
        if !self.cfg.enabled {
            failures.push("SESSION_DISABLED");
        }
        if self.cfg.allowlist.is_empty() {
            failures.push("ALLOWLIST_EMPTY");
        }
        if self.cfg.validate().is_err() {
            failures.push("CONFIG_INVALID");
        }
        if self.tick_kill_switch()? {
            failures.push("KILL_SWITCH_NOT_ARMED");
        }

        let detail = json!({
            "failures": failures,
            "config_hash": self.config_hash,
            "allowlist": self.cfg.allowlist,
        });
        if failures.is_empty() {
            self.set_state(SessionState::PreflightOk, detail)?;
        } else {
            warn!(?failures, "preflight failed");
            self.set_state(SessionState::PreflightFailed, detail)?;
        }
        Ok(self.state)
    }

    pub fn start(&mut self) -> Result<(), SessionError> {
        self.require(self.state == SessionState::PreflightOk, "PREFLIGHT_OK")?;
        self.set_state(SessionState::Running, json!({}))
    }

    /// Bounded iteration. While STOPPING, completes the shutdown instead.
    pub fn step(&mut self) -> Result<StepReport, SessionError> {
        match self.state {
            SessionState::Running => self.step_running(),
            SessionState::Stopping => {
                self.finish_stop()?;
                self.steps += 1;
                Ok(StepReport {
                    step: self.steps,
                    state: Some(self.state),
                    blocked: true,
                    ..StepReport::default()
                })
            }
            _ => Err(SessionError::InvalidState {
                state: self.state,
                required: "RUNNING",
            }),
        }
    }

    /// Up to `n` steps; returns early once the session reaches a final state.
    pub fn run_n_steps(&mut self, n: usize) -> Result<Vec<StepReport>, SessionError> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            if self.state.is_final() {
                break;
            }
            out.push(self.step()?);
        }
        Ok(out)
    }

    /// Operator shutdown. RUNNING or PREFLIGHT_OK -> STOPPING -> STOPPED.
    /// Stopping a stopped session is a no-op.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Stopped => Ok(()),
            SessionState::Running | SessionState::PreflightOk => {
                self.set_state(SessionState::Stopping, json!({ "reason": "OPERATOR_STOP" }))?;
                self.finish_stop()
            }
            SessionState::Stopping => self.finish_stop(),
            _ => Err(SessionError::InvalidState {
                state: self.state,
                required: "RUNNING",
            }),
        }
    }

    fn finish_stop(&mut self) -> Result<(), SessionError> {
        let mut canceled = Vec::new();
        if self.cfg.cancel_open_orders_on_stop {
            let open: Vec<String> = self
                .orders
                .iter()
                .filter(|(_, o)| !o.is_terminal())
                .map(|(id, _)| id.clone())
                .collect();
            canceled = self.cancel_orders(&open)?;
        }
        self.set_state(SessionState::Stopped, json!({ "canceled": canceled }))
    }

    fn cancel_orders(&mut self, ids: &[String]) -> Result<Vec<String>, SessionError> {
        let mut canceled = Vec::new();
        for id in ids {
            let report = self.gateway.cancel(id);
            for rec in &report.calls {
                self.emit_call(rec)?;
            }
            if report.outcome == CancelOutcome::Canceled {
                canceled.push(id.clone());
            }
        }
        Ok(canceled)
    }

    // ---------------------------------------------------------------------
    // operator controls
    // ---------------------------------------------------------------------

    pub fn trip(&mut self, note: &str) -> Result<(), SessionError> {
        let t = self.kill_switch.trip(TripReason::Manual {
            note: note.to_string(),
        });
        self.emit_transition(&t)
    }

    /// End the kill-switch cooldown early. Requires a clean latest report.
    pub fn clear(&mut self) -> Result<(), SessionError> {
        let ev = self.latest_report.clone();
        let t = self
            .kill_switch
            .clear(ev.as_ref().map(|r| r as &dyn ReconcileEvidence))?;
        self.emit_transition(&t)
    }

    /// RECOVERING -> ARMED. Requires a clean latest report.
    pub fn arm(&mut self) -> Result<(), SessionError> {
        self.tick_kill_switch()?;
        let ev = self.latest_report.clone();
        if let Some(t) = self
            .kill_switch
            .arm(ev.as_ref().map(|r| r as &dyn ReconcileEvidence))?
        {
            self.emit_transition(&t)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // the step
    // ---------------------------------------------------------------------

    /// Audited cooldown/auto-rearm transitions, then the block decision.
    fn tick_kill_switch(&mut self) -> Result<bool, SessionError> {
        let ev = self.latest_report.clone();
        let ts = self
            .kill_switch
            .tick(ev.as_ref().map(|r| r as &dyn ReconcileEvidence));
        for t in &ts {
            self.emit_transition(t)?;
        }
        Ok(self.kill_switch.check_and_block())
    }

    fn halt_on_kill_switch(&mut self) -> Result<(), SessionError> {
        let ks = self.kill_switch.peek().clone();
        self.set_state(
            SessionState::Stopping,
            json!({ "reason": "KILL_SWITCH", "kill_switch": ks }),
        )
    }

    fn step_running(&mut self) -> Result<StepReport, SessionError> {
        self.steps += 1;
        let mut report = StepReport {
            step: self.steps,
            ..StepReport::default()
        };

        if self.tick_kill_switch()? {
            self.halt_on_kill_switch()?;
            report.blocked = true;
            report.state = Some(self.state);
            return Ok(report);
        }

        self.recover_pending()?;

        if let Some(intent) = self.source.next_intent() {
            report.intent_id = Some(intent.intent_id.clone());
            report.intent_outcome = Some(self.handle_intent(intent)?);
        }

        let fills_ok = self.ingest_fills(&mut report)?;
        let mark = self.tally.mark();
        let queries_ok = self.refresh_orders()?;
        let open = self.fetch_open_orders()?;
        let settle_ok = self.ingest_fills(&mut report)?;
        let orphans_ok = self.resolve_orphans()?;

        let view_ok = fills_ok && queries_ok && settle_ok && orphans_ok;
        match open {
            Some(open) if view_ok => {
                self.reconcile(&open, mark)?;
                report.reconciled = true;
                report.report_clean = self.latest_report.as_ref().map(|r| r.is_clean());
            }
            _ => {
                self.emit(
                    "RECONCILE_SKIPPED",
                    json!({
                        "reason": "STALE_BROKER_VIEW",
                        "fills_ok": fills_ok && settle_ok,
                        "queries_ok": queries_ok,
                        "orphans_ok": orphans_ok,
                    }),
                )?;
            }
        }

        // A partial view cannot be compared against the mark.
        self.enforce_invariants(if view_ok { Some(mark) } else { None })?;

        if self.tick_kill_switch()? {
            self.halt_on_kill_switch()?;
            report.blocked = true;
        }
        report.state = Some(self.state);
        Ok(report)
    }

    fn recover_pending(&mut self) -> Result<(), SessionError> {
        let ids: Vec<String> = self.pending.keys().cloned().collect();
        for intent_id in ids {
            let rec = match self.gateway.recover(&intent_id) {
                Ok(Some(rec)) => rec,
                Ok(None) => {
                    let still_pending = self
                        .gateway
                        .store()
                        .get(&intent_id)
                        .map(|r| r.state == RecordState::Pending)
                        .unwrap_or(false);
                    if !still_pending {
                        self.pending.remove(&intent_id);
                    }
                    continue;
                }
                Err(v) => return self.idempotency_failure(v),
            };
            self.emit_call(&rec.call)?;
            let Some(order) = rec.found else { continue };
            let Some(intent) = self.pending.remove(&intent_id) else { continue };
            warn!(intent_id = %intent_id, broker_order_id = %order.broker_order_id, "recovered pending intent");
            self.emit(
                "INTENT_RECOVERED",
                json!({ "intent_id": intent_id, "broker_order_id": order.broker_order_id, "intent": intent }),
            )?;
            self.track(order.broker_order_id, intent);
        }
        Ok(())
    }

    fn idempotency_failure<T>(&mut self, v: IdempotencyViolation) -> Result<T, SessionError> {
        tracing::error!(error = %v, "idempotency violation");
        self.emit("IDEMPOTENCY_VIOLATION", json!({ "error": v.to_string() }))?;
        self.fail_operator(json!({ "reason": "IDEMPOTENCY_VIOLATION" }))?;
        Err(SessionError::Idempotency(v))
    }

    fn track(&mut self, broker_order_id: String, intent: OrderIntent) {
        self.tally
            .register_order(&broker_order_id, &intent.instrument, intent.side);
        self.orphans.remove(&broker_order_id);
        self.orders.insert(
            broker_order_id,
            TrackedOrder {
                intent,
                snapshot: None,
            },
        );
    }

    /// Returns the audit code of the outcome.
    fn handle_intent(&mut self, intent: OrderIntent) -> Result<String, SessionError> {
        if let Err(e) = intent.validate() {
            self.emit(
                "INTENT_REFUSED",
                json!({ "intent_id": intent.intent_id, "reason": "INVALID", "detail": e.to_string() }),
            )?;
            return Ok("INTENT_REFUSED".to_string());
        }
        if !self.cfg.is_allowlisted(&intent.instrument) {
            self.emit(
                "INTENT_REFUSED",
                json!({ "intent_id": intent.intent_id, "reason": "NOT_ALLOWLISTED", "instrument": intent.instrument }),
            )?;
            return Ok("INTENT_REFUSED".to_string());
        }

        let submitted = self.gateway.submit(&intent, &self.kill_switch);
        let sub = match submitted {
            Ok(s) => s,
            Err(v) => return self.idempotency_failure(v),
        };
        for rec in &sub.calls {
            self.emit_call(rec)?;
        }

        let (code, payload) = match &sub.outcome {
            SubmitOutcome::Placed {
                broker_order_id,
                recovered,
            } => (
                "INTENT_PLACED",
                json!({ "intent_id": intent.intent_id, "broker_order_id": broker_order_id, "recovered": recovered }),
            ),
            SubmitOutcome::Rejected { error } => (
                "INTENT_REJECTED",
                json!({ "intent_id": intent.intent_id, "code": error.kind().code(), "detail": error.detail() }),
            ),
            SubmitOutcome::GaveUp { reason, last_error } => {
                self.retry_exhaustions += 1;
                warn!(intent_id = %intent.intent_id, exhaustions = self.retry_exhaustions, "retry budget exhausted");
                (
                    "INTENT_GAVE_UP",
                    json!({
                        "intent_id": intent.intent_id,
                        "reason": reason,
                        "last_error": last_error.kind().code(),
                        "retry_exhaustions": self.retry_exhaustions,
                    }),
                )
            }
            SubmitOutcome::Blocked => ("INTENT_BLOCKED", json!({ "intent_id": intent.intent_id })),
            SubmitOutcome::InFlight { pending_since_ms } => (
                "INTENT_IN_FLIGHT",
                json!({ "intent_id": intent.intent_id, "pending_since_ms": pending_since_ms }),
            ),
        };
        self.emit(code, payload)?;
        match sub.outcome {
            SubmitOutcome::Placed { broker_order_id, .. } => self.track(broker_order_id, intent),
            SubmitOutcome::GaveUp { .. } => {
                self.pending.insert(intent.intent_id.clone(), intent);
            }
            _ => {}
        }
        Ok(code.to_string())
    }

    /// `false` when the adapter could not be read.
    fn ingest_fills(&mut self, report: &mut StepReport) -> Result<bool, SessionError> {
        let (res, rec) = self.gateway.fetch_fills(self.fill_cursor);
        self.emit_call(&rec)?;
        let mut stream = match res {
            Ok(s) => s,
            Err(_) => return Ok(false),
        };
        for fill in stream.by_ref() {
            let payload = json!({
                "fill_id": fill.fill_id,
                "broker_order_id": fill.broker_order_id,
                "qty_micros": fill.qty_micros,
                "price_micros": fill.price_micros,
                "seq": fill.seq,
            });
            let code = match self.tally.apply(fill) {
                FillApply::Applied => {
                    report.fills_applied += 1;
                    "FILL_APPLIED"
                }
                FillApply::Duplicate => {
                    report.fills_ignored += 1;
                    "FILL_DUPLICATE_IGNORED"
                }
                FillApply::Conflicting => {
                    report.fills_ignored += 1;
                    warn!(%payload, "conflicting fill redelivery ignored");
                    "FILL_CONFLICT_IGNORED"
                }
            };
            self.emit(code, payload)?;
        }
        self.fill_cursor = stream.cursor();
        Ok(true)
    }

    /// Query every non-terminal order. `false` if any query failed.
    fn refresh_orders(&mut self) -> Result<bool, SessionError> {
        let ids: Vec<String> = self
            .orders
            .iter()
            .filter(|(_, o)| !o.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        let mut all_ok = true;
        for id in ids {
            let (res, rec) = self.gateway.query_order(&id);
            self.emit_call(&rec)?;
            let snap = match res {
                Ok(s) => s,
                Err(_) => {
                    all_ok = false;
                    continue;
                }
            };
            let prev: Option<OrderStatus> = self
                .orders
                .get(&id)
                .and_then(|o| o.snapshot.as_ref())
                .map(|s| s.status);
            if prev != Some(snap.status) {
                self.emit(
                    "ORDER_STATUS",
                    json!({
                        "broker_order_id": id,
                        "intent_id": snap.intent_id,
                        "from": prev.map(|s| s.as_str()),
                        "to": snap.status.as_str(),
                        "filled_qty_micros": snap.filled_qty_micros,
                    }),
                )?;
            }
            if let Some(o) = self.orders.get_mut(&id) {
                o.snapshot = Some(snap);
            }
        }
        Ok(all_ok)
    }

    fn fetch_open_orders(&mut self) -> Result<Option<Vec<BrokerOrder>>, SessionError> {
        let (res, rec) = self.gateway.list_open_orders();
        self.emit_call(&rec)?;
        Ok(res.ok())
    }

    /// Look up the venue order behind every fill we cannot attribute.
    /// `false` if a lookup failed transiently.
    fn resolve_orphans(&mut self) -> Result<bool, SessionError> {
        let ids: BTreeSet<String> = self
            .tally
            .orphan_fills()
            .iter()
            .map(|f| f.broker_order_id.clone())
            .filter(|id| !self.orphans.contains_key(id))
            .collect();
        let mut all_ok = true;
        for id in ids {
            let (res, rec) = self.gateway.query_order(&id);
            self.emit_call(&rec)?;
            match res {
                Ok(snap) => {
                    self.orphans.insert(id, Some(snap));
                }
                Err(e) if e.is_transient() => all_ok = false,
                Err(_) => {
                    self.orphans.insert(id, None);
                }
            }
        }
        Ok(all_ok)
    }

    fn snapshots(&self) -> Vec<BrokerOrder> {
        self.orders
            .values()
            .filter_map(|o| o.snapshot.clone())
            .collect()
    }

    fn reconcile(&mut self, open: &[BrokerOrder], mark: TallyMark) -> Result<(), SessionError> {
        let snapshots = self.snapshots();
        let orphan_orders: Vec<BrokerOrder> = self.orphans.values().flatten().cloned().collect();
        // Pending intents may already hold a venue order we have not looked up.
        let known: BTreeSet<String> = self
            .orders
            .values()
            .map(|o| o.intent.intent_id.clone())
            .chain(self.gateway.store().pending_intents())
            .collect();
        let now = self.clock.now_ms();
        let input = ReconcileInput {
            tally: &self.tally,
            snapshot_mark: Some(mark),
            snapshots: &snapshots,
            open_orders: open,
            orphan_orders: &orphan_orders,
            known_intents: &known,
        };
        let (report, tripped) = self
            .reconciler
            .reconcile_and_enforce(&input, now, &mut self.kill_switch);

        let plan = report.repair_plan();
        let auto_cancel = plan.contains(RepairAction::CancelOpenOrders)
            && self.cfg.repair_policy == RepairPolicy::AutoCancelOpenOrders;
        self.emit(
            "RECONCILE_REPORT",
            json!({ "report": report, "repair_plan": plan, "auto_execute": auto_cancel }),
        )?;
        if let Some(t) = tripped {
            self.emit_transition(&t)?;
        }
        self.latest_report = Some(report);

        if auto_cancel {
            let ids: Vec<String> = open.iter().map(|o| o.broker_order_id.clone()).collect();
            let canceled = self.cancel_orders(&ids)?;
            self.emit("REPAIR_EXECUTED", json!({ "action": "cancel_open_orders", "canceled": canceled }))?;
        }
        Ok(())
    }

    /// `mark` is `None` when this step's broker view is incomplete; the
    /// fill-credit check is skipped then.
    fn enforce_invariants(&mut self, mark: Option<TallyMark>) -> Result<(), SessionError> {
        let over_credited = match mark {
            Some(m) => self.tally.over_credited(&self.snapshots(), m),
            None => Vec::new(),
        };
        let inputs = InvariantInputs {
            cash_micros: self
                .cfg
                .starting_cash_micros
                .map(|c| c.saturating_add(self.tally.cash_delta_micros())),
            double_applied_fills: over_credited.len() as u64,
            retry_exhaustions: self.retry_exhaustions,
        };
        let limits = InvariantLimits {
            max_retry_exhaustions: self.cfg.max_retry_exhaustions,
        };
        let violations = check_invariants(&inputs, &limits);
        let Some(first) = violations.first().cloned() else {
            return Ok(());
        };
        self.emit(
            "INVARIANT_VIOLATION",
            json!({
                "violations": violations.iter().map(|v| v.code()).collect::<Vec<_>>(),
                "over_credited": over_credited,
            }),
        )?;
        if matches!(self.kill_switch.peek(), KillSwitchState::Tripped { .. }) {
            return Ok(());
        }
        let t = self.kill_switch.trip(first);
        self.emit_transition(&t)
    }
}
