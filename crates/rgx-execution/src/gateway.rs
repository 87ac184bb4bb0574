//! Order gateway: the single choke-point between intents and the venue.
//!
//! `submit` combines, in order:
//!
//! 1. the [`DispatchGate`] (checked before every attempt, retries included)
//! 2. an [`IdempotencyStore`] reservation on `intent_id`
//! 3. the adapter call, classified into ok / transient / permanent
//! 4. the [`RetryPolicy`] decision, with delays spent on the injected clock
//!
//! After a place attempt whose outcome is unknown (timeout, unavailable) the
//! next attempt looks the intent up at the venue instead of resubmitting.
//!
//! Every adapter call yields exactly one [`CallRecord`] so the caller can audit
//! each one.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use rgx_schemas::{BrokerOrder, FillCursor, OrderIntent, SharedClock};

use crate::adapter::{BrokerAdapter, CallDeadline, FillStream};
use crate::error::{BrokerError, ErrorClass, ErrorKind, IdempotencyViolation, TransientKind};
use crate::idempotency::{IdempotencyStore, RecordState, Reservation};
use crate::retry::{GiveUpReason, RetryDecision, RetryPolicy};

/// Evaluates whether new exposure may reach the venue.
///
/// Implemented by the kill switch in production. Cancels are risk-reducing
/// and are not gated.
pub trait DispatchGate {
    fn blocks_dispatch(&self) -> bool;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerOp {
    Place,
    Lookup,
    Cancel,
    Query,
    ListOpen,
    Fills,
}

impl BrokerOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerOp::Place => "PLACE",
            BrokerOp::Lookup => "LOOKUP",
            BrokerOp::Cancel => "CANCEL",
            BrokerOp::Query => "QUERY",
            BrokerOp::ListOpen => "LIST_OPEN",
            BrokerOp::Fills => "FILLS",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallOutcome {
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        broker_order_id: Option<String>,
    },
    NotFound,
    Failed {
        class: ErrorClass,
        code: &'static str,
        detail: String,
    },
}

impl CallOutcome {
    fn from_error(err: &BrokerError) -> Self {
        CallOutcome::Failed {
            class: err.class(),
            code: err.kind().code(),
            detail: err.detail().to_string(),
        }
    }
}

/// One adapter call and what the gateway decided about it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub op: BrokerOp,
    /// Intent id for place/lookup, broker order id for cancel/query.
    pub target: String,
    pub attempt: u32,
    pub at_ms: i64,
    pub outcome: CallOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gave_up: Option<GiveUpReason>,
}

impl CallRecord {
    /// Audit event code, e.g. `BROKER_PLACE_OK`, `BROKER_LOOKUP_NOT_FOUND`.
    pub fn audit_code(&self) -> String {
        let result = match &self.outcome {
            CallOutcome::Ok { .. } => "OK",
            CallOutcome::NotFound => "NOT_FOUND",
            CallOutcome::Failed {
                class: ErrorClass::Transient,
                ..
            } => "TRANSIENT",
            CallOutcome::Failed {
                class: ErrorClass::Permanent,
                ..
            } => "PERMANENT",
        };
        format!("BROKER_{}_{}", self.op.as_str(), result)
    }

    fn with_decision(mut self, decision: RetryDecision) -> Self {
        match decision {
            RetryDecision::Retry(d) => {
                self.retry_delay_ms = Some(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            }
            RetryDecision::GiveUp(r) => self.gave_up = Some(r),
        }
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The venue holds exactly one order for the intent. `recovered` is true
    /// when the id came from a lookup after a lost response.
    Placed {
        broker_order_id: String,
        recovered: bool,
    },
    /// The venue refused the intent; the key is released.
    Rejected { error: BrokerError },
    /// Transient failures exhausted the retry budget. The venue outcome is
    /// unknown and the intent stays pending.
    GaveUp {
        reason: GiveUpReason,
        last_error: BrokerError,
    },
    /// The dispatch gate refused before any (further) broker call.
    Blocked,
    /// Another caller holds the reservation.
    InFlight { pending_since_ms: i64 },
}

#[derive(Clone, Debug)]
pub struct SubmitReport {
    pub intent_id: String,
    pub outcome: SubmitOutcome,
    pub calls: Vec<CallRecord>,
}

#[derive(Clone, Debug)]
pub struct RecoveryReport {
    pub intent_id: String,
    pub found: Option<BrokerOrder>,
    pub call: CallRecord,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    Rejected { error: BrokerError },
    GaveUp {
        reason: GiveUpReason,
        last_error: BrokerError,
    },
}

#[derive(Clone, Debug)]
pub struct CancelReport {
    pub broker_order_id: String,
    pub outcome: CancelOutcome,
    pub calls: Vec<CallRecord>,
}

pub struct OrderGateway<B> {
    adapter: B,
    store: IdempotencyStore,
    retry: RetryPolicy,
    deadline: CallDeadline,
    clock: SharedClock,
}

impl<B: BrokerAdapter> OrderGateway<B> {
    pub fn new(adapter: B, retry: RetryPolicy, deadline: CallDeadline, clock: SharedClock) -> Self {
        Self {
            adapter,
            store: IdempotencyStore::new(),
            retry,
            deadline,
            clock,
        }
    }

    pub fn adapter(&self) -> &B {
        &self.adapter
    }

    pub fn store(&self) -> &IdempotencyStore {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn deadline(&self) -> CallDeadline {
        self.deadline
    }

    fn record(&self, op: BrokerOp, target: &str, attempt: u32, outcome: CallOutcome) -> CallRecord {
        CallRecord {
            op,
            target: target.to_string(),
            attempt,
            at_ms: self.clock.now_ms(),
            outcome,
            retry_delay_ms: None,
            gave_up: None,
        }
    }

    fn elapsed_since(&self, started_ms: i64) -> Duration {
        let ms = self.clock.now_ms().saturating_sub(started_ms).max(0);
        Duration::from_millis(u64::try_from(ms).unwrap_or(0))
    }

    /// Submit `intent` through the gate, the idempotency store and the retry
    /// policy. Idempotency violations are contract errors and are returned
    /// as `Err`; every venue outcome is an `Ok` report.
    pub fn submit(
        &self,
        intent: &OrderIntent,
        gate: &dyn DispatchGate,
    ) -> Result<SubmitReport, IdempotencyViolation> {
        let intent_id = intent.intent_id.as_str();
        let mut calls = Vec::new();
        let done = |outcome: SubmitOutcome,
                    calls: Vec<CallRecord>|
         -> Result<SubmitReport, IdempotencyViolation> {
            Ok(SubmitReport {
                intent_id: intent_id.to_string(),
                outcome,
                calls,
            })
        };

        if gate.blocks_dispatch() {
            return done(SubmitOutcome::Blocked, calls);
        }

        let mut lookup_first = match self.store.reserve(intent_id, self.clock.now_ms())? {
            Reservation::Reserved => false,
            Reservation::Resume { .. } => true,
            Reservation::AlreadyReserved { pending_since_ms } => {
                return done(SubmitOutcome::InFlight { pending_since_ms }, calls);
            }
        };

        let started_ms = self.clock.now_ms();
        let mut attempt = 0u32;
        loop {
            if attempt > 0 && gate.blocks_dispatch() {
                self.store.unclaim(intent_id);
                return done(SubmitOutcome::Blocked, calls);
            }
            attempt += 1;

            let (op, result) = if lookup_first {
                match self.adapter.find_order_by_intent(intent_id, self.deadline) {
                    Ok(Some(order)) => {
                        calls.push(self.record(
                            BrokerOp::Lookup,
                            intent_id,
                            attempt,
                            CallOutcome::Ok {
                                broker_order_id: Some(order.broker_order_id.clone()),
                            },
                        ));
                        self.store.confirm(intent_id, &order.broker_order_id)?;
                        debug!(intent_id, broker_order_id = %order.broker_order_id, "recovered order after lost response");
                        return done(
                            SubmitOutcome::Placed {
                                broker_order_id: order.broker_order_id,
                                recovered: true,
                            },
                            calls,
                        );
                    }
                    Ok(None) => {
                        calls.push(self.record(BrokerOp::Lookup, intent_id, attempt, CallOutcome::NotFound));
                        lookup_first = false;
                        (BrokerOp::Place, self.adapter.place_order(intent, self.deadline))
                    }
                    Err(e) => (BrokerOp::Lookup, Err(e)),
                }
            } else {
                (BrokerOp::Place, self.adapter.place_order(intent, self.deadline))
            };

            let err = match result {
                Ok(broker_order_id) => {
                    calls.push(self.record(
                        op,
                        intent_id,
                        attempt,
                        CallOutcome::Ok {
                            broker_order_id: Some(broker_order_id.clone()),
                        },
                    ));
                    self.store.confirm(intent_id, &broker_order_id)?;
                    return done(
                        SubmitOutcome::Placed {
                            broker_order_id,
                            recovered: false,
                        },
                        calls,
                    );
                }
                Err(e) => e,
            };

            let decision = self.retry.decide(err.kind(), attempt, self.elapsed_since(started_ms));
            calls.push(
                self.record(op, intent_id, attempt, CallOutcome::from_error(&err))
                    .with_decision(decision),
            );

            if op == BrokerOp::Place
                && matches!(
                    err.kind(),
                    ErrorKind::Transient(TransientKind::Timeout | TransientKind::Unavailable)
                )
            {
                lookup_first = true;
            }

            match decision {
                RetryDecision::Retry(delay) => {
                    debug!(intent_id, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying broker call");
                    self.clock.sleep(delay);
                }
                RetryDecision::GiveUp(GiveUpReason::PermanentError) if op == BrokerOp::Place => {
                    self.store.release_on_permanent_failure(intent_id)?;
                    warn!(intent_id, error = %err, "intent rejected by venue");
                    return done(SubmitOutcome::Rejected { error: err }, calls);
                }
                RetryDecision::GiveUp(reason) => {
                    self.store.unclaim(intent_id);
                    warn!(intent_id, attempt, ?reason, error = %err, "giving up on broker call");
                    return done(
                        SubmitOutcome::GaveUp {
                            reason,
                            last_error: err,
                        },
                        calls,
                    );
                }
            }
        }
    }

    /// Resolve a pending intent by lookup only. Never places: the intent that
    /// produced it may be stale by now. `None` when there is nothing to do.
    pub fn recover(&self, intent_id: &str) -> Result<Option<RecoveryReport>, IdempotencyViolation> {
        match self.store.get(intent_id) {
            None => {
                return Err(IdempotencyViolation::UnknownIntent {
                    intent_id: intent_id.to_string(),
                })
            }
            Some(rec) if rec.state != RecordState::Pending => return Ok(None),
            Some(_) => {}
        }
        if !matches!(
            self.store.reserve(intent_id, self.clock.now_ms())?,
            Reservation::Resume { .. }
        ) {
            return Ok(None);
        }
        let (found, call) = match self.adapter.find_order_by_intent(intent_id, self.deadline) {
            Ok(Some(order)) => {
                self.store.confirm(intent_id, &order.broker_order_id)?;
                let call = self.record(
                    BrokerOp::Lookup,
                    intent_id,
                    1,
                    CallOutcome::Ok {
                        broker_order_id: Some(order.broker_order_id.clone()),
                    },
                );
                (Some(order), call)
            }
            Ok(None) => {
                self.store.unclaim(intent_id);
                (None, self.record(BrokerOp::Lookup, intent_id, 1, CallOutcome::NotFound))
            }
            Err(e) => {
                self.store.unclaim(intent_id);
                (None, self.record(BrokerOp::Lookup, intent_id, 1, CallOutcome::from_error(&e)))
            }
        };
        Ok(Some(RecoveryReport {
            intent_id: intent_id.to_string(),
            found,
            call,
        }))
    }

    /// Cancel with the same retry policy. Not gated.
    pub fn cancel(&self, broker_order_id: &str) -> CancelReport {
        let mut calls = Vec::new();
        let started_ms = self.clock.now_ms();
        let mut attempt = 0u32;
        let outcome = loop {
            attempt += 1;
            match self.adapter.cancel_order(broker_order_id, self.deadline) {
                Ok(()) => {
                    calls.push(self.record(
                        BrokerOp::Cancel,
                        broker_order_id,
                        attempt,
                        CallOutcome::Ok {
                            broker_order_id: Some(broker_order_id.to_string()),
                        },
                    ));
                    break CancelOutcome::Canceled;
                }
                Err(err) => {
                    let decision = self.retry.decide(err.kind(), attempt, self.elapsed_since(started_ms));
                    calls.push(
                        self.record(BrokerOp::Cancel, broker_order_id, attempt, CallOutcome::from_error(&err))
                            .with_decision(decision),
                    );
                    match decision {
                        RetryDecision::Retry(delay) => self.clock.sleep(delay),
                        RetryDecision::GiveUp(GiveUpReason::PermanentError) => {
                            break CancelOutcome::Rejected { error: err }
                        }
                        RetryDecision::GiveUp(reason) => {
                            warn!(broker_order_id, ?reason, error = %err, "cancel gave up");
                            break CancelOutcome::GaveUp {
                                reason,
                                last_error: err,
                            };
                        }
                    }
                }
            }
        };
        CancelReport {
            broker_order_id: broker_order_id.to_string(),
            outcome,
            calls,
        }
    }

    /// Single-shot status query. Reads are retried on the next step, not here.
    pub fn query_order(&self, broker_order_id: &str) -> (Result<BrokerOrder, BrokerError>, CallRecord) {
        let result = self.adapter.query_order(broker_order_id, self.deadline);
        let outcome = match &result {
            Ok(o) => CallOutcome::Ok {
                broker_order_id: Some(o.broker_order_id.clone()),
            },
            Err(e) => CallOutcome::from_error(e),
        };
        let rec = self.record(BrokerOp::Query, broker_order_id, 1, outcome);
        (result, rec)
    }

    pub fn list_open_orders(&self) -> (Result<Vec<BrokerOrder>, BrokerError>, CallRecord) {
        let result = self.adapter.list_open_orders(self.deadline);
        let outcome = match &result {
            Ok(_) => CallOutcome::Ok { broker_order_id: None },
            Err(e) => CallOutcome::from_error(e),
        };
        let rec = self.record(BrokerOp::ListOpen, "*", 1, outcome);
        (result, rec)
    }

    pub fn fetch_fills(&self, since: FillCursor) -> (Result<FillStream, BrokerError>, CallRecord) {
        let result = self.adapter.iter_fills(since, self.deadline);
        let outcome = match &result {
            Ok(_) => CallOutcome::Ok { broker_order_id: None },
            Err(e) => CallOutcome::from_error(e),
        };
        let rec = self.record(BrokerOp::Fills, &since.position().to_string(), 1, outcome);
        (result, rec)
    }
}
