//! Deterministic in-memory venue.
//!
//! - `broker_order_id` is `SIM-000001`, `SIM-000002`, ... in acceptance order.
//! - A second `place_order` for a known `intent_id` returns the existing id
//!   (client order id de-duplication, as real venues do).
//! - The order lifecycle runs on the injected clock: an accepted order is
//!   acknowledged after `ack_latency_ms` and fully filled `fill_latency_ms`
//!   later at the instrument's mark (or its limit price). Progress is applied
//!   lazily at the start of every call, so tests move time and observe.
//! - Failures are scripted per operation with [`SimulatedBroker::script`].
//! - No randomness.

mod fault;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use rgx_execution::{
    BrokerAdapter, BrokerError, CallDeadline, FillStream, LifecycleEvent, OrderLifecycle,
    PermanentKind,
};
use rgx_schemas::{
    BrokerOrder, Fill, FillCursor, OrderIntent, OrderStatus, OrderType, SharedClock, Side,
    MICROS_PER_UNIT,
};

pub use fault::{Fault, SimOp};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimConfig {
    pub ack_latency_ms: i64,
    /// `None` leaves acknowledged orders working until filled by hand.
    pub fill_latency_ms: Option<i64>,
    /// Simulated round trip per call, compared against the caller deadline.
    pub call_latency: Duration,
    /// Enables the buying-power check on buys.
    pub starting_cash_micros: Option<i64>,
    /// Fill price for market orders on instruments without a mark.
    pub default_price_micros: i64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            ack_latency_ms: 0,
            fill_latency_ms: Some(0),
            call_latency: Duration::ZERO,
            starting_cash_micros: None,
            default_price_micros: MICROS_PER_UNIT,
        }
    }
}

/// One observed venue-side status change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChange {
    pub broker_order_id: String,
    pub status: OrderStatus,
    pub at_ms: i64,
}

#[derive(Debug)]
struct SimOrder {
    life: OrderLifecycle,
    accepted_at_ms: i64,
}

#[derive(Debug, Default)]
struct Venue {
    orders: BTreeMap<String, SimOrder>,
    by_intent: BTreeMap<String, String>,
    next_order: u64,
    next_fill: u64,
    deliveries: Vec<Fill>,
    faults: BTreeMap<SimOp, VecDeque<Fault>>,
    marks: BTreeMap<String, i64>,
    cash_micros: Option<i64>,
    place_calls: u64,
    history: Vec<StatusChange>,
}

pub struct SimulatedBroker {
    cfg: SimConfig,
    clock: SharedClock,
    venue: Mutex<Venue>,
}

impl SimulatedBroker {
    pub fn new(cfg: SimConfig, clock: SharedClock) -> Self {
        let venue = Venue {
            cash_micros: cfg.starting_cash_micros,
            ..Venue::default()
        };
        Self {
            cfg,
            clock,
            venue: Mutex::new(venue),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Venue> {
        self.venue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a one-shot fault for the next call of `op`.
    pub fn script(&self, op: SimOp, fault: Fault) {
        self.lock().faults.entry(op).or_default().push_back(fault);
    }

    pub fn set_mark(&self, instrument: &str, price_micros: i64) {
        self.lock().marks.insert(instrument.to_string(), price_micros);
    }

    pub fn place_calls(&self) -> u64 {
        self.lock().place_calls
    }

    pub fn orders_created(&self) -> usize {
        self.lock().orders.len()
    }

    pub fn orders_for_intent(&self, intent_id: &str) -> usize {
        self.lock()
            .orders
            .values()
            .filter(|o| o.life.intent().intent_id == intent_id)
            .count()
    }

    pub fn status_history(&self) -> Vec<StatusChange> {
        self.lock().history.clone()
    }

    pub fn cash_micros(&self) -> Option<i64> {
        self.lock().cash_micros
    }

    /// Execute a fill by hand (partial fills, late fills).
    pub fn inject_fill(
        &self,
        broker_order_id: &str,
        qty_micros: i64,
        price_micros: i64,
    ) -> Result<Fill, BrokerError> {
        let now = self.clock.now_ms();
        let mut v = self.lock();
        v.advance(&self.cfg, now);
        v.fill(broker_order_id, qty_micros, price_micros, now)
    }

    /// Deliver an already-delivered fill again.
    pub fn replay_fill(&self, fill_id: &str) -> bool {
        let mut v = self.lock();
        match v.deliveries.iter().find(|f| f.fill_id == fill_id).cloned() {
            Some(f) => {
                v.deliveries.push(f);
                true
            }
            None => false,
        }
    }

    /// Deliver an execution again under a fresh `fill_id` without touching
    /// the order, as a venue that re-sends an execution report with a new id.
    pub fn redeliver_under_new_id(&self, fill_id: &str) -> Option<String> {
        let mut v = self.lock();
        let mut f = v.deliveries.iter().find(|f| f.fill_id == fill_id).cloned()?;
        v.next_fill += 1;
        f.fill_id = format!("SIM-F{:06}", v.next_fill);
        f.seq = v.next_fill;
        let id = f.fill_id.clone();
        v.deliveries.push(f);
        Some(id)
    }

    /// Reverse the delivery order of everything after `from`.
    pub fn reverse_deliveries_from(&self, from: FillCursor) {
        let mut v = self.lock();
        let start = usize::try_from(from.position()).unwrap_or(usize::MAX).min(v.deliveries.len());
        v.deliveries[start..].reverse();
    }

    /// Create a working order the session never asked for (manual venue
    /// activity, another system on the same account).
    pub fn inject_external_order(&self, intent: &OrderIntent) -> String {
        let now = self.clock.now_ms();
        let mut v = self.lock();
        v.accept(intent, now)
    }

    fn take_fault(&self, v: &mut Venue, op: SimOp, deadline: CallDeadline) -> Option<Fault> {
        if let Some(f) = v.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            return Some(f);
        }
        if deadline.exceeded_by(self.cfg.call_latency) {
            // The venue is slow, not down: writes land, the reply misses the deadline.
            return Some(Fault::AcceptThenTimeout);
        }
        None
    }

    /// Shared prologue: advance the lifecycle, then apply any fault that is not
    /// "processed but lost".
    fn enter(&self, op: SimOp, deadline: CallDeadline) -> Result<(MutexGuard<'_, Venue>, i64, bool), BrokerError> {
        let now = self.clock.now_ms();
        let mut v = self.lock();
        v.advance(&self.cfg, now);
        match self.take_fault(&mut v, op, deadline) {
            None => Ok((v, now, false)),
            Some(Fault::AcceptThenTimeout) if op == SimOp::Place || op == SimOp::Cancel => {
                Ok((v, now, true))
            }
            Some(f) => Err(f.into_error(op)),
        }
    }
}

impl Venue {
    fn record(&mut self, broker_order_id: &str, status: OrderStatus, at_ms: i64) {
        self.history.push(StatusChange {
            broker_order_id: broker_order_id.to_string(),
            status,
            at_ms,
        });
    }

    fn accept(&mut self, intent: &OrderIntent, now: i64) -> String {
        self.next_order += 1;
        let id = format!("SIM-{:06}", self.next_order);
        self.orders.insert(
            id.clone(),
            SimOrder {
                life: OrderLifecycle::new(id.clone(), intent.clone()),
                accepted_at_ms: now,
            },
        );
        self.by_intent.insert(intent.intent_id.clone(), id.clone());
        self.record(&id, OrderStatus::New, now);
        debug!(broker_order_id = %id, intent_id = %intent.intent_id, "sim accepted order");
        id
    }

    fn fill_price(&self, cfg: &SimConfig, intent: &OrderIntent) -> Option<i64> {
        let mark = self.marks.get(&intent.instrument).copied();
        match (intent.order_type, intent.limit_price_micros) {
            (OrderType::Limit, Some(limit)) => match (intent.side, mark) {
                (_, None) => Some(limit),
                (Side::Buy, Some(m)) if m <= limit => Some(m),
                (Side::Sell, Some(m)) if m >= limit => Some(m),
                _ => None,
            },
            _ => Some(mark.unwrap_or(cfg.default_price_micros)),
        }
    }

    /// Move every working order forward to `now`.
    fn advance(&mut self, cfg: &SimConfig, now: i64) {
        let ids: Vec<String> = self
            .orders
            .iter()
            .filter(|(_, o)| o.life.status().is_open())
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            let (status, acked_at, intent) = match self.orders.get(&id) {
                Some(o) => (
                    o.life.status(),
                    o.accepted_at_ms + cfg.ack_latency_ms,
                    o.life.intent().clone(),
                ),
                None => continue,
            };
            if status == OrderStatus::New && now >= acked_at {
                if let Some(o) = self.orders.get_mut(&id) {
                    if o.life.apply(&LifecycleEvent::Ack).is_ok() {
                        self.record(&id, OrderStatus::Ack, acked_at);
                    }
                }
            }
            let Some(fill_latency) = cfg.fill_latency_ms else { continue };
            let fill_at = acked_at + fill_latency;
            if now < fill_at {
                continue;
            }
            let remaining = self
                .orders
                .get(&id)
                .map(|o| o.life.remaining_qty_micros())
                .unwrap_or(0);
            if remaining <= 0 {
                continue;
            }
            // A limit the mark has not crossed stays working.
            let Some(px) = self.fill_price(cfg, &intent) else { continue };
            if let Err(e) = self.fill(&id, remaining, px, fill_at) {
                debug!(broker_order_id = %id, error = %e, "sim auto-fill refused");
            }
        }
    }

    fn fill(
        &mut self,
        broker_order_id: &str,
        qty_micros: i64,
        price_micros: i64,
        ts_ms: i64,
    ) -> Result<Fill, BrokerError> {
        self.next_fill += 1;
        let fill = Fill {
            fill_id: format!("SIM-F{:06}", self.next_fill),
            broker_order_id: broker_order_id.to_string(),
            qty_micros,
            price_micros,
            ts_ms,
            seq: self.next_fill,
        };
        let order = self.orders.get_mut(broker_order_id).ok_or_else(|| {
            BrokerError::permanent(PermanentKind::UnknownOrder, broker_order_id.to_string())
        })?;
        order
            .life
            .apply(&LifecycleEvent::Fill {
                fill_id: fill.fill_id.clone(),
                qty_micros,
                price_micros,
            })
            .map_err(|e| BrokerError::permanent(PermanentKind::InvalidParameters, e.to_string()))?;
        let side = order.life.intent().side;
        let status = order.life.status();
        if let Some(cash) = self.cash_micros.as_mut() {
            let notional = notional_micros(qty_micros, price_micros);
            *cash -= side.sign() * notional;
        }
        self.record(broker_order_id, status, ts_ms);
        self.deliveries.push(fill.clone());
        Ok(fill)
    }
}

fn notional_micros(qty_micros: i64, price_micros: i64) -> i64 {
    let n = i128::from(qty_micros) * i128::from(price_micros) / i128::from(MICROS_PER_UNIT);
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl BrokerAdapter for SimulatedBroker {
    fn place_order(&self, intent: &OrderIntent, deadline: CallDeadline) -> Result<String, BrokerError> {
        let now = self.clock.now_ms();
        let mut v = self.lock();
        v.place_calls += 1;
        v.advance(&self.cfg, now);
        let lose_response = match self.take_fault(&mut v, SimOp::Place, deadline) {
            None => false,
            Some(Fault::AcceptThenTimeout) => true,
            Some(f) => return Err(f.into_error(SimOp::Place)),
        };

        let id = match v.by_intent.get(&intent.intent_id) {
            Some(existing) => existing.clone(),
            None => {
                intent
                    .validate()
                    .map_err(|e| BrokerError::permanent(PermanentKind::InvalidParameters, e.to_string()))?;
                if let (Some(cash), Side::Buy) = (v.cash_micros, intent.side) {
                    let px = intent
                        .limit_price_micros
                        .or_else(|| v.marks.get(&intent.instrument).copied())
                        .unwrap_or(self.cfg.default_price_micros);
                    let need = notional_micros(intent.qty_micros, px);
                    if need > cash {
                        return Err(BrokerError::permanent(
                            PermanentKind::InsufficientBalance,
                            format!("need {need} micros, have {cash}"),
                        ));
                    }
                }
                v.accept(intent, now)
            }
        };

        if lose_response {
            return Err(Fault::AcceptThenTimeout.into_error(SimOp::Place));
        }
        Ok(id)
    }

    fn cancel_order(&self, broker_order_id: &str, deadline: CallDeadline) -> Result<(), BrokerError> {
        let (mut v, now, lose_response) = self.enter(SimOp::Cancel, deadline)?;
        let order = v.orders.get_mut(broker_order_id).ok_or_else(|| {
            BrokerError::permanent(PermanentKind::UnknownOrder, broker_order_id.to_string())
        })?;
        let changed = order
            .life
            .apply(&LifecycleEvent::Cancel)
            .map_err(|e| BrokerError::permanent(PermanentKind::Rejected, e.to_string()))?;
        if changed == rgx_execution::Applied::Changed {
            v.record(broker_order_id, OrderStatus::Canceled, now);
        }
        if lose_response {
            return Err(Fault::AcceptThenTimeout.into_error(SimOp::Cancel));
        }
        Ok(())
    }

    fn query_order(&self, broker_order_id: &str, deadline: CallDeadline) -> Result<BrokerOrder, BrokerError> {
        let (v, _, _) = self.enter(SimOp::Query, deadline)?;
        v.orders
            .get(broker_order_id)
            .map(|o| o.life.snapshot())
            .ok_or_else(|| BrokerError::permanent(PermanentKind::UnknownOrder, broker_order_id.to_string()))
    }

    fn find_order_by_intent(
        &self,
        intent_id: &str,
        deadline: CallDeadline,
    ) -> Result<Option<BrokerOrder>, BrokerError> {
        let (v, _, _) = self.enter(SimOp::Lookup, deadline)?;
        Ok(v.by_intent
            .get(intent_id)
            .and_then(|id| v.orders.get(id))
            .map(|o| o.life.snapshot()))
    }

    fn list_open_orders(&self, deadline: CallDeadline) -> Result<Vec<BrokerOrder>, BrokerError> {
        let (v, _, _) = self.enter(SimOp::ListOpen, deadline)?;
        Ok(v.orders
            .values()
            .filter(|o| o.life.status().is_open())
            .map(|o| o.life.snapshot())
            .collect())
    }

    fn iter_fills(&self, since: FillCursor, deadline: CallDeadline) -> Result<FillStream, BrokerError> {
        let (v, _, _) = self.enter(SimOp::Fills, deadline)?;
        let start = usize::try_from(since.position()).unwrap_or(usize::MAX);
        let batch = v.deliveries.get(start..).map(<[Fill]>::to_vec).unwrap_or_default();
        Ok(FillStream::new(since, batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgx_schemas::FixedClock;
    use std::sync::Arc;

    const DL: CallDeadline = CallDeadline {
        timeout: Duration::from_millis(100),
    };

    fn broker(cfg: SimConfig) -> (SimulatedBroker, Arc<FixedClock>) {
        let clock = FixedClock::shared(0);
        (SimulatedBroker::new(cfg, clock.clone()), clock)
    }

    fn buy(id: &str) -> OrderIntent {
        OrderIntent::market(id, "BTC-USD", Side::Buy, 2 * MICROS_PER_UNIT, 0)
    }

    #[test]
    fn lifecycle_follows_clock() {
        let (b, clock) = broker(SimConfig {
            ack_latency_ms: 10,
            fill_latency_ms: Some(20),
            ..SimConfig::default()
        });
        let id = b.place_order(&buy("I1"), DL).unwrap();
        assert_eq!(id, "SIM-000001");
        assert_eq!(b.query_order(&id, DL).unwrap().status, OrderStatus::New);

        clock.advance_ms(10);
        assert_eq!(b.query_order(&id, DL).unwrap().status, OrderStatus::Ack);

        clock.advance_ms(20);
        let o = b.query_order(&id, DL).unwrap();
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(o.filled_qty_micros, 2 * MICROS_PER_UNIT);

        let statuses: Vec<_> = b.status_history().into_iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![OrderStatus::New, OrderStatus::Ack, OrderStatus::Filled]);
    }

    #[test]
    fn same_intent_returns_same_order() {
        let (b, _) = broker(SimConfig::default());
        let a = b.place_order(&buy("I1"), DL).unwrap();
        let c = b.place_order(&buy("I1"), DL).unwrap();
        assert_eq!(a, c);
        assert_eq!(b.orders_created(), 1);
        assert_eq!(b.place_calls(), 2);
    }

    #[test]
    fn lost_response_still_creates_order() {
        let (b, _) = broker(SimConfig::default());
        b.script(SimOp::Place, Fault::AcceptThenTimeout);
        let err = b.place_order(&buy("I1"), DL).unwrap_err();
        assert!(err.is_transient());
        let found = b.find_order_by_intent("I1", DL).unwrap().unwrap();
        assert_eq!(found.broker_order_id, "SIM-000001");
    }

    #[test]
    fn slow_venue_times_out_against_deadline() {
        let (b, _) = broker(SimConfig {
            call_latency: Duration::from_millis(500),
            ..SimConfig::default()
        });
        assert!(b.list_open_orders(DL).unwrap_err().is_transient());
        assert!(b.place_order(&buy("I1"), DL).is_err());
        assert_eq!(b.orders_created(), 1);
    }

    #[test]
    fn buying_power_is_checked() {
        let (b, _) = broker(SimConfig {
            starting_cash_micros: Some(MICROS_PER_UNIT),
            ..SimConfig::default()
        });
        let err = b.place_order(&buy("I1"), DL).unwrap_err();
        assert_eq!(
            err.kind(),
            rgx_execution::ErrorKind::Permanent(PermanentKind::InsufficientBalance)
        );
        assert_eq!(b.orders_created(), 0);
    }

    #[test]
    fn fills_stream_from_cursor_with_replays() {
        let (b, _) = broker(SimConfig {
            fill_latency_ms: None,
            ..SimConfig::default()
        });
        let id = b.place_order(&buy("I1"), DL).unwrap();
        let f1 = b.inject_fill(&id, MICROS_PER_UNIT, 100).unwrap();
        b.inject_fill(&id, MICROS_PER_UNIT, 110).unwrap();
        assert!(b.replay_fill(&f1.fill_id));

        let mut s = b.iter_fills(FillCursor::START, DL).unwrap();
        assert_eq!(s.next().unwrap().fill_id, f1.fill_id);
        let resume = s.cursor();
        let rest: Vec<_> = b.iter_fills(resume, DL).unwrap().collect();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].fill_id, f1.fill_id);

        let o = b.query_order(&id, DL).unwrap();
        assert_eq!(o.filled_qty_micros, 2 * MICROS_PER_UNIT);
        assert_eq!(o.avg_price_micros, Some(105));
    }

    #[test]
    fn redelivery_under_new_id_leaves_order_alone() {
        let (b, _) = broker(SimConfig {
            fill_latency_ms: None,
            ..SimConfig::default()
        });
        let id = b.place_order(&buy("I1"), DL).unwrap();
        let f1 = b.inject_fill(&id, MICROS_PER_UNIT, 100).unwrap();
        let again = b.redeliver_under_new_id(&f1.fill_id).unwrap();
        assert_ne!(again, f1.fill_id);
        assert!(b.redeliver_under_new_id("nope").is_none());

        let fills: Vec<_> = b.iter_fills(FillCursor::START, DL).unwrap().collect();
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[1].qty_micros, f1.qty_micros);
        assert_eq!(b.query_order(&id, DL).unwrap().filled_qty_micros, MICROS_PER_UNIT);
    }

    #[test]
    fn cancel_is_idempotent() {
        let (b, _) = broker(SimConfig {
            fill_latency_ms: None,
            ..SimConfig::default()
        });
        let id = b.place_order(&buy("I1"), DL).unwrap();
        b.cancel_order(&id, DL).unwrap();
        b.cancel_order(&id, DL).unwrap();
        assert_eq!(b.query_order(&id, DL).unwrap().status, OrderStatus::Canceled);
        assert!(b.list_open_orders(DL).unwrap().is_empty());
        assert!(b.cancel_order("SIM-999999", DL).is_err());
    }
}
