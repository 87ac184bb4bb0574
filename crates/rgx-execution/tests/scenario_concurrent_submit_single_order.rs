//! Scenario: many callers race to submit the same intent.
//!
//! # Invariants under test
//! - Against a venue with no dedupe of its own, exactly one order exists
//!   after any number of concurrent submissions of one intent.
//! - Every loser sees either `InFlight` (the winner still holds the
//!   reservation) or `DuplicateIntent` (the winner already confirmed).
//! - Distinct intents submitted concurrently each get their own order.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use rgx_execution::{
    BrokerAdapter, BrokerError, CallDeadline, DispatchGate, FillStream, IdempotencyViolation,
    OrderGateway, RetryPolicy, SubmitOutcome,
};
use rgx_schemas::{BrokerOrder, FillCursor, FixedClock, OrderIntent, OrderStatus, SharedClock, Side};

/// Creates a new order on every place call, however often it is asked.
#[derive(Default)]
struct NaiveVenue {
    orders: Mutex<Vec<BrokerOrder>>,
    place_calls: AtomicU32,
}

impl BrokerAdapter for NaiveVenue {
    fn place_order(&self, intent: &OrderIntent, _: CallDeadline) -> Result<String, BrokerError> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        // Widen the race window.
        thread::sleep(Duration::from_millis(5));
        let mut orders = self.orders.lock().unwrap();
        let id = format!("V{}", orders.len() + 1);
        orders.push(BrokerOrder {
            broker_order_id: id.clone(),
            intent_id: intent.intent_id.clone(),
            instrument: intent.instrument.clone(),
            side: intent.side,
            qty_micros: intent.qty_micros,
            status: OrderStatus::New,
            filled_qty_micros: 0,
            avg_price_micros: None,
        });
        Ok(id)
    }

    fn cancel_order(&self, _: &str, _: CallDeadline) -> Result<(), BrokerError> {
        Ok(())
    }

    fn query_order(&self, id: &str, _: CallDeadline) -> Result<BrokerOrder, BrokerError> {
        self.orders
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.broker_order_id == id)
            .cloned()
            .ok_or_else(|| BrokerError::permanent(rgx_execution::PermanentKind::UnknownOrder, id))
    }

    fn find_order_by_intent(&self, intent_id: &str, _: CallDeadline) -> Result<Option<BrokerOrder>, BrokerError> {
        Ok(self
            .orders
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.intent_id == intent_id)
            .cloned())
    }

    fn list_open_orders(&self, _: CallDeadline) -> Result<Vec<BrokerOrder>, BrokerError> {
        Ok(self.orders.lock().unwrap().clone())
    }

    fn iter_fills(&self, since: FillCursor, _: CallDeadline) -> Result<FillStream, BrokerError> {
        Ok(FillStream::empty(since))
    }
}

struct Open;

impl DispatchGate for Open {
    fn blocks_dispatch(&self) -> bool {
        false
    }
}

fn gateway() -> Arc<OrderGateway<NaiveVenue>> {
    let clock: SharedClock = FixedClock::shared(0);
    Arc::new(OrderGateway::new(
        NaiveVenue::default(),
        RetryPolicy::default(),
        CallDeadline::from_millis(1_000),
        clock,
    ))
}

#[test]
fn racing_submits_of_one_intent_create_one_order() {
    const THREADS: usize = 16;
    let gw = gateway();
    let barrier = Arc::new(Barrier::new(THREADS));
    let intent = OrderIntent::market("I1", "AAPL", Side::Buy, 1_000_000, 0);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let gw = Arc::clone(&gw);
            let barrier = Arc::clone(&barrier);
            let intent = intent.clone();
            thread::spawn(move || {
                barrier.wait();
                gw.submit(&intent, &Open)
            })
        })
        .collect();

    let mut placed = 0;
    for h in handles {
        match h.join().unwrap() {
            Ok(r) => match r.outcome {
                SubmitOutcome::Placed { .. } => placed += 1,
                SubmitOutcome::InFlight { .. } => {}
                other => panic!("unexpected outcome {other:?}"),
            },
            Err(IdempotencyViolation::DuplicateIntent { .. }) => {}
            Err(e) => panic!("unexpected violation {e}"),
        }
    }

    assert_eq!(placed, 1);
    assert_eq!(gw.adapter().place_calls.load(Ordering::SeqCst), 1);
    assert_eq!(gw.adapter().orders.lock().unwrap().len(), 1);
    assert_eq!(gw.store().len(), 1);
}

#[test]
fn distinct_intents_each_get_one_order() {
    const THREADS: usize = 8;
    let gw = gateway();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let gw = Arc::clone(&gw);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let intent = OrderIntent::market(format!("I{i}"), "AAPL", Side::Buy, 1_000_000, 0);
                barrier.wait();
                gw.submit(&intent, &Open)
            })
        })
        .collect();

    for h in handles {
        let r = h.join().unwrap().unwrap();
        assert!(matches!(r.outcome, SubmitOutcome::Placed { recovered: false, .. }));
    }
    assert_eq!(gw.adapter().orders.lock().unwrap().len(), THREADS);
    assert_eq!(gw.store().pending_intents(), Vec::<String>::new());
}
