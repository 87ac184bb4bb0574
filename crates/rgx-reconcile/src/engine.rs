use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use rgx_integrity::{KillSwitch, Transition, TripReason};
use rgx_schemas::BrokerOrder;

use crate::tally::{FillTally, TallyMark};
use crate::types::{Overfill, PositionMismatch, ReconcileReport, UnknownOrder};

/// Everything one reconciliation pass looks at. Borrowed, never mutated.
pub struct ReconcileInput<'a> {
    pub tally: &'a FillTally,
    /// Tally mark taken before `snapshots` were read. Fills applied after it
    /// may or may not be reflected in the snapshots, so the local side is the
    /// range between the two folds. `None` compares against the latest fold.
    pub snapshot_mark: Option<TallyMark>,
    /// Latest snapshot of every order this session placed, terminal or not.
    pub snapshots: &'a [BrokerOrder],
    /// The venue's working orders, for unknown-order detection.
    pub open_orders: &'a [BrokerOrder],
    /// Venue snapshots of orders that produced fills the tally cannot
    /// attribute. An orphan fill without a snapshot here is unknown.
    pub orphan_orders: &'a [BrokerOrder],
    /// Every intent id this session has submitted, pending ones included.
    pub known_intents: &'a BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Reconciler {
    /// Tolerated |local - broker| per instrument, in micros.
    pub epsilon_micros: i64,
}

impl Reconciler {
    pub fn new(epsilon_micros: i64) -> Self {
        Self {
            epsilon_micros: epsilon_micros.max(0),
        }
    }

    /// Pure diff. Output is sorted, so identical inputs give identical reports.
    pub fn reconcile(&self, input: &ReconcileInput<'_>, now_ms: i64) -> ReconcileReport {
        let latest = input.tally.positions();
        let settled = match input.snapshot_mark {
            Some(m) => input.tally.positions_at(m),
            None => latest.clone(),
        };

        let mut broker: BTreeMap<String, i64> = BTreeMap::new();
        let mut overfills = Vec::new();
        for o in input.snapshots {
            *broker.entry(o.instrument.clone()).or_insert(0) += o.signed_filled_micros();
            if o.filled_qty_micros > o.qty_micros {
                overfills.push(Overfill {
                    broker_order_id: o.broker_order_id.clone(),
                    qty_micros: o.qty_micros,
                    filled_qty_micros: o.filled_qty_micros,
                });
            }
        }

        let instruments: BTreeSet<&String> = latest
            .keys()
            .chain(settled.keys())
            .chain(broker.keys())
            .collect();
        let mut mismatches = Vec::new();
        for inst in instruments {
            let a = settled.get(inst).copied().unwrap_or(0);
            let l = latest.get(inst).copied().unwrap_or(0);
            let b = broker.get(inst).copied().unwrap_or(0);
            let (lo, hi) = (a.min(l), a.max(l));
            if b < lo - self.epsilon_micros || b > hi + self.epsilon_micros {
                mismatches.push(PositionMismatch {
                    instrument: inst.clone(),
                    local_qty_micros: l,
                    broker_qty_micros: b,
                });
            }
        }

        let mut unknown: BTreeMap<String, UnknownOrder> = input
            .open_orders
            .iter()
            .filter(|o| !input.known_intents.contains(&o.intent_id))
            .map(|o| {
                (
                    o.broker_order_id.clone(),
                    UnknownOrder {
                        broker_order_id: o.broker_order_id.clone(),
                        intent_id: o.intent_id.clone(),
                        instrument: o.instrument.clone(),
                    },
                )
            })
            .collect();
        // Fills on orders we never placed move the account even when the
        // order is no longer working.
        for f in input.tally.orphan_fills() {
            if unknown.contains_key(&f.broker_order_id) {
                continue;
            }
            let snap = input
                .orphan_orders
                .iter()
                .find(|o| o.broker_order_id == f.broker_order_id);
            // Ours but not yet attributed: an intent still awaiting lookup.
            // A second venue order for an intent we already track is not.
            if let Some(o) = snap {
                let tracked = input.snapshots.iter().any(|s| s.intent_id == o.intent_id);
                if input.known_intents.contains(&o.intent_id) && !tracked {
                    continue;
                }
            }
            unknown.insert(
                f.broker_order_id.clone(),
                UnknownOrder {
                    broker_order_id: f.broker_order_id.clone(),
                    intent_id: snap.map(|o| o.intent_id.clone()).unwrap_or_default(),
                    instrument: snap.map(|o| o.instrument.clone()).unwrap_or_default(),
                },
            );
        }
        overfills.sort_by(|a, b| a.broker_order_id.cmp(&b.broker_order_id));

        ReconcileReport {
            mismatches,
            unknown_orders: unknown.into_values().collect(),
            overfills,
            generated_at_ms: now_ms,
        }
    }

    /// Reconcile and trip `kill_switch` on any drift.
    pub fn reconcile_and_enforce(
        &self,
        input: &ReconcileInput<'_>,
        now_ms: i64,
        kill_switch: &mut KillSwitch,
    ) -> (ReconcileReport, Option<Transition>) {
        let report = self.reconcile(input, now_ms);
        if report.is_clean() {
            return (report, None);
        }
        warn!(
            mismatches = report.mismatches.len(),
            unknown_orders = report.unknown_orders.len(),
            overfills = report.overfills.len(),
            "reconcile drift"
        );
        let t = kill_switch.trip(TripReason::ReconcileMismatch {
            mismatches: report.total_issues(),
        });
        (report, Some(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgx_schemas::{Fill, FixedClock, OrderStatus, Side};

    fn order(id: &str, intent: &str, side: Side, qty: i64, filled: i64) -> BrokerOrder {
        BrokerOrder {
            broker_order_id: id.into(),
            intent_id: intent.into(),
            instrument: "BTC-USD".into(),
            side,
            qty_micros: qty,
            status: if filled == qty {
                OrderStatus::Filled
            } else {
                OrderStatus::Ack
            },
            filled_qty_micros: filled,
            avg_price_micros: None,
        }
    }

    fn fill(id: &str, order: &str, qty: i64) -> Fill {
        Fill {
            fill_id: id.into(),
            broker_order_id: order.into(),
            qty_micros: qty,
            price_micros: 1,
            ts_ms: 0,
            seq: 0,
        }
    }

    #[test]
    fn agreeing_views_are_clean() {
        let mut tally = FillTally::new();
        tally.register_order("B1", "BTC-USD", Side::Buy);
        tally.apply(fill("F1", "B1", 10));
        let snaps = [order("B1", "I1", Side::Buy, 10, 10)];
        let known = BTreeSet::from(["I1".to_string()]);
        let input = ReconcileInput {
            tally: &tally,
            snapshot_mark: None,
            orphan_orders: &[],
            snapshots: &snaps,
            open_orders: &[],
            known_intents: &known,
        };
        assert!(Reconciler::new(0).reconcile(&input, 7).is_clean());
    }

    #[test]
    fn missing_fill_is_a_mismatch_unless_within_epsilon() {
        let mut tally = FillTally::new();
        tally.register_order("B1", "BTC-USD", Side::Sell);
        tally.apply(fill("F1", "B1", 8));
        let snaps = [order("B1", "I1", Side::Sell, 10, 10)];
        let known = BTreeSet::from(["I1".to_string()]);
        let input = ReconcileInput {
            tally: &tally,
            snapshot_mark: None,
            orphan_orders: &[],
            snapshots: &snaps,
            open_orders: &[],
            known_intents: &known,
        };
        let r = Reconciler::new(0).reconcile(&input, 0);
        assert_eq!(
            r.mismatches,
            vec![PositionMismatch {
                instrument: "BTC-USD".into(),
                local_qty_micros: -8,
                broker_qty_micros: -10,
            }]
        );
        assert!(Reconciler::new(2).reconcile(&input, 0).is_clean());
    }

    #[test]
    fn unknown_open_order_trips() {
        let tally = FillTally::new();
        let open = [order("B7", "MANUAL", Side::Buy, 5, 0)];
        let known = BTreeSet::new();
        let input = ReconcileInput {
            tally: &tally,
            snapshot_mark: None,
            orphan_orders: &[],
            snapshots: &[],
            open_orders: &open,
            known_intents: &known,
        };
        let clock = FixedClock::shared(0);
        let mut ks = KillSwitch::new(1_000, false, clock);
        let (r, t) = Reconciler::new(0).reconcile_and_enforce(&input, 0, &mut ks);
        assert_eq!(r.unknown_orders.len(), 1);
        assert_eq!(t.map(|t| t.to), Some("TRIPPED"));
        assert!(ks.check_and_block());
    }

    #[test]
    fn fill_landing_after_the_mark_is_not_drift() {
        let mut tally = FillTally::new();
        tally.register_order("B1", "BTC-USD", Side::Buy);
        tally.apply(fill("F1", "B1", 4));
        let mark = tally.mark();
        // Snapshot read here: it may or may not include F2.
        tally.apply(fill("F2", "B1", 6));
        let known = BTreeSet::from(["I1".to_string()]);
        for broker_filled in [4, 10] {
            let snaps = [order("B1", "I1", Side::Buy, 10, broker_filled)];
            let input = ReconcileInput {
                tally: &tally,
                snapshot_mark: Some(mark),
                snapshots: &snaps,
                open_orders: &[],
                orphan_orders: &[],
                known_intents: &known,
            };
            assert!(Reconciler::new(0).reconcile(&input, 0).is_clean(), "{broker_filled}");
        }
        // Outside the range is still drift.
        let snaps = [order("B1", "I1", Side::Buy, 10, 2)];
        let input = ReconcileInput {
            tally: &tally,
            snapshot_mark: Some(mark),
            snapshots: &snaps,
            open_orders: &[],
            orphan_orders: &[],
            known_intents: &known,
        };
        assert_eq!(Reconciler::new(0).reconcile(&input, 0).mismatches.len(), 1);
    }

    #[test]
    fn orphan_fill_from_foreign_order_is_unknown() {
        let mut tally = FillTally::new();
        tally.apply(fill("F9", "B9", 5));
        let known = BTreeSet::from(["I1".to_string()]);
        let foreign = [order("B9", "MANUAL", Side::Buy, 5, 5)];
        let input = ReconcileInput {
            tally: &tally,
            snapshot_mark: None,
            snapshots: &[],
            open_orders: &[],
            orphan_orders: &foreign,
            known_intents: &known,
        };
        let r = Reconciler::new(0).reconcile(&input, 0);
        assert_eq!(
            r.unknown_orders,
            vec![UnknownOrder {
                broker_order_id: "B9".into(),
                intent_id: "MANUAL".into(),
                instrument: "BTC-USD".into(),
            }]
        );

        // Unresolvable order: still unknown, with what little we know.
        let input = ReconcileInput {
            orphan_orders: &[],
            ..input
        };
        let r = Reconciler::new(0).reconcile(&input, 0);
        assert_eq!(r.unknown_orders[0].broker_order_id, "B9");
        assert_eq!(r.unknown_orders[0].intent_id, "");
    }

    #[test]
    fn orphan_fill_of_pending_intent_is_not_unknown() {
        let mut tally = FillTally::new();
        tally.apply(fill("F1", "B1", 5));
        let known = BTreeSet::from(["I1".to_string()]);
        let pending = [order("B1", "I1", Side::Buy, 5, 5)];
        let input = ReconcileInput {
            tally: &tally,
            snapshot_mark: None,
            snapshots: &[],
            open_orders: &[],
            orphan_orders: &pending,
            known_intents: &known,
        };
        assert!(Reconciler::new(0).reconcile(&input, 0).is_clean());

        // Same intent, but we already track a different order for it.
        let tracked = [order("B0", "I1", Side::Buy, 5, 0)];
        let input = ReconcileInput {
            snapshots: &tracked,
            ..input
        };
        let r = Reconciler::new(0).reconcile(&input, 0);
        assert_eq!(r.unknown_orders.len(), 1);
        assert_eq!(r.unknown_orders[0].broker_order_id, "B1");
    }
}
