use std::collections::BTreeMap;

use rgx_schemas::{BrokerOrder, Fill, Instrument, Side, MICROS_PER_UNIT};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FillApply {
    Applied,
    /// Same `fill_id` seen before; ignored.
    Duplicate,
    /// Same `fill_id` but different content. Ignored, and counted, because
    /// the first delivery wins.
    Conflicting,
}

/// Point in ingestion order. Fills applied after the mark are excluded by
/// the `*_at` folds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TallyMark(u64);

impl TallyMark {
    /// Includes every fill ever applied.
    pub const LATEST: TallyMark = TallyMark(u64::MAX);
}

#[derive(Clone, Debug)]
struct OrderRef {
    instrument: Instrument,
    side: Side,
}

#[derive(Clone, Debug)]
struct Entry {
    fill: Fill,
    ordinal: u64,
}

/// Deduplicated, order-independent fold of fills.
///
/// Keyed by `fill_id` in a `BTreeMap`, so any permutation of the same
/// deliveries (with any number of replays) yields the same tally.
#[derive(Clone, Debug, Default)]
pub struct FillTally {
    fills: BTreeMap<String, Entry>,
    orders: BTreeMap<String, OrderRef>,
    next_ordinal: u64,
    duplicates_ignored: u64,
    conflicting: u64,
}

impl FillTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute a broker order to an instrument and side. Fills may arrive
    /// before or after registration.
    pub fn register_order(&mut self, broker_order_id: &str, instrument: &str, side: Side) {
        self.orders.insert(
            broker_order_id.to_string(),
            OrderRef {
                instrument: instrument.to_string(),
                side,
            },
        );
    }

    pub fn apply(&mut self, fill: Fill) -> FillApply {
        if let Some(seen) = self.fills.get(&fill.fill_id) {
            if seen.fill == fill {
                self.duplicates_ignored += 1;
                return FillApply::Duplicate;
            }
            self.conflicting += 1;
            return FillApply::Conflicting;
        }
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.fills.insert(fill.fill_id.clone(), Entry { fill, ordinal });
        FillApply::Applied
    }

    /// Everything applied so far is at or before the returned mark.
    pub fn mark(&self) -> TallyMark {
        TallyMark(self.next_ordinal)
    }

    pub fn len(&self) -> usize {
        self.fills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fills.is_empty()
    }

    pub fn duplicates_ignored(&self) -> u64 {
        self.duplicates_ignored
    }

    pub fn conflicting(&self) -> u64 {
        self.conflicting
    }

    fn upto(&self, mark: TallyMark) -> impl Iterator<Item = &Fill> {
        self.fills
            .values()
            .filter(move |e| e.ordinal < mark.0)
            .map(|e| &e.fill)
    }

    /// Unsigned filled quantity for one order.
    pub fn filled_qty(&self, broker_order_id: &str) -> i64 {
        self.filled_qty_at(broker_order_id, TallyMark::LATEST)
    }

    pub fn filled_qty_at(&self, broker_order_id: &str, mark: TallyMark) -> i64 {
        self.upto(mark)
            .filter(|f| f.broker_order_id == broker_order_id)
            .map(|f| f.qty_micros)
            .sum()
    }

    /// Signed position per instrument over attributable fills.
    pub fn positions(&self) -> BTreeMap<Instrument, i64> {
        self.positions_at(TallyMark::LATEST)
    }

    pub fn positions_at(&self, mark: TallyMark) -> BTreeMap<Instrument, i64> {
        let mut out = BTreeMap::new();
        for f in self.upto(mark) {
            if let Some(o) = self.orders.get(&f.broker_order_id) {
                *out.entry(o.instrument.clone()).or_insert(0) += o.side.sign() * f.qty_micros;
            }
        }
        out
    }

    /// Cash change implied by attributable fills: buys pay, sells receive.
    pub fn cash_delta_micros(&self) -> i64 {
        let mut total: i128 = 0;
        for f in self.upto(TallyMark::LATEST) {
            if let Some(o) = self.orders.get(&f.broker_order_id) {
                let notional = i128::from(f.qty_micros) * i128::from(f.price_micros)
                    / i128::from(MICROS_PER_UNIT);
                total -= i128::from(o.side.sign()) * notional;
            }
        }
        i64::try_from(total).unwrap_or(if total < 0 { i64::MIN } else { i64::MAX })
    }

    /// Fills whose broker order was never registered.
    pub fn orphan_fills(&self) -> Vec<&Fill> {
        self.upto(TallyMark::LATEST)
            .filter(|f| !self.orders.contains_key(&f.broker_order_id))
            .collect()
    }

    /// Orders credited locally with more than the venue reports filled.
    ///
    /// Every fill applied before `mark` is already reflected in a snapshot
    /// read after it, so local > broker means one execution was credited
    /// twice (e.g. redelivered under a new `fill_id`).
    pub fn over_credited(&self, snapshots: &[BrokerOrder], mark: TallyMark) -> Vec<String> {
        snapshots
            .iter()
            .filter(|s| self.filled_qty_at(&s.broker_order_id, mark) > s.filled_qty_micros)
            .map(|s| s.broker_order_id.clone())
            .collect()
    }
}
