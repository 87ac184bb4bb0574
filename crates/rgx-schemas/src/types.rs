use std::fmt;

use serde::{Deserialize, Serialize};

/// Instrument identifier (e.g. "BTC-USD", "AAPL").
pub type Instrument = String;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells. Used to build signed position tallies.
    pub fn sign(&self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

/// A desired order, keyed by its idempotency key (`intent_id`).
///
/// Intents are created once by the strategy side and never mutated; every
/// component downstream borrows them. Quantity is always positive; direction
/// lives in `side`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub intent_id: String,
    pub instrument: Instrument,
    pub side: Side,
    pub qty_micros: i64,
    pub order_type: OrderType,
    #[serde(default)]
    pub limit_price_micros: Option<i64>,
    #[serde(default)]
    pub created_at_ms: i64,
}

/// Why an [`OrderIntent`] is malformed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntentError {
    EmptyIntentId,
    EmptyInstrument,
    NonPositiveQty(i64),
    LimitWithoutPrice,
    MarketWithPrice,
    NonPositivePrice(i64),
}

impl fmt::Display for IntentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentError::EmptyIntentId => write!(f, "intent_id is empty"),
            IntentError::EmptyInstrument => write!(f, "instrument is empty"),
            IntentError::NonPositiveQty(q) => write!(f, "qty_micros must be > 0 (got {q})"),
            IntentError::LimitWithoutPrice => write!(f, "limit order without limit price"),
            IntentError::MarketWithPrice => write!(f, "market order carries a limit price"),
            IntentError::NonPositivePrice(p) => {
                write!(f, "limit_price_micros must be > 0 (got {p})")
            }
        }
    }
}

impl std::error::Error for IntentError {}

impl OrderIntent {
    pub fn market(
        intent_id: impl Into<String>,
        instrument: impl Into<String>,
        side: Side,
        qty_micros: i64,
        created_at_ms: i64,
    ) -> Self {
        Self {
            intent_id: intent_id.into(),
            instrument: instrument.into(),
            side,
            qty_micros,
            order_type: OrderType::Market,
            limit_price_micros: None,
            created_at_ms,
        }
    }

    pub fn limit(
        intent_id: impl Into<String>,
        instrument: impl Into<String>,
        side: Side,
        qty_micros: i64,
        limit_price_micros: i64,
        created_at_ms: i64,
    ) -> Self {
        Self {
            intent_id: intent_id.into(),
            instrument: instrument.into(),
            side,
            qty_micros,
            order_type: OrderType::Limit,
            limit_price_micros: Some(limit_price_micros),
            created_at_ms,
        }
    }

    /// Structural validation. Venue-level checks (price bands, balance) are
    /// the adapter's business and surface as permanent broker errors.
    pub fn validate(&self) -> Result<(), IntentError> {
        if self.intent_id.trim().is_empty() {
            return Err(IntentError::EmptyIntentId);
        }
        if self.instrument.trim().is_empty() {
            return Err(IntentError::EmptyInstrument);
        }
        if self.qty_micros <= 0 {
            return Err(IntentError::NonPositiveQty(self.qty_micros));
        }
        match (self.order_type, self.limit_price_micros) {
            (OrderType::Limit, None) => Err(IntentError::LimitWithoutPrice),
            (OrderType::Limit, Some(p)) if p <= 0 => Err(IntentError::NonPositivePrice(p)),
            (OrderType::Market, Some(_)) => Err(IntentError::MarketWithPrice),
            _ => Ok(()),
        }
    }

    /// Signed intended quantity: +buy, -sell.
    pub fn signed_qty_micros(&self) -> i64 {
        self.side.sign() * self.qty_micros
    }
}

/// Broker-side order lifecycle status.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Ack,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// No further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }

    /// Order is working at the venue and can still fill or be canceled.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Ack => "ACK",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of a broker order.
///
/// The broker adapter owns the live record; everyone else only ever sees
/// snapshots returned by `query_order` / `list_open_orders`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub broker_order_id: String,
    pub intent_id: String,
    pub instrument: Instrument,
    pub side: Side,
    pub qty_micros: i64,
    pub status: OrderStatus,
    pub filled_qty_micros: i64,
    /// Volume-weighted average fill price; `None` until the first fill.
    pub avg_price_micros: Option<i64>,
}

impl BrokerOrder {
    /// Signed filled quantity: +buy, -sell.
    pub fn signed_filled_micros(&self) -> i64 {
        self.side.sign() * self.filled_qty_micros
    }

    pub fn remaining_qty_micros(&self) -> i64 {
        (self.qty_micros - self.filled_qty_micros).max(0)
    }
}

/// An execution report. Append-only; deduplicated by `fill_id` before it is
/// folded into any tally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub broker_order_id: String,
    pub qty_micros: i64,
    pub price_micros: i64,
    pub ts_ms: i64,
    /// Venue sequence number. Delivery order is not guaranteed to follow it.
    pub seq: u64,
}

/// Restart point into an adapter's fill stream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FillCursor(pub u64);

impl FillCursor {
    pub const START: FillCursor = FillCursor(0);

    pub fn position(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_intent_validates() {
        let i = OrderIntent::market("I1", "BTC-USD", Side::Buy, 1_000_000, 0);
        assert_eq!(i.validate(), Ok(()));
        assert_eq!(i.signed_qty_micros(), 1_000_000);
    }

    #[test]
    fn malformed_intents_are_rejected() {
        let mut i = OrderIntent::market("I1", "BTC-USD", Side::Sell, 0, 0);
        assert_eq!(i.validate(), Err(IntentError::NonPositiveQty(0)));

        i.qty_micros = 5;
        i.limit_price_micros = Some(10);
        assert_eq!(i.validate(), Err(IntentError::MarketWithPrice));

        let l = OrderIntent {
            limit_price_micros: None,
            ..OrderIntent::limit("I2", "BTC-USD", Side::Buy, 5, 10, 0)
        };
        assert_eq!(l.validate(), Err(IntentError::LimitWithoutPrice));

        let blank = OrderIntent::market(" ", "BTC-USD", Side::Buy, 5, 0);
        assert_eq!(blank.validate(), Err(IntentError::EmptyIntentId));
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::New.is_open());
        assert!(OrderStatus::PartiallyFilled.is_open());
    }

    #[test]
    fn intent_json_uses_wire_names() {
        let i = OrderIntent::market("I1", "BTC-USD", Side::Buy, 1_000_000, 7);
        let v = serde_json::to_value(&i).unwrap();
        assert_eq!(v["side"], "BUY");
        assert_eq!(v["order_type"], "MARKET");
    }
}
