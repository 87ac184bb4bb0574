//! Per-order lifecycle state machine.
//!
//! ```text
//!   NEW ──Ack──► ACK ──Fill──► PARTIALLY_FILLED ──Fill──► FILLED
//!    │            │                  │
//!    │ Fill ──────┼──────────────────┘ (a fill implies the ack)
//!    │            │
//!    ├──Reject────┴──► REJECTED
//!    └──Cancel (from any open state) ──► CANCELED
//! ```
//!
//! Fills are keyed by `fill_id`. Replaying a fill is a no-op
//! ([`Applied::Duplicate`]) in every state, so the venue may redeliver freely.
//! A fill that would push `filled_qty` past `qty` is refused.
//! Cancel/reject on an already-terminal order is a no-op.

use std::collections::HashSet;

use rgx_schemas::{BrokerOrder, OrderIntent, OrderStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Ack,
    Fill {
        fill_id: String,
        qty_micros: i64,
        price_micros: i64,
    },
    Cancel,
    Reject,
}

/// What an accepted event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Duplicate,
    NoOp,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal transition: {from} + {event}")]
    Illegal { from: OrderStatus, event: String },
    #[error("fill {fill_id} of {qty_micros} would overfill (filled {filled_micros} of {order_qty_micros})")]
    Overfill {
        fill_id: String,
        qty_micros: i64,
        filled_micros: i64,
        order_qty_micros: i64,
    },
    #[error("fill {fill_id} has non-positive qty {qty_micros}")]
    NonPositiveFill { fill_id: String, qty_micros: i64 },
}

#[derive(Debug, Clone)]
pub struct OrderLifecycle {
    pub broker_order_id: String,
    intent: OrderIntent,
    status: OrderStatus,
    filled_qty_micros: i64,
    /// Sum of qty * price over applied fills, for the VWAP.
    notional: i128,
    applied_fills: HashSet<String>,
}

impl OrderLifecycle {
    pub fn new(broker_order_id: impl Into<String>, intent: OrderIntent) -> Self {
        Self {
            broker_order_id: broker_order_id.into(),
            intent,
            status: OrderStatus::New,
            filled_qty_micros: 0,
            notional: 0,
            applied_fills: HashSet::new(),
        }
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn intent(&self) -> &OrderIntent {
        &self.intent
    }

    pub fn filled_qty_micros(&self) -> i64 {
        self.filled_qty_micros
    }

    pub fn remaining_qty_micros(&self) -> i64 {
        self.intent.qty_micros - self.filled_qty_micros
    }

    pub fn has_applied(&self, fill_id: &str) -> bool {
        self.applied_fills.contains(fill_id)
    }

    pub fn apply(&mut self, event: &LifecycleEvent) -> Result<Applied, TransitionError> {
        use OrderStatus::*;

        match event {
            LifecycleEvent::Fill {
                fill_id,
                qty_micros,
                price_micros,
            } => {
                if self.applied_fills.contains(fill_id) {
                    return Ok(Applied::Duplicate);
                }
                if !matches!(self.status, New | Ack | PartiallyFilled) {
                    return Err(self.illegal(event));
                }
                if *qty_micros <= 0 {
                    return Err(TransitionError::NonPositiveFill {
                        fill_id: fill_id.clone(),
                        qty_micros: *qty_micros,
                    });
                }
                let next = self.filled_qty_micros.saturating_add(*qty_micros);
                if next > self.intent.qty_micros {
                    return Err(TransitionError::Overfill {
                        fill_id: fill_id.clone(),
                        qty_micros: *qty_micros,
                        filled_micros: self.filled_qty_micros,
                        order_qty_micros: self.intent.qty_micros,
                    });
                }
                self.filled_qty_micros = next;
                self.notional += i128::from(*qty_micros) * i128::from(*price_micros);
                self.applied_fills.insert(fill_id.clone());
                self.status = if next == self.intent.qty_micros {
                    Filled
                } else {
                    PartiallyFilled
                };
                Ok(Applied::Changed)
            }
            LifecycleEvent::Ack => match self.status {
                New => {
                    self.status = Ack;
                    Ok(Applied::Changed)
                }
                Ack | PartiallyFilled | Filled => Ok(Applied::NoOp),
                Canceled | Rejected => Err(self.illegal(event)),
            },
            LifecycleEvent::Cancel => match self.status {
                New | Ack | PartiallyFilled => {
                    self.status = Canceled;
                    Ok(Applied::Changed)
                }
                Filled | Canceled | Rejected => Ok(Applied::NoOp),
            },
            LifecycleEvent::Reject => match self.status {
                New | Ack => {
                    self.status = Rejected;
                    Ok(Applied::Changed)
                }
                Rejected => Ok(Applied::NoOp),
                PartiallyFilled | Filled | Canceled => Err(self.illegal(event)),
            },
        }
    }

    fn illegal(&self, event: &LifecycleEvent) -> TransitionError {
        TransitionError::Illegal {
            from: self.status,
            event: format!("{event:?}"),
        }
    }

    /// Immutable view handed to callers outside the adapter.
    pub fn snapshot(&self) -> BrokerOrder {
        let avg_price_micros = if self.filled_qty_micros > 0 {
            i64::try_from(self.notional / i128::from(self.filled_qty_micros)).ok()
        } else {
            None
        };
        BrokerOrder {
            broker_order_id: self.broker_order_id.clone(),
            intent_id: self.intent.intent_id.clone(),
            instrument: self.intent.instrument.clone(),
            side: self.intent.side,
            qty_micros: self.intent.qty_micros,
            status: self.status,
            filled_qty_micros: self.filled_qty_micros,
            avg_price_micros,
        }
    }
}
