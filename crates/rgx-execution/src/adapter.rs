//! Broker adapter contract.
//!
//! An adapter is the only component allowed to talk to a venue. Every call
//! carries a [`CallDeadline`]; an adapter that cannot answer inside it must
//! return `TransientKind::Timeout`, never block past it. Write operations are
//! keyed: `place_order` by `intent.intent_id`, `cancel_order` by the broker
//! order id. Adapters take `&self` and keep their own interior state.

use std::sync::Arc;
use std::time::Duration;

use rgx_schemas::{BrokerOrder, Fill, FillCursor, OrderIntent};

use crate::error::BrokerError;

/// Upper bound on how long a single adapter call may take.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CallDeadline {
    pub timeout: Duration,
}

impl CallDeadline {
    pub fn from_millis(ms: u64) -> Self {
        Self {
            timeout: Duration::from_millis(ms),
        }
    }

    /// True when an operation needing `latency` would overrun the deadline.
    pub fn exceeded_by(&self, latency: Duration) -> bool {
        latency > self.timeout
    }
}

pub trait BrokerAdapter: Send + Sync {
    /// Submit an intent. Returns the venue's order id.
    ///
    /// A venue that recognises `intent.intent_id` as an already-accepted
    /// client order id returns the existing broker order id instead of
    /// creating a second order.
    fn place_order(&self, intent: &OrderIntent, deadline: CallDeadline) -> Result<String, BrokerError>;

    /// Cancel a working order. Canceling an order that is already terminal is
    /// a no-op success.
    fn cancel_order(&self, broker_order_id: &str, deadline: CallDeadline) -> Result<(), BrokerError>;

    fn query_order(&self, broker_order_id: &str, deadline: CallDeadline)
        -> Result<BrokerOrder, BrokerError>;

    /// Look up an order by client order id (the intent id). Used after a lost
    /// response to decide whether a retry must not resubmit.
    fn find_order_by_intent(
        &self,
        intent_id: &str,
        deadline: CallDeadline,
    ) -> Result<Option<BrokerOrder>, BrokerError>;

    fn list_open_orders(&self, deadline: CallDeadline) -> Result<Vec<BrokerOrder>, BrokerError>;

    /// Fills delivered after `since`. The stream is finite; its
    /// [`FillStream::cursor`] is the restart point for the next call.
    /// Delivery may repeat fills or present them out of venue-sequence order.
    fn iter_fills(&self, since: FillCursor, deadline: CallDeadline) -> Result<FillStream, BrokerError>;
}

impl<T: BrokerAdapter + ?Sized> BrokerAdapter for Arc<T> {
    fn place_order(&self, intent: &OrderIntent, deadline: CallDeadline) -> Result<String, BrokerError> {
        (**self).place_order(intent, deadline)
    }

    fn cancel_order(&self, broker_order_id: &str, deadline: CallDeadline) -> Result<(), BrokerError> {
        (**self).cancel_order(broker_order_id, deadline)
    }

    fn query_order(
        &self,
        broker_order_id: &str,
        deadline: CallDeadline,
    ) -> Result<BrokerOrder, BrokerError> {
        (**self).query_order(broker_order_id, deadline)
    }

    fn find_order_by_intent(
        &self,
        intent_id: &str,
        deadline: CallDeadline,
    ) -> Result<Option<BrokerOrder>, BrokerError> {
        (**self).find_order_by_intent(intent_id, deadline)
    }

    fn list_open_orders(&self, deadline: CallDeadline) -> Result<Vec<BrokerOrder>, BrokerError> {
        (**self).list_open_orders(deadline)
    }

    fn iter_fills(&self, since: FillCursor, deadline: CallDeadline) -> Result<FillStream, BrokerError> {
        (**self).iter_fills(since, deadline)
    }
}

/// A finite, restartable batch of fills.
///
/// Consuming `n` items advances [`cursor`](Self::cursor) by `n`, so a caller
/// that stops early resumes exactly where it left off.
#[derive(Debug)]
pub struct FillStream {
    inner: std::vec::IntoIter<Fill>,
    cursor: FillCursor,
}

impl FillStream {
    /// `fills` are the deliveries at positions `start, start+1, ...`.
    pub fn new(start: FillCursor, fills: Vec<Fill>) -> Self {
        Self {
            inner: fills.into_iter(),
            cursor: start,
        }
    }

    pub fn empty(at: FillCursor) -> Self {
        Self::new(at, Vec::new())
    }

    /// Position after the last consumed item.
    pub fn cursor(&self) -> FillCursor {
        self.cursor
    }
}

impl Iterator for FillStream {
    type Item = Fill;

    fn next(&mut self) -> Option<Fill> {
        let f = self.inner.next()?;
        self.cursor = FillCursor(self.cursor.0 + 1);
        Some(f)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(id: &str) -> Fill {
        Fill {
            fill_id: id.to_string(),
            broker_order_id: "B1".to_string(),
            qty_micros: 1,
            price_micros: 1,
            ts_ms: 0,
            seq: 0,
        }
    }

    #[test]
    fn cursor_tracks_consumption() {
        let mut s = FillStream::new(FillCursor(3), vec![fill("a"), fill("b"), fill("c")]);
        assert_eq!(s.cursor(), FillCursor(3));
        assert_eq!(s.next().map(|f| f.fill_id), Some("a".to_string()));
        assert_eq!(s.cursor(), FillCursor(4));
        // Stop early: the cursor is the restart point.
        assert_eq!(s.cursor().position(), 4);
        let rest: Vec<_> = s.by_ref().collect();
        assert_eq!(rest.len(), 2);
        assert_eq!(s.cursor(), FillCursor(6));
    }

    #[test]
    fn deadline_exceeded() {
        let d = CallDeadline::from_millis(100);
        assert!(!d.exceeded_by(Duration::from_millis(100)));
        assert!(d.exceeded_by(Duration::from_millis(101)));
    }
}
