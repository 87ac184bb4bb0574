//! rgx-schemas
//!
//! Shared data model for the risk-gated execution core:
//! - order intents (immutable, keyed by idempotency key)
//! - broker-reported orders and fills (exchange state is authoritative)
//! - the injectable clock every timed decision reads from
//!
//! Quantities and prices are integer micros (1 unit = 1_000_000 micros).
//! `f64` only appears at the wire boundary via [`units_to_micros`] /
//! [`micros_to_units`].

mod clock;
mod micros;
mod types;

pub use clock::{Clock, FixedClock, SharedClock, SystemClock};
pub use micros::{micros_to_units, units_to_micros, MicrosError, MICROS_PER_UNIT};
pub use types::*;
