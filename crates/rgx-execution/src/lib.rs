//! rgx-execution
//!
//! Everything between an `OrderIntent` and the venue:
//! - [`BrokerAdapter`]: the behavioural contract every venue adapter satisfies
//! - [`IdempotencyStore`]: at most one live broker order per intent id
//! - [`RetryPolicy`]: bounded, deterministic backoff over classified errors
//! - [`OrderLifecycle`]: legal order transitions with fill de-duplication
//! - [`OrderGateway`]: the single submission choke-point combining all of the
//!   above behind a [`DispatchGate`]
//!
//! Only adapters perform I/O. Everything else here is in-memory.

mod adapter;
mod error;
mod gateway;
mod idempotency;
mod lifecycle;
mod retry;

pub use adapter::{BrokerAdapter, CallDeadline, FillStream};
pub use error::{BrokerError, ErrorClass, ErrorKind, IdempotencyViolation, PermanentKind, TransientKind};
pub use gateway::{
    BrokerOp, CallOutcome, CallRecord, CancelOutcome, CancelReport, DispatchGate, OrderGateway,
    RecoveryReport, SubmitOutcome, SubmitReport,
};
pub use idempotency::{IdempotencyRecord, IdempotencyStore, RecordState, Reservation};
pub use lifecycle::{Applied, LifecycleEvent, OrderLifecycle, TransitionError};
pub use retry::{GiveUpReason, RetryDecision, RetryPolicy};
