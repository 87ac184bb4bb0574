use crate::TripReason;

/// Observations the session feeds the kill switch after every step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvariantInputs {
    /// Locally derived cash; `None` when no starting balance is configured.
    pub cash_micros: Option<i64>,
    /// Orders credited locally with more fill quantity than the venue
    /// reports: one execution applied twice.
    pub double_applied_fills: u64,
    pub retry_exhaustions: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InvariantLimits {
    pub max_retry_exhaustions: u32,
}

/// Every violated invariant, in a fixed order.
pub fn check_invariants(inputs: &InvariantInputs, limits: &InvariantLimits) -> Vec<TripReason> {
    let mut out = Vec::new();
    if let Some(cash) = inputs.cash_micros {
        if cash < 0 {
            out.push(TripReason::NegativeBalance { cash_micros: cash });
        }
    }
    if inputs.double_applied_fills > 0 {
        out.push(TripReason::DuplicateFillApplied {
            count: inputs.double_applied_fills,
        });
    }
    if inputs.retry_exhaustions >= limits.max_retry_exhaustions {
        out.push(TripReason::RetryExhaustion {
            count: inputs.retry_exhaustions,
            threshold: limits.max_retry_exhaustions,
        });
    }
    out
}
