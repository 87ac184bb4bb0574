use rgx_execution::{BrokerError, PermanentKind, TransientKind};

/// Which adapter operation a scripted fault applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SimOp {
    Place,
    Cancel,
    Query,
    Lookup,
    ListOpen,
    Fills,
}

/// A one-shot failure queued against a [`SimOp`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Deadline exceeded before the venue saw the request.
    Timeout,
    /// The venue processed the request but the response was lost.
    /// Only meaningful for `Place`; other ops treat it as `Timeout`.
    AcceptThenTimeout,
    Unavailable,
    RateLimited,
    Reject(PermanentKind),
}

impl Fault {
    pub(crate) fn into_error(self, op: SimOp) -> BrokerError {
        let what = format!("{op:?}").to_ascii_lowercase();
        match self {
            Fault::Timeout | Fault::AcceptThenTimeout => {
                BrokerError::timeout(format!("simulated {what} timeout"))
            }
            Fault::Unavailable => {
                BrokerError::transient(TransientKind::Unavailable, format!("simulated {what} 503"))
            }
            Fault::RateLimited => {
                BrokerError::transient(TransientKind::RateLimited, format!("simulated {what} 429"))
            }
            Fault::Reject(kind) => BrokerError::permanent(kind, format!("simulated {what} rejection")),
        }
    }
}
