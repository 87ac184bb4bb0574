//! Intent id -> broker order id mapping.
//!
//! The store is the lock that guarantees at most one live broker order per
//! intent. A record moves `Pending -> Confirmed` once the venue returns an
//! order id, or `Pending -> Released` when the venue refuses the intent
//! outright. Terminal records are never reopened.
//!
//! A pending record is additionally *claimed* while a caller is working on
//! it. Only the claimant may call the broker; a second caller sees
//! [`Reservation::AlreadyReserved`] and backs off. When a claimant gives up
//! on an unknown outcome it releases the claim, and the next caller gets
//! [`Reservation::Resume`]: it must look the intent up at the venue before
//! any resubmission.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::error::IdempotencyViolation;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    Pending,
    Confirmed,
    Released,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IdempotencyRecord {
    pub intent_id: String,
    pub broker_order_id: Option<String>,
    pub created_at_ms: i64,
    pub state: RecordState,
}

/// Result of a successful [`IdempotencyStore::reserve`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reservation {
    /// Fresh key. The caller holds the claim and may place the order.
    Reserved,
    /// Pending key whose previous claimant gave up on an unknown outcome.
    /// The caller holds the claim but must query the venue first.
    Resume { pending_since_ms: i64 },
    /// Pending key claimed by someone else. Do not call the broker.
    AlreadyReserved { pending_since_ms: i64 },
}

#[derive(Debug)]
struct Slot {
    record: IdempotencyRecord,
    claimed: bool,
}

#[derive(Debug, Default)]
pub struct IdempotencyStore {
    slots: Mutex<BTreeMap<String, Slot>>,
}

impl IdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Slot>> {
        // A poisoned map is still structurally valid; every mutation below is
        // a single field write.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Atomically claim `intent_id`.
    ///
    /// Terminal keys are a hard error: a Confirmed intent already has its
    /// order, a Released one was refused by the venue and must not be retried
    /// under the same key.
    pub fn reserve(&self, intent_id: &str, now_ms: i64) -> Result<Reservation, IdempotencyViolation> {
        let mut slots = self.lock();
        match slots.get_mut(intent_id) {
            None => {
                slots.insert(
                    intent_id.to_string(),
                    Slot {
                        record: IdempotencyRecord {
                            intent_id: intent_id.to_string(),
                            broker_order_id: None,
                            created_at_ms: now_ms,
                            state: RecordState::Pending,
                        },
                        claimed: true,
                    },
                );
                Ok(Reservation::Reserved)
            }
            Some(slot) => match slot.record.state {
                RecordState::Pending if slot.claimed => Ok(Reservation::AlreadyReserved {
                    pending_since_ms: slot.record.created_at_ms,
                }),
                RecordState::Pending => {
                    slot.claimed = true;
                    Ok(Reservation::Resume {
                        pending_since_ms: slot.record.created_at_ms,
                    })
                }
                RecordState::Confirmed | RecordState::Released => {
                    Err(IdempotencyViolation::DuplicateIntent {
                        intent_id: intent_id.to_string(),
                        existing_broker_order_id: slot.record.broker_order_id.clone(),
                    })
                }
            },
        }
    }

    /// Bind the venue's order id. Re-confirming with the same id is a no-op.
    pub fn confirm(&self, intent_id: &str, broker_order_id: &str) -> Result<(), IdempotencyViolation> {
        let mut slots = self.lock();
        let slot = slots
            .get_mut(intent_id)
            .ok_or_else(|| IdempotencyViolation::UnknownIntent {
                intent_id: intent_id.to_string(),
            })?;
        match slot.record.state {
            RecordState::Pending => {
                slot.record.state = RecordState::Confirmed;
                slot.record.broker_order_id = Some(broker_order_id.to_string());
                slot.claimed = false;
                Ok(())
            }
            RecordState::Confirmed => match slot.record.broker_order_id.as_deref() {
                Some(existing) if existing == broker_order_id => Ok(()),
                existing => Err(IdempotencyViolation::ConflictingConfirm {
                    intent_id: intent_id.to_string(),
                    existing: existing.unwrap_or_default().to_string(),
                    attempted: broker_order_id.to_string(),
                }),
            },
            RecordState::Released => Err(IdempotencyViolation::NotPending {
                intent_id: intent_id.to_string(),
            }),
        }
    }

    /// The venue refused the intent permanently: free the key so the
    /// strategy may issue a corrected intent under a new id.
    pub fn release_on_permanent_failure(&self, intent_id: &str) -> Result<(), IdempotencyViolation> {
        let mut slots = self.lock();
        let slot = slots
            .get_mut(intent_id)
            .ok_or_else(|| IdempotencyViolation::UnknownIntent {
                intent_id: intent_id.to_string(),
            })?;
        match slot.record.state {
            RecordState::Pending => {
                slot.record.state = RecordState::Released;
                slot.claimed = false;
                Ok(())
            }
            RecordState::Released => Ok(()),
            RecordState::Confirmed => Err(IdempotencyViolation::NotPending {
                intent_id: intent_id.to_string(),
            }),
        }
    }

    /// Drop the claim on a pending record without resolving it. The outcome
    /// at the venue is unknown; the next reservation resumes with a lookup.
    pub fn unclaim(&self, intent_id: &str) {
        if let Some(slot) = self.lock().get_mut(intent_id) {
            if slot.record.state == RecordState::Pending {
                slot.claimed = false;
            }
        }
    }

    pub fn get(&self, intent_id: &str) -> Option<IdempotencyRecord> {
        self.lock().get(intent_id).map(|s| s.record.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Intent ids whose venue outcome is still unresolved, sorted.
    pub fn pending_intents(&self) -> Vec<String> {
        self.lock()
            .values()
            .filter(|s| s.record.state == RecordState::Pending)
            .map(|s| s.record.intent_id.clone())
            .collect()
    }

    pub fn records(&self) -> Vec<IdempotencyRecord> {
        self.lock().values().map(|s| s.record.clone()).collect()
    }
}
