use serde::Serialize;

use rgx_integrity::ReconcileEvidence;
use rgx_schemas::Instrument;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PositionMismatch {
    pub instrument: Instrument,
    pub local_qty_micros: i64,
    pub broker_qty_micros: i64,
}

impl PositionMismatch {
    pub fn delta_micros(&self) -> i64 {
        self.broker_qty_micros - self.local_qty_micros
    }
}

/// A working order at the venue that this session never submitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnknownOrder {
    pub broker_order_id: String,
    pub intent_id: String,
    pub instrument: Instrument,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Overfill {
    pub broker_order_id: String,
    pub qty_micros: i64,
    pub filled_qty_micros: i64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    RefreshState,
    CancelOpenOrders,
    EnterSafeMode,
}

/// Recommended repairs, in execution order. Empty for a clean report.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RepairPlan {
    pub actions: Vec<RepairAction>,
}

impl RepairPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn contains(&self, a: RepairAction) -> bool {
        self.actions.contains(&a)
    }
}

/// One reconciliation cycle's result. A fresh value every cycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Sorted by instrument.
    pub mismatches: Vec<PositionMismatch>,
    /// Sorted by broker order id.
    pub unknown_orders: Vec<UnknownOrder>,
    /// Sorted by broker order id.
    pub overfills: Vec<Overfill>,
    pub generated_at_ms: i64,
}

impl ReconcileReport {
    pub fn clean(generated_at_ms: i64) -> Self {
        Self {
            mismatches: Vec::new(),
            unknown_orders: Vec::new(),
            overfills: Vec::new(),
            generated_at_ms,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty() && self.unknown_orders.is_empty() && self.overfills.is_empty()
    }

    pub fn total_issues(&self) -> usize {
        self.mismatches.len() + self.unknown_orders.len() + self.overfills.len()
    }

    pub fn repair_plan(&self) -> RepairPlan {
        if self.is_clean() {
            return RepairPlan::default();
        }
        let mut actions = vec![RepairAction::RefreshState];
        if !self.unknown_orders.is_empty() || !self.overfills.is_empty() {
            actions.push(RepairAction::CancelOpenOrders);
        }
        actions.push(RepairAction::EnterSafeMode);
        RepairPlan { actions }
    }
}

impl ReconcileEvidence for ReconcileReport {
    fn mismatch_count(&self) -> usize {
        self.total_issues()
    }
}
