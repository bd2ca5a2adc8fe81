//! Undo the double decrement of sold units.
//!
//! Checkout decrements inventory by the quantity taken; invoice sync later
//! decrements it again by the quantity sold. For each tally row the
//! overlap `min(taken, sold)` is added back. Surplus taken units are only
//! reported as used. Shortage rows are left for manual review.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::models::stock::{AdjustmentError, StockAdjustment, StockProcessingReport};
use crate::models::tally::{DiscrepancyStatus, TallyResult};
use crate::store::InventoryStore;

/// What a tally asks of the inventory store, before anything is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustmentPlan {
    pub adjustments: Vec<StockAdjustment>,
    pub tracked_used: BTreeMap<String, i64>,
    pub errors: Vec<AdjustmentError>,
}

pub fn plan_adjustments(checkout_id: i64, tally: &TallyResult) -> AdjustmentPlan {
    let mut plan = AdjustmentPlan {
        adjustments: Vec::new(),
        tracked_used: BTreeMap::new(),
        errors: Vec::new(),
    };

    for row in &tally.discrepancies {
        if row.status == DiscrepancyStatus::Shortage {
            plan.errors.push(AdjustmentError {
                canonical_name: row.canonical_name.clone(),
                reason: format!(
                    "invoices report {} sold but only {} were taken; needs manual review",
                    row.quantity_sold, row.quantity_taken
                ),
            });
            continue;
        }

        let double_counted = row.quantity_taken.min(row.quantity_sold);
        if double_counted > 0 {
            plan.adjustments.push(StockAdjustment {
                canonical_name: row.canonical_name.clone(),
                quantity: double_counted,
                checkout_id,
                reason: format!("checkout {checkout_id}: sold units decremented twice"),
            });
        }
        if row.difference > 0 {
            plan.tracked_used.insert(row.canonical_name.clone(), row.difference);
        }
    }

    plan
}

#[derive(Clone)]
pub struct StockAdjustmentProcessor {
    inventory: Arc<dyn InventoryStore>,
}

impl StockAdjustmentProcessor {
    pub fn new(inventory: Arc<dyn InventoryStore>) -> Self {
        Self { inventory }
    }

    /// Apply the plan for `tally` in one batch. Per-item failures, and a
    /// failure of the whole batch, end up in the report's `errors`.
    pub async fn apply(&self, checkout_id: i64, tally: &TallyResult) -> StockProcessingReport {
        let AdjustmentPlan {
            adjustments,
            tracked_used,
            mut errors,
        } = plan_adjustments(checkout_id, tally);

        let mut added_back = BTreeMap::new();
        if !adjustments.is_empty() {
            match self.inventory.apply_adjustments(&adjustments).await {
                Ok(outcomes) => {
                    for (adjustment, outcome) in adjustments.iter().zip(outcomes) {
                        match outcome {
                            Ok(()) => {
                                added_back.insert(adjustment.canonical_name.clone(), adjustment.quantity);
                            }
                            Err(reason) => {
                                tracing::warn!(checkout_id, item = %adjustment.canonical_name, %reason, "stock add-back failed");
                                errors.push(AdjustmentError {
                                    canonical_name: adjustment.canonical_name.clone(),
                                    reason,
                                });
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(checkout_id, error = %e, "stock adjustment batch failed");
                    errors.extend(adjustments.iter().map(|a| AdjustmentError {
                        canonical_name: a.canonical_name.clone(),
                        reason: format!("inventory store error: {e}"),
                    }));
                }
            }
        }

        StockProcessingReport {
            checkout_id,
            added_back,
            tracked_used,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tally::Discrepancy;
    use crate::store::memory::InMemoryInventory;

    fn tally(rows: &[(&str, i64, i64)]) -> TallyResult {
        TallyResult::from_discrepancies(
            rows.iter()
                .map(|(name, taken, sold)| Discrepancy::new(name.to_string(), None, *taken, *sold))
                .collect(),
        )
    }

    #[test]
    fn excess_adds_back_sold_units_and_tracks_the_rest() {
        let plan = plan_adjustments(1, &tally(&[("widget", 10, 6)]));

        assert_eq!(plan.adjustments.len(), 1);
        assert_eq!(plan.adjustments[0].quantity, 6);
        assert_eq!(plan.tracked_used.get("widget"), Some(&4));
        assert!(plan.errors.is_empty());
    }

    #[test]
    fn shortage_is_reported_not_adjusted() {
        let plan = plan_adjustments(1, &tally(&[("widget", 5, 8), ("bolt", 2, 2)]));

        assert_eq!(plan.adjustments.len(), 1);
        assert_eq!(plan.adjustments[0].canonical_name, "bolt");
        assert_eq!(plan.errors.len(), 1);
        assert_eq!(plan.errors[0].canonical_name, "widget");
    }

    #[test]
    fn unsold_items_only_count_as_used() {
        let plan = plan_adjustments(1, &tally(&[("anchor", 3, 0)]));
        assert!(plan.adjustments.is_empty());
        assert_eq!(plan.tracked_used.get("anchor"), Some(&3));
    }

    #[tokio::test]
    async fn unknown_items_are_reported_without_blocking_others() {
        let inventory = Arc::new(InMemoryInventory::with_stock([("widget", 0)]));
        let processor = StockAdjustmentProcessor::new(inventory.clone());

        let report = processor
            .apply(9, &tally(&[("widget", 4, 4), ("ghost", 2, 1)]))
            .await;

        assert_eq!(report.added_back.get("widget"), Some(&4));
        assert_eq!(report.tracked_used.get("ghost"), Some(&1));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].canonical_name, "ghost");
        assert_eq!(inventory.on_hand("widget").await.unwrap(), Some(4));
    }
}
