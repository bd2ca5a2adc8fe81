use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyStatus {
    Matched,
    /// More taken than sold; unsold units presumed still on the truck.
    Excess,
    /// More sold than taken; needs manual review.
    Shortage,
}

impl DiscrepancyStatus {
    pub fn from_difference(difference: i64) -> Self {
        match difference {
            0 => DiscrepancyStatus::Matched,
            d if d > 0 => DiscrepancyStatus::Excess,
            _ => DiscrepancyStatus::Shortage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub canonical_name: String,
    pub sku: Option<String>,
    pub quantity_taken: i64,
    pub quantity_sold: i64,
    pub difference: i64,
    pub status: DiscrepancyStatus,
}

impl Discrepancy {
    pub fn new(canonical_name: String, sku: Option<String>, quantity_taken: i64, quantity_sold: i64) -> Self {
        let difference = quantity_taken.saturating_sub(quantity_sold);
        Self {
            canonical_name,
            sku,
            quantity_taken,
            quantity_sold,
            difference,
            status: DiscrepancyStatus::from_difference(difference),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceFetchStatus {
    Fetched,
    NotFound,
    Error,
}

/// Output of one reconciliation pass. Replaced wholesale on recompute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyResult {
    pub discrepancies: Vec<Discrepancy>,
    pub invoices: BTreeMap<String, InvoiceFetchStatus>,
    pub total_invoices: i64,
    pub fetched_invoices: i64,
    pub matched_count: i64,
    pub discrepancy_count: i64,
}

impl TallyResult {
    pub fn from_discrepancies(discrepancies: Vec<Discrepancy>) -> Self {
        let matched_count = discrepancies
            .iter()
            .filter(|d| d.status == DiscrepancyStatus::Matched)
            .count() as i64;
        let discrepancy_count = discrepancies.len() as i64 - matched_count;
        Self {
            discrepancies,
            invoices: BTreeMap::new(),
            total_invoices: 0,
            fetched_invoices: 0,
            matched_count,
            discrepancy_count,
        }
    }

    /// Attach the per-invoice fetch outcome and derive the invoice counters.
    pub fn with_invoice_statuses(mut self, invoices: BTreeMap<String, InvoiceFetchStatus>) -> Self {
        self.total_invoices = invoices.len() as i64;
        self.fetched_invoices = invoices
            .values()
            .filter(|s| **s == InvoiceFetchStatus::Fetched)
            .count() as i64;
        self.invoices = invoices;
        self
    }

    pub fn is_partial(&self) -> bool {
        self.fetched_invoices < self.total_invoices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_sign_of_difference() {
        assert_eq!(Discrepancy::new("a".into(), None, 3, 3).status, DiscrepancyStatus::Matched);
        assert_eq!(Discrepancy::new("a".into(), None, 5, 3).status, DiscrepancyStatus::Excess);
        assert_eq!(Discrepancy::new("a".into(), None, 0, 3).status, DiscrepancyStatus::Shortage);
    }

    #[test]
    fn difference_saturates_at_the_extremes() {
        let row = Discrepancy::new("a".into(), None, i64::MIN + 1, i64::MAX);
        assert_eq!(row.difference, i64::MIN);
        assert_eq!(row.status, DiscrepancyStatus::Shortage);
    }

    #[test]
    fn invoice_counters_track_fetch_outcomes() {
        let mut invoices = BTreeMap::new();
        invoices.insert("INV-1".to_string(), InvoiceFetchStatus::Fetched);
        invoices.insert("INV-2".to_string(), InvoiceFetchStatus::NotFound);
        invoices.insert("INV-3".to_string(), InvoiceFetchStatus::Error);

        let tally = TallyResult::from_discrepancies(vec![]).with_invoice_statuses(invoices);
        assert_eq!(tally.total_invoices, 3);
        assert_eq!(tally.fetched_invoices, 1);
        assert!(tally.is_partial());
    }
}
