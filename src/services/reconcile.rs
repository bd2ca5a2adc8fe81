//! Items taken vs. items sold.

use std::collections::BTreeMap;

use crate::models::checkout::CheckoutItem;
use crate::models::tally::{Discrepancy, TallyResult};
use crate::services::invoice_directory::SoldQuantities;

/// One row per canonical name present on either side, sorted by name.
///
/// Pure: identical inputs always produce identical, identically ordered rows.
pub fn reconcile(items_taken: &[CheckoutItem], sold_by_canonical_name: &BTreeMap<String, i64>) -> TallyResult {
    let mut rows: BTreeMap<&str, (Option<&str>, i64, i64)> = BTreeMap::new();

    for item in items_taken {
        let row = rows.entry(item.canonical_name.as_str()).or_insert((None, 0, 0));
        if row.0.is_none() {
            row.0 = item.sku.as_deref();
        }
        row.1 += item.quantity;
    }
    for (name, quantity) in sold_by_canonical_name {
        rows.entry(name.as_str()).or_insert((None, 0, 0)).2 += quantity;
    }

    let discrepancies = rows
        .into_iter()
        .map(|(name, (sku, taken, sold))| {
            Discrepancy::new(name.to_string(), sku.map(str::to_string), taken, sold)
        })
        .collect();

    TallyResult::from_discrepancies(discrepancies)
}

/// Full tally for a fetched invoice batch, including the per-invoice outcome.
pub fn tally(items_taken: &[CheckoutItem], sold: &SoldQuantities) -> TallyResult {
    reconcile(items_taken, &sold.sold_by_canonical_name).with_invoice_statuses(sold.per_invoice_status.clone())
}
