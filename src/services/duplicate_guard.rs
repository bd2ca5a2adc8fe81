use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use crate::models::checkout::InvoiceClaim;
use crate::store::{CheckoutRepository, StoreError};

/// Contested invoice numbers held by one other checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutConflict {
    pub checkout_id: i64,
    pub employee_name: String,
    pub conflicting_invoice_numbers: Vec<String>,
}

/// Group claims by owning checkout, ordered by checkout id then invoice number.
pub fn group_claims(claims: Vec<InvoiceClaim>) -> Vec<CheckoutConflict> {
    let mut grouped: BTreeMap<i64, (String, BTreeSet<String>)> = BTreeMap::new();
    for claim in claims {
        grouped
            .entry(claim.checkout_id)
            .or_insert_with(|| (claim.employee_name.clone(), BTreeSet::new()))
            .1
            .insert(claim.invoice_number);
    }
    grouped
        .into_iter()
        .map(|(checkout_id, (employee_name, numbers))| CheckoutConflict {
            checkout_id,
            employee_name,
            conflicting_invoice_numbers: numbers.into_iter().collect(),
        })
        .collect()
}

/// Rejects invoice numbers already attached to another non-cancelled checkout.
#[derive(Clone)]
pub struct DuplicateInvoiceGuard {
    repo: Arc<dyn CheckoutRepository>,
}

impl DuplicateInvoiceGuard {
    pub fn new(repo: Arc<dyn CheckoutRepository>) -> Self {
        Self { repo }
    }

    /// Empty when none of `candidates` is claimed elsewhere.
    pub async fn conflicts(
        &self,
        candidates: &BTreeSet<String>,
        exclude_checkout_id: Option<i64>,
    ) -> Result<Vec<CheckoutConflict>, StoreError> {
        let claims = self.repo.invoice_claims(candidates, exclude_checkout_id).await?;
        Ok(group_claims(claims))
    }
}
