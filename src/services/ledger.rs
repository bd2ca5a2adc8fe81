//! Checkout lifecycle: create, preview, commit, re-tally, cancel, delete and
//! the one-time stock processing.
//!
//! Mutations hold a per-checkout lock for their whole duration, so two
//! concurrent commits or stock runs on one checkout are serialized. Stores
//! additionally compare-and-swap on `Checkout::version`, which covers
//! writers in other processes.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::instrument;

use crate::models::checkout::{
    Checkout, CheckoutFilter, CheckoutItem, CheckoutPage, CheckoutStatus, InvoiceType,
    NewCheckout, TallyUpdate,
};
use crate::models::stock::StockProcessingReport;
use crate::models::tally::TallyResult;
use crate::services::alias::AliasResolver;
use crate::services::duplicate_guard::{group_claims, CheckoutConflict, DuplicateInvoiceGuard};
use crate::services::invoice_directory::InvoiceDirectoryClient;
use crate::services::reconcile;
use crate::services::stock_adjustment::StockAdjustmentProcessor;
use crate::store::{CheckoutRepository, StoreError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invoice numbers already belong to other checkouts")]
    Conflict(Vec<CheckoutConflict>),

    #[error("cannot {operation} checkout {checkout_id}: {state}")]
    InvalidState {
        checkout_id: i64,
        operation: &'static str,
        state: String,
    },

    #[error("checkout {0} not found")]
    NotFound(i64),

    #[error("checkout {0} was modified concurrently; retry")]
    Concurrency(i64),

    #[error(transparent)]
    Store(StoreError),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    fn invalid_state(checkout: &Checkout, operation: &'static str) -> Self {
        let state = if checkout.stock_processed {
            "stock has already been processed".to_string()
        } else if checkout.status == CheckoutStatus::Completed && checkout.tally_result.is_none() {
            "it has no tally result".to_string()
        } else {
            format!("status is {}", checkout.status)
        };
        Self::InvalidState {
            checkout_id: checkout.id,
            operation,
            state,
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => LedgerError::NotFound(id),
            StoreError::StaleVersion(id) => LedgerError::Concurrency(id),
            StoreError::InvoicesClaimed(claims) => LedgerError::Conflict(group_claims(claims)),
            other => LedgerError::Store(other),
        }
    }
}

/// Raw item line as submitted by an operator.
#[derive(Debug, Clone)]
pub struct ItemTaken {
    pub name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateCheckout {
    pub employee_name: String,
    pub employee_id: Option<String>,
    pub truck_number: Option<String>,
    pub notes: Option<String>,
    pub items_taken: Vec<ItemTaken>,
}

/// Non-committing reconciliation plus any invoice conflicts it would hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationPreview {
    pub checkout_id: i64,
    pub invoice_numbers: BTreeSet<String>,
    pub invoice_type: InvoiceType,
    pub tally_result: TallyResult,
    pub conflicts: Vec<CheckoutConflict>,
}

/// One async mutex per checkout id.
#[derive(Default)]
struct CheckoutLocks {
    locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl CheckoutLocks {
    async fn acquire(&self, checkout_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(checkout_id).or_default())
        };
        lock.lock_owned().await
    }

    fn forget(&self, checkout_id: i64) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.remove(&checkout_id);
    }
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Trim, drop blanks, dedupe.
pub fn normalize_invoice_numbers<I, S>(numbers: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    numbers
        .into_iter()
        .map(|n| n.as_ref().trim().to_string())
        .filter(|n| !n.is_empty())
        .collect()
}

pub struct CheckoutLedger {
    repo: Arc<dyn CheckoutRepository>,
    aliases: Arc<dyn AliasResolver>,
    invoices: InvoiceDirectoryClient,
    guard: DuplicateInvoiceGuard,
    stock: StockAdjustmentProcessor,
    locks: CheckoutLocks,
}

impl CheckoutLedger {
    pub fn new(
        repo: Arc<dyn CheckoutRepository>,
        aliases: Arc<dyn AliasResolver>,
        invoices: InvoiceDirectoryClient,
        stock: StockAdjustmentProcessor,
    ) -> Self {
        Self {
            guard: DuplicateInvoiceGuard::new(Arc::clone(&repo)),
            repo,
            aliases,
            invoices,
            stock,
            locks: CheckoutLocks::default(),
        }
    }

    /// Resolve item names and merge lines that name the same item.
    fn canonical_items(&self, items: Vec<ItemTaken>) -> Result<Vec<CheckoutItem>, LedgerError> {
        if items.is_empty() {
            return Err(LedgerError::validation("a checkout must take at least one item"));
        }

        let mut merged: Vec<CheckoutItem> = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            if item.quantity <= 0 {
                return Err(LedgerError::validation(format!(
                    "item '{}' has quantity {}; quantities must be greater than 0",
                    item.name, item.quantity
                )));
            }
            let canonical_name = self.aliases.resolve(&item.name);
            if canonical_name.is_empty() {
                return Err(LedgerError::validation(format!("item #{} has no name", index + 1)));
            }

            let sku = blank_to_none(item.sku);
            let notes = blank_to_none(item.notes);
            match merged.iter_mut().find(|m| m.canonical_name == canonical_name) {
                Some(existing) => {
                    existing.quantity = existing.quantity.checked_add(item.quantity).ok_or_else(|| {
                        LedgerError::validation(format!("quantity too large for item '{}'", existing.canonical_name))
                    })?;
                    if existing.sku.is_none() {
                        existing.sku = sku;
                    }
                    if existing.notes.is_none() {
                        existing.notes = notes;
                    }
                }
                None => merged.push(CheckoutItem {
                    canonical_name,
                    sku,
                    quantity: item.quantity,
                    notes,
                }),
            }
        }
        Ok(merged)
    }

    async fn load(&self, checkout_id: i64) -> Result<Checkout, LedgerError> {
        self.repo
            .get(checkout_id)
            .await?
            .ok_or(LedgerError::NotFound(checkout_id))
    }

    /// Stored invoice numbers plus `submitted`; the set never shrinks.
    fn candidate_invoices(
        checkout: &Checkout,
        submitted: &[String],
        invoice_type: InvoiceType,
    ) -> Result<BTreeSet<String>, LedgerError> {
        if let Some(existing) = checkout.invoice_type {
            if !checkout.invoice_numbers.is_empty() && existing != invoice_type {
                return Err(LedgerError::validation(format!(
                    "checkout {} already uses {existing} invoices; cannot add {invoice_type} invoices",
                    checkout.id
                )));
            }
        }

        let mut candidates = normalize_invoice_numbers(submitted);
        candidates.extend(checkout.invoice_numbers.iter().cloned());
        if candidates.is_empty() {
            return Err(LedgerError::validation("at least one invoice number is required"));
        }
        Ok(candidates)
    }

    async fn compute_tally(
        &self,
        checkout: &Checkout,
        invoice_numbers: &BTreeSet<String>,
        invoice_type: InvoiceType,
    ) -> TallyResult {
        let sold = self.invoices.fetch_and_aggregate(invoice_numbers, invoice_type).await;
        let result = reconcile::tally(&checkout.items_taken, &sold);
        if result.is_partial() {
            tracing::warn!(
                checkout_id = checkout.id,
                fetched = result.fetched_invoices,
                total = result.total_invoices,
                "some invoices could not be fetched"
            );
        }
        result
    }

    #[instrument(skip(self, request), fields(employee = %request.employee_name), err)]
    pub async fn create(&self, request: CreateCheckout) -> Result<Checkout, LedgerError> {
        let employee_name = request.employee_name.trim().to_string();
        if employee_name.is_empty() {
            return Err(LedgerError::validation("employee_name is required"));
        }
        let items_taken = self.canonical_items(request.items_taken)?;

        let checkout = self
            .repo
            .insert(NewCheckout {
                employee_name,
                employee_id: blank_to_none(request.employee_id),
                truck_number: blank_to_none(request.truck_number),
                notes: blank_to_none(request.notes),
                items_taken,
                checkout_date: Utc::now(),
            })
            .await?;

        tracing::info!(checkout_id = checkout.id, items = checkout.items_taken.len(), "checkout created");
        Ok(checkout)
    }

    pub async fn get(&self, checkout_id: i64) -> Result<Checkout, LedgerError> {
        self.load(checkout_id).await
    }

    pub async fn list(&self, filter: &CheckoutFilter) -> Result<CheckoutPage, LedgerError> {
        Ok(self.repo.list(filter).await?)
    }

    /// Tally against the stored + submitted invoices without persisting
    /// anything. Allowed in every status.
    #[instrument(skip(self, invoice_numbers), err)]
    pub async fn preview_reconciliation(
        &self,
        checkout_id: i64,
        invoice_numbers: &[String],
        invoice_type: InvoiceType,
    ) -> Result<ReconciliationPreview, LedgerError> {
        let checkout = self.load(checkout_id).await?;
        let candidates = Self::candidate_invoices(&checkout, invoice_numbers, invoice_type)?;
        let conflicts = self.guard.conflicts(&candidates, Some(checkout_id)).await?;
        let tally_result = self.compute_tally(&checkout, &candidates, invoice_type).await;

        Ok(ReconciliationPreview {
            checkout_id,
            invoice_numbers: candidates,
            invoice_type,
            tally_result,
            conflicts,
        })
    }

    /// Attach invoices, persist the tally and mark the checkout completed.
    /// Also extends the invoices of an already completed checkout.
    #[instrument(skip(self, invoice_numbers), err)]
    pub async fn commit(
        &self,
        checkout_id: i64,
        invoice_numbers: &[String],
        invoice_type: InvoiceType,
    ) -> Result<Checkout, LedgerError> {
        let _lock = self.locks.acquire(checkout_id).await;
        let checkout = self.load(checkout_id).await?;

        if checkout.status == CheckoutStatus::Cancelled || checkout.stock_processed {
            return Err(LedgerError::invalid_state(&checkout, "complete"));
        }

        let candidates = Self::candidate_invoices(&checkout, invoice_numbers, invoice_type)?;
        let conflicts = self.guard.conflicts(&candidates, Some(checkout_id)).await?;
        if !conflicts.is_empty() {
            tracing::warn!(checkout_id, conflicts = conflicts.len(), "commit rejected: invoices claimed elsewhere");
            return Err(LedgerError::Conflict(conflicts));
        }

        let tally_result = self.compute_tally(&checkout, &candidates, invoice_type).await;
        let saved = self
            .repo
            .save_tally(TallyUpdate {
                checkout_id,
                expected_version: checkout.version,
                invoice_numbers: candidates,
                invoice_type,
                tally_result,
                completed_at: Utc::now(),
            })
            .await?;

        tracing::info!(
            checkout_id,
            invoices = saved.invoice_numbers.len(),
            "checkout completed"
        );
        Ok(saved)
    }

    /// Re-fetch the stored invoices and replace the tally.
    #[instrument(skip(self), err)]
    pub async fn retally(&self, checkout_id: i64) -> Result<Checkout, LedgerError> {
        let _lock = self.locks.acquire(checkout_id).await;
        let checkout = self.load(checkout_id).await?;

        let invoice_type = match checkout.invoice_type {
            Some(t) if checkout.status == CheckoutStatus::Completed && !checkout.stock_processed => t,
            _ => return Err(LedgerError::invalid_state(&checkout, "re-tally")),
        };

        let tally_result = self
            .compute_tally(&checkout, &checkout.invoice_numbers, invoice_type)
            .await;
        let saved = self
            .repo
            .save_tally(TallyUpdate {
                checkout_id,
                expected_version: checkout.version,
                invoice_numbers: checkout.invoice_numbers.clone(),
                invoice_type,
                tally_result,
                completed_at: Utc::now(),
            })
            .await?;
        Ok(saved)
    }

    #[instrument(skip(self, reason), err)]
    pub async fn cancel(&self, checkout_id: i64, reason: &str) -> Result<Checkout, LedgerError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LedgerError::validation("a cancel reason is required"));
        }

        let _lock = self.locks.acquire(checkout_id).await;
        let checkout = self.load(checkout_id).await?;
        if checkout.status != CheckoutStatus::CheckedOut {
            return Err(LedgerError::invalid_state(&checkout, "cancel"));
        }

        let saved = self.repo.cancel(checkout_id, checkout.version, reason).await?;
        tracing::info!(checkout_id, "checkout cancelled");
        Ok(saved)
    }

    /// Administrative hard delete; frees the checkout's invoice numbers.
    #[instrument(skip(self), err)]
    pub async fn delete(&self, checkout_id: i64) -> Result<(), LedgerError> {
        {
            let _lock = self.locks.acquire(checkout_id).await;
            if !self.repo.delete(checkout_id).await? {
                return Err(LedgerError::NotFound(checkout_id));
            }
        }
        self.locks.forget(checkout_id);
        tracing::info!(checkout_id, "checkout deleted");
        Ok(())
    }

    /// Correct the inventory store from the stored tally, exactly once.
    ///
    /// `stock_processed` is claimed before any inventory mutation, so a
    /// second call fails even when the first one reported item errors.
    #[instrument(skip(self), err)]
    pub async fn process_stock(&self, checkout_id: i64) -> Result<StockProcessingReport, LedgerError> {
        let _lock = self.locks.acquire(checkout_id).await;
        let checkout = self.load(checkout_id).await?;

        if checkout.status != CheckoutStatus::Completed
            || checkout.stock_processed
            || checkout.tally_result.is_none()
        {
            return Err(LedgerError::invalid_state(&checkout, "process stock for"));
        }

        let claimed = self
            .repo
            .mark_stock_processed(checkout_id, checkout.version)
            .await?;
        let tally = claimed
            .tally_result
            .as_ref()
            .ok_or_else(|| LedgerError::invalid_state(&claimed, "process stock for"))?;

        let report = self.stock.apply(checkout_id, tally).await;
        tracing::info!(
            checkout_id,
            added_back = report.added_back.len(),
            errors = report.errors.len(),
            "stock processed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tally::{DiscrepancyStatus, InvoiceFetchStatus};
    use crate::services::alias::AliasTable;
    use crate::services::invoice_directory::InMemoryInvoiceDirectory;
    use crate::store::memory::{InMemoryCheckoutStore, InMemoryInventory};
    use crate::store::InventoryStore;

    struct Harness {
        ledger: Arc<CheckoutLedger>,
        directory: Arc<InMemoryInvoiceDirectory>,
        inventory: Arc<InMemoryInventory>,
    }

    fn harness() -> Harness {
        let aliases: Arc<dyn AliasResolver> = Arc::new(AliasTable::from_pairs([("wdgt", "widget")]));
        let directory = Arc::new(InMemoryInvoiceDirectory::new());
        let inventory = Arc::new(InMemoryInventory::with_stock([("widget", 100), ("bolt", 50)]));
        let ledger = CheckoutLedger::new(
            Arc::new(InMemoryCheckoutStore::new()),
            Arc::clone(&aliases),
            InvoiceDirectoryClient::new(directory.clone(), aliases),
            StockAdjustmentProcessor::new(inventory.clone()),
        );
        Harness {
            ledger: Arc::new(ledger),
            directory,
            inventory,
        }
    }

    fn item(name: &str, quantity: i64) -> ItemTaken {
        ItemTaken {
            name: name.to_string(),
            sku: None,
            quantity,
            notes: None,
        }
    }

    fn request(employee: &str, items: Vec<ItemTaken>) -> CreateCheckout {
        CreateCheckout {
            employee_name: employee.to_string(),
            employee_id: None,
            truck_number: Some("T-4".to_string()),
            notes: None,
            items_taken: items,
        }
    }

    fn invoices(numbers: &[&str]) -> Vec<String> {
        numbers.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn create_rejects_empty_and_non_positive_items() {
        let h = harness();

        let err = h.ledger.create(request("Ana", vec![])).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let err = h
            .ledger
            .create(request("Ana", vec![item("Widget", 2), item("Bolt", 0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let err = h.ledger.create(request("  ", vec![item("Widget", 1)])).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn create_merges_spellings_of_the_same_item() {
        let h = harness();
        let checkout = h
            .ledger
            .create(request("Ana", vec![item("Widget", 2), item("WDGT", 3), item("Bolt", 1)]))
            .await
            .unwrap();

        assert_eq!(checkout.status, CheckoutStatus::CheckedOut);
        assert_eq!(checkout.items_taken.len(), 2);
        assert_eq!(checkout.items_taken[0].canonical_name, "widget");
        assert_eq!(checkout.items_taken[0].quantity, 5);
        assert!(!checkout.stock_processed);
        assert!(checkout.tally_result.is_none());
    }

    #[tokio::test]
    async fn merged_quantities_that_overflow_are_rejected() {
        let h = harness();
        let err = h
            .ledger
            .create(request("Ana", vec![item("Widget", i64::MAX), item("widget", 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(msg) if msg.contains("quantity too large")));

        let page = h.ledger.list(&CheckoutFilter { page: 1, limit: 20, ..Default::default() }).await.unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn matched_checkout_completes_with_one_matched_row() {
        let h = harness();
        h.directory.insert_lines("INV-1", InvoiceType::Closed, &[("Widget", 10)]);
        let checkout = h.ledger.create(request("Ana", vec![item("Widget", 10)])).await.unwrap();

        let completed = h
            .ledger
            .commit(checkout.id, &invoices(&["INV-1"]), InvoiceType::Closed)
            .await
            .unwrap();

        assert_eq!(completed.status, CheckoutStatus::Completed);
        assert!(completed.completed_date.is_some());
        let tally = completed.tally_result.unwrap();
        assert_eq!(tally.discrepancies.len(), 1);
        assert_eq!(tally.discrepancies[0].difference, 0);
        assert_eq!(tally.discrepancies[0].status, DiscrepancyStatus::Matched);
    }

    #[tokio::test]
    async fn preview_persists_nothing_and_matches_the_commit() {
        let h = harness();
        h.directory.insert_lines("INV-1", InvoiceType::Closed, &[("Widget", 6), ("Bolt", 2)]);
        let checkout = h.ledger.create(request("Ana", vec![item("Widget", 10)])).await.unwrap();

        let preview = h
            .ledger
            .preview_reconciliation(checkout.id, &invoices(&["INV-1", " INV-1 "]), InvoiceType::Closed)
            .await
            .unwrap();
        let unchanged = h.ledger.get(checkout.id).await.unwrap();
        assert_eq!(unchanged, checkout);

        let committed = h
            .ledger
            .commit(checkout.id, &invoices(&["INV-1"]), InvoiceType::Closed)
            .await
            .unwrap();
        assert_eq!(committed.tally_result.as_ref(), Some(&preview.tally_result));
        assert_eq!(committed.invoice_numbers, preview.invoice_numbers);
        assert_eq!(committed.total_quantity_taken(), checkout.total_quantity_taken());
    }

    #[tokio::test]
    async fn partial_invoice_fetch_still_commits() {
        let h = harness();
        h.directory.insert_lines("INV-1", InvoiceType::Pending, &[("Widget", 4)]);
        h.directory.mark_unavailable("INV-2");
        let checkout = h.ledger.create(request("Ana", vec![item("Widget", 4)])).await.unwrap();

        let completed = h
            .ledger
            .commit(checkout.id, &invoices(&["INV-1", "INV-2", "INV-3"]), InvoiceType::Pending)
            .await
            .unwrap();

        let tally = completed.tally_result.unwrap();
        assert_eq!(tally.total_invoices, 3);
        assert_eq!(tally.fetched_invoices, 1);
        assert_eq!(tally.invoices["INV-2"], InvoiceFetchStatus::Error);
        assert_eq!(tally.invoices["INV-3"], InvoiceFetchStatus::NotFound);
        assert_eq!(completed.invoice_numbers.len(), 3);
    }

    #[tokio::test]
    async fn oversized_invoice_lines_degrade_the_preview() {
        let h = harness();
        h.directory.insert_lines("INV-1", InvoiceType::Closed, &[("Widget", i64::MAX), ("Widget", 1)]);
        h.directory.insert_lines("INV-2", InvoiceType::Closed, &[("Widget", 3)]);
        let checkout = h.ledger.create(request("Ana", vec![item("Widget", 5)])).await.unwrap();

        let preview = h
            .ledger
            .preview_reconciliation(checkout.id, &invoices(&["INV-1", "INV-2"]), InvoiceType::Closed)
            .await
            .unwrap();

        let tally = preview.tally_result;
        assert_eq!(tally.invoices["INV-1"], InvoiceFetchStatus::Error);
        assert_eq!(tally.fetched_invoices, 1);
        assert_eq!(tally.discrepancies[0].quantity_sold, 3);
        assert_eq!(tally.discrepancies[0].difference, 2);
    }

    #[tokio::test]
    async fn duplicate_invoice_is_rejected_until_owner_is_removed() {
        let h = harness();
        h.directory.insert_lines("INV-X", InvoiceType::Closed, &[("Widget", 1)]);
        let a = h.ledger.create(request("Ana", vec![item("Widget", 1)])).await.unwrap();
        let b = h.ledger.create(request("Ben", vec![item("Widget", 1)])).await.unwrap();

        h.ledger.commit(a.id, &invoices(&["INV-X"]), InvoiceType::Closed).await.unwrap();

        let err = h
            .ledger
            .commit(b.id, &invoices(&["INV-X", "INV-Y"]), InvoiceType::Closed)
            .await
            .unwrap_err();
        match err {
            LedgerError::Conflict(conflicts) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].checkout_id, a.id);
                assert_eq!(conflicts[0].employee_name, "Ana");
                assert_eq!(conflicts[0].conflicting_invoice_numbers, vec!["INV-X".to_string()]);
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // Rejected in full: nothing attached to B.
        let untouched = h.ledger.get(b.id).await.unwrap();
        assert!(untouched.invoice_numbers.is_empty());
        assert_eq!(untouched.status, CheckoutStatus::CheckedOut);

        let preview = h
            .ledger
            .preview_reconciliation(b.id, &invoices(&["INV-X"]), InvoiceType::Closed)
            .await
            .unwrap();
        assert_eq!(preview.conflicts.len(), 1);

        h.ledger.delete(a.id).await.unwrap();
        let completed = h
            .ledger
            .commit(b.id, &invoices(&["INV-X"]), InvoiceType::Closed)
            .await
            .unwrap();
        assert!(completed.invoice_numbers.contains("INV-X"));
    }

    #[tokio::test]
    async fn adding_invoices_recomputes_over_the_union() {
        let h = harness();
        h.directory.insert_lines("INV-1", InvoiceType::Closed, &[("Widget", 3)]);
        h.directory.insert_lines("INV-2", InvoiceType::Closed, &[("Widget", 4)]);
        let checkout = h.ledger.create(request("Ana", vec![item("Widget", 7)])).await.unwrap();

        let first = h.ledger.commit(checkout.id, &invoices(&["INV-1"]), InvoiceType::Closed).await.unwrap();
        assert_eq!(first.tally_result.unwrap().discrepancies[0].difference, 4);

        let extended = h.ledger.commit(checkout.id, &invoices(&["INV-2"]), InvoiceType::Closed).await.unwrap();
        assert_eq!(extended.invoice_numbers.len(), 2);
        assert_eq!(extended.completed_date, first.completed_date);
        let tally = extended.tally_result.unwrap();
        assert_eq!(tally.discrepancies[0].quantity_sold, 7);
        assert_eq!(tally.discrepancies[0].status, DiscrepancyStatus::Matched);

        let err = h
            .ledger
            .commit(checkout.id, &invoices(&["INV-3"]), InvoiceType::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn retally_refetches_stored_invoices() {
        let h = harness();
        h.directory.insert_lines("INV-1", InvoiceType::Closed, &[("Widget", 2)]);
        let checkout = h.ledger.create(request("Ana", vec![item("Widget", 5)])).await.unwrap();
        h.ledger.commit(checkout.id, &invoices(&["INV-1"]), InvoiceType::Closed).await.unwrap();

        h.directory.insert_lines("INV-1", InvoiceType::Closed, &[("Widget", 5)]);
        let retallied = h.ledger.retally(checkout.id).await.unwrap();
        assert_eq!(retallied.tally_result.unwrap().matched_count, 1);

        let fresh = h.ledger.create(request("Ben", vec![item("Widget", 1)])).await.unwrap();
        let err = h.ledger.retally(fresh.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn cancel_is_only_legal_while_checked_out() {
        let h = harness();
        h.directory.insert_lines("INV-1", InvoiceType::Closed, &[("Widget", 1)]);
        let open = h.ledger.create(request("Ana", vec![item("Widget", 1)])).await.unwrap();
        let done = h.ledger.create(request("Ben", vec![item("Widget", 1)])).await.unwrap();
        h.ledger.commit(done.id, &invoices(&["INV-1"]), InvoiceType::Closed).await.unwrap();

        let err = h.ledger.cancel(open.id, "   ").await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let cancelled = h.ledger.cancel(open.id, "truck broke down").await.unwrap();
        assert_eq!(cancelled.status, CheckoutStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("truck broke down"));

        let err = h.ledger.cancel(done.id, "changed my mind").await.unwrap_err();
        match err {
            LedgerError::InvalidState { state, operation, .. } => {
                assert_eq!(operation, "cancel");
                assert!(state.contains("completed"));
            }
            other => panic!("expected invalid state, got {other:?}"),
        }

        let err = h
            .ledger
            .commit(open.id, &invoices(&["INV-2"]), InvoiceType::Closed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn excess_adds_back_sold_units_and_tracks_the_surplus() {
        let h = harness();
        h.directory.insert_lines("INV-1", InvoiceType::Closed, &[("Widget", 6)]);
        let checkout = h.ledger.create(request("Ana", vec![item("Widget", 10)])).await.unwrap();
        h.ledger.commit(checkout.id, &invoices(&["INV-1"]), InvoiceType::Closed).await.unwrap();

        let report = h.ledger.process_stock(checkout.id).await.unwrap();

        assert_eq!(report.added_back.get("widget"), Some(&6));
        assert_eq!(report.tracked_used.get("widget"), Some(&4));
        assert!(report.errors.is_empty());
        assert_eq!(h.inventory.on_hand("widget").await.unwrap(), Some(106));
        assert!(h.ledger.get(checkout.id).await.unwrap().stock_processed);
    }

    #[tokio::test]
    async fn shortage_is_reported_while_other_rows_are_adjusted() {
        let h = harness();
        h.directory.insert_lines("INV-1", InvoiceType::Closed, &[("Widget", 8), ("Bolt", 2)]);
        let checkout = h
            .ledger
            .create(request("Ana", vec![item("Widget", 5), item("Bolt", 2)]))
            .await
            .unwrap();
        let completed = h.ledger.commit(checkout.id, &invoices(&["INV-1"]), InvoiceType::Closed).await.unwrap();
        let widget_row = completed
            .tally_result
            .unwrap()
            .discrepancies
            .into_iter()
            .find(|d| d.canonical_name == "widget")
            .unwrap();
        assert_eq!(widget_row.difference, -3);
        assert_eq!(widget_row.status, DiscrepancyStatus::Shortage);

        let report = h.ledger.process_stock(checkout.id).await.unwrap();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].canonical_name, "widget");
        assert_eq!(report.added_back.get("bolt"), Some(&2));
        assert!(!report.added_back.contains_key("widget"));
        assert_eq!(h.inventory.on_hand("widget").await.unwrap(), Some(100));
        assert!(h.ledger.get(checkout.id).await.unwrap().stock_processed);
    }

    #[tokio::test]
    async fn process_stock_runs_exactly_once() {
        let h = harness();
        h.directory.insert_lines("INV-1", InvoiceType::Closed, &[("Widget", 3)]);
        let checkout = h.ledger.create(request("Ana", vec![item("Widget", 3)])).await.unwrap();

        let err = h.ledger.process_stock(checkout.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState { .. }));
        assert!(h.inventory.movements().is_empty());

        h.ledger.commit(checkout.id, &invoices(&["INV-1"]), InvoiceType::Closed).await.unwrap();

        let (first, second) = tokio::join!(
            h.ledger.process_stock(checkout.id),
            h.ledger.process_stock(checkout.id)
        );
        let successes = [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
        let movements_after_first = h.inventory.movements().len();
        assert_eq!(movements_after_first, 1);

        let err = h.ledger.process_stock(checkout.id).await.unwrap_err();
        match err {
            LedgerError::InvalidState { state, .. } => assert!(state.contains("already been processed")),
            other => panic!("expected invalid state, got {other:?}"),
        }
        assert_eq!(h.inventory.movements().len(), movements_after_first);
        assert_eq!(h.inventory.on_hand("widget").await.unwrap(), Some(103));

        let err = h
            .ledger
            .commit(checkout.id, &invoices(&["INV-9"]), InvoiceType::Closed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn concurrent_commits_cannot_share_an_invoice() {
        let h = harness();
        h.directory.insert_lines("INV-Z", InvoiceType::Closed, &[("Widget", 1)]);
        let a = h.ledger.create(request("Ana", vec![item("Widget", 1)])).await.unwrap();
        let b = h.ledger.create(request("Ben", vec![item("Widget", 1)])).await.unwrap();

        let numbers = invoices(&["INV-Z"]);
        let (ra, rb) = tokio::join!(
            h.ledger.commit(a.id, &numbers, InvoiceType::Closed),
            h.ledger.commit(b.id, &numbers, InvoiceType::Closed)
        );
        assert_eq!([ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count(), 1);
    }

    #[tokio::test]
    async fn delete_and_missing_checkouts() {
        let h = harness();
        let checkout = h.ledger.create(request("Ana", vec![item("Widget", 1)])).await.unwrap();

        h.ledger.delete(checkout.id).await.unwrap();
        assert!(matches!(h.ledger.get(checkout.id).await, Err(LedgerError::NotFound(_))));
        assert!(matches!(h.ledger.delete(checkout.id).await, Err(LedgerError::NotFound(_))));
        assert!(matches!(
            h.ledger.preview_reconciliation(999, &invoices(&["INV-1"]), InvoiceType::Closed).await,
            Err(LedgerError::NotFound(999))
        ));
    }

    #[tokio::test]
    async fn commit_requires_invoice_numbers() {
        let h = harness();
        let checkout = h.ledger.create(request("Ana", vec![item("Widget", 1)])).await.unwrap();
        let err = h
            .ledger
            .commit(checkout.id, &invoices(&["", "  "]), InvoiceType::Closed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}
