//! Persistence seams for the checkout aggregate and the inventory store.

pub mod memory;
pub mod postgres;

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::checkout::{
    Checkout, CheckoutFilter, CheckoutPage, InvoiceClaim, NewCheckout, TallyUpdate,
};
use crate::models::stock::StockAdjustment;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("checkout {0} not found")]
    NotFound(i64),

    /// The row changed since it was read (compare-and-swap lost).
    #[error("checkout {0} was modified concurrently")]
    StaleVersion(i64),

    /// Some invoice numbers are held by other non-cancelled checkouts.
    #[error("invoice numbers already claimed")]
    InvoicesClaimed(Vec<InvoiceClaim>),

    #[error("corrupt checkout row: {0}")]
    Corrupt(String),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Storage for checkouts and the claimed-invoice index.
///
/// Every write is a compare-and-swap on `Checkout::version`; writes that
/// attach invoice numbers re-check the index in the same transaction.
#[async_trait]
pub trait CheckoutRepository: Send + Sync {
    async fn insert(&self, new: NewCheckout) -> Result<Checkout, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<Checkout>, StoreError>;

    async fn list(&self, filter: &CheckoutFilter) -> Result<CheckoutPage, StoreError>;

    /// Claims on `invoice_numbers` held by non-cancelled checkouts other than `exclude`.
    async fn invoice_claims(
        &self,
        invoice_numbers: &BTreeSet<String>,
        exclude: Option<i64>,
    ) -> Result<Vec<InvoiceClaim>, StoreError>;

    /// Persist invoices + tally and mark the checkout completed.
    async fn save_tally(&self, update: TallyUpdate) -> Result<Checkout, StoreError>;

    async fn cancel(&self, id: i64, expected_version: i64, reason: &str) -> Result<Checkout, StoreError>;

    /// Flip `stock_processed` to true. Fails with `StaleVersion` if the
    /// checkout is no longer completed-and-unprocessed at `expected_version`.
    async fn mark_stock_processed(&self, id: i64, expected_version: i64) -> Result<Checkout, StoreError>;

    /// Returns false when nothing was deleted.
    async fn delete(&self, id: i64) -> Result<bool, StoreError>;
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("inventory lock poisoned")]
    Poisoned,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Outcome of one adjustment inside a batch. `Err` carries the reason.
pub type AdjustmentOutcome = Result<(), String>;

/// Current on-hand quantities plus stock-movement commands.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Apply all adjustments as one unit. Outcomes line up with the input.
    /// Failed items leave their stock untouched.
    async fn apply_adjustments(
        &self,
        adjustments: &[StockAdjustment],
    ) -> Result<Vec<AdjustmentOutcome>, InventoryError>;

    async fn on_hand(&self, canonical_name: &str) -> Result<Option<i64>, InventoryError>;
}
