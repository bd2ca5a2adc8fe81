//! In-memory stores for tests and local runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{AdjustmentOutcome, CheckoutRepository, InventoryError, InventoryStore, StoreError};
use crate::models::checkout::{
    Checkout, CheckoutFilter, CheckoutPage, CheckoutStatus, InvoiceClaim, NewCheckout, TallyUpdate,
};
use crate::models::stock::StockAdjustment;

#[derive(Debug, Default)]
struct CheckoutTables {
    next_id: i64,
    checkouts: BTreeMap<i64, Checkout>,
    /// invoice number -> owning checkout id
    claims: HashMap<String, i64>,
}

impl CheckoutTables {
    fn claims_on(&self, invoice_numbers: &BTreeSet<String>, exclude: Option<i64>) -> Vec<InvoiceClaim> {
        invoice_numbers
            .iter()
            .filter_map(|number| {
                let owner_id = *self.claims.get(number)?;
                if Some(owner_id) == exclude {
                    return None;
                }
                let owner = self.checkouts.get(&owner_id)?;
                if owner.status == CheckoutStatus::Cancelled {
                    return None;
                }
                Some(InvoiceClaim {
                    invoice_number: number.clone(),
                    checkout_id: owner_id,
                    employee_name: owner.employee_name.clone(),
                })
            })
            .collect()
    }

    fn checked_mut(&mut self, id: i64, expected_version: i64) -> Result<&mut Checkout, StoreError> {
        let checkout = self.checkouts.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if checkout.version != expected_version {
            return Err(StoreError::StaleVersion(id));
        }
        Ok(checkout)
    }

    fn release_claims(&mut self, id: i64) {
        self.claims.retain(|_, owner| *owner != id);
    }
}

/// Checkout repository backed by a single lock; every write is serialized.
#[derive(Debug, Default)]
pub struct InMemoryCheckoutStore {
    tables: RwLock<CheckoutTables>,
}

impl InMemoryCheckoutStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckoutRepository for InMemoryCheckoutStore {
    async fn insert(&self, new: NewCheckout) -> Result<Checkout, StoreError> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        tables.next_id += 1;
        let checkout = Checkout {
            id: tables.next_id,
            employee_name: new.employee_name,
            employee_id: new.employee_id,
            truck_number: new.truck_number,
            checkout_date: new.checkout_date,
            completed_date: None,
            notes: new.notes,
            status: CheckoutStatus::CheckedOut,
            items_taken: new.items_taken,
            invoice_numbers: BTreeSet::new(),
            invoice_type: None,
            tally_result: None,
            stock_processed: false,
            cancel_reason: None,
            version: 1,
        };
        tables.checkouts.insert(checkout.id, checkout.clone());
        Ok(checkout)
    }

    async fn get(&self, id: i64) -> Result<Option<Checkout>, StoreError> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        Ok(tables.checkouts.get(&id).cloned())
    }

    async fn list(&self, filter: &CheckoutFilter) -> Result<CheckoutPage, StoreError> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        let needle = filter.employee_name.as_ref().map(|n| n.to_lowercase());

        let matching: Vec<&Checkout> = tables
            .checkouts
            .values()
            .rev()
            .filter(|c| filter.status.map_or(true, |s| c.status == s))
            .filter(|c| {
                needle
                    .as_ref()
                    .map_or(true, |n| c.employee_name.to_lowercase().contains(n.as_str()))
            })
            .collect();

        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.limit as usize)
            .cloned()
            .collect();

        Ok(CheckoutPage { items, total })
    }

    async fn invoice_claims(
        &self,
        invoice_numbers: &BTreeSet<String>,
        exclude: Option<i64>,
    ) -> Result<Vec<InvoiceClaim>, StoreError> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        Ok(tables.claims_on(invoice_numbers, exclude))
    }

    async fn save_tally(&self, update: TallyUpdate) -> Result<Checkout, StoreError> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;

        let claimed = tables.claims_on(&update.invoice_numbers, Some(update.checkout_id));
        if !claimed.is_empty() {
            return Err(StoreError::InvoicesClaimed(claimed));
        }

        let checkout = tables.checked_mut(update.checkout_id, update.expected_version)?;
        checkout.invoice_numbers = update.invoice_numbers.clone();
        checkout.invoice_type = Some(update.invoice_type);
        checkout.tally_result = Some(update.tally_result);
        checkout.status = CheckoutStatus::Completed;
        checkout.completed_date.get_or_insert(update.completed_at);
        checkout.version += 1;
        let saved = checkout.clone();

        for number in update.invoice_numbers {
            tables.claims.insert(number, update.checkout_id);
        }
        Ok(saved)
    }

    async fn cancel(&self, id: i64, expected_version: i64, reason: &str) -> Result<Checkout, StoreError> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        let checkout = tables.checked_mut(id, expected_version)?;
        checkout.status = CheckoutStatus::Cancelled;
        checkout.cancel_reason = Some(reason.to_string());
        checkout.version += 1;
        let saved = checkout.clone();
        tables.release_claims(id);
        Ok(saved)
    }

    async fn mark_stock_processed(&self, id: i64, expected_version: i64) -> Result<Checkout, StoreError> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        let checkout = tables.checked_mut(id, expected_version)?;
        if checkout.stock_processed
            || checkout.status != CheckoutStatus::Completed
            || checkout.tally_result.is_none()
        {
            return Err(StoreError::StaleVersion(id));
        }
        checkout.stock_processed = true;
        checkout.version += 1;
        Ok(checkout.clone())
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        let removed = tables.checkouts.remove(&id).is_some();
        tables.release_claims(id);
        Ok(removed)
    }
}

#[derive(Debug, Default)]
struct InventoryTables {
    on_hand: HashMap<String, i64>,
    movements: Vec<StockAdjustment>,
}

/// Inventory store keyed by canonical item name. Unknown items are rejected.
#[derive(Debug, Default)]
pub struct InMemoryInventory {
    tables: RwLock<InventoryTables>,
}

impl InMemoryInventory {
    pub fn with_stock<I, S>(stock: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        let inventory = Self::default();
        if let Ok(mut tables) = inventory.tables.write() {
            tables.on_hand = stock.into_iter().map(|(name, qty)| (name.into(), qty)).collect();
        }
        inventory
    }

    /// Every adjustment applied so far, in order.
    pub fn movements(&self) -> Vec<StockAdjustment> {
        self.tables
            .read()
            .map(|t| t.movements.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventory {
    async fn apply_adjustments(
        &self,
        adjustments: &[StockAdjustment],
    ) -> Result<Vec<AdjustmentOutcome>, InventoryError> {
        let mut tables = self.tables.write().map_err(|_| InventoryError::Poisoned)?;
        let mut outcomes = Vec::with_capacity(adjustments.len());

        for adjustment in adjustments {
            match tables.on_hand.get_mut(&adjustment.canonical_name) {
                Some(qty) => {
                    *qty += adjustment.quantity;
                    tables.movements.push(adjustment.clone());
                    outcomes.push(Ok(()));
                }
                None => outcomes.push(Err(format!(
                    "item '{}' is not tracked in inventory",
                    adjustment.canonical_name
                ))),
            }
        }
        Ok(outcomes)
    }

    async fn on_hand(&self, canonical_name: &str) -> Result<Option<i64>, InventoryError> {
        let tables = self.tables.read().map_err(|_| InventoryError::Poisoned)?;
        Ok(tables.on_hand.get(canonical_name).copied())
    }
}
