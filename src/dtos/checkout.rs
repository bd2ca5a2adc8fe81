use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::checkout::{Checkout, CheckoutItem, CheckoutStatus, InvoiceType};
use crate::models::tally::TallyResult;
use crate::services::ledger::{CreateCheckout, ItemTaken};

#[derive(Deserialize)]
pub struct CreateCheckoutRequest {
    pub employee_name: String,
    pub employee_id: Option<String>,
    pub truck_number: Option<String>,
    pub notes: Option<String>,
    pub items_taken: Vec<ItemTakenRequest>,
}

#[derive(Deserialize)]
pub struct ItemTakenRequest {
    pub name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    pub notes: Option<String>,
}

impl From<CreateCheckoutRequest> for CreateCheckout {
    fn from(req: CreateCheckoutRequest) -> Self {
        CreateCheckout {
            employee_name: req.employee_name,
            employee_id: req.employee_id,
            truck_number: req.truck_number,
            notes: req.notes,
            items_taken: req
                .items_taken
                .into_iter()
                .map(|i| ItemTaken {
                    name: i.name,
                    sku: i.sku,
                    quantity: i.quantity,
                    notes: i.notes,
                })
                .collect(),
        }
    }
}

/// Body of check-work and complete.
#[derive(Deserialize)]
pub struct InvoiceSubmissionRequest {
    pub invoice_numbers: Vec<String>,
    pub invoice_type: InvoiceType,
}

#[derive(Deserialize)]
pub struct CancelCheckoutRequest {
    pub reason: String,
}

#[derive(Serialize)]
pub struct CheckoutResponse {
    pub id: i64,
    pub employee_name: String,
    pub employee_id: Option<String>,
    pub truck_number: Option<String>,
    pub checkout_date: DateTime<Utc>,
    pub completed_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub status: CheckoutStatus,
    pub items_taken: Vec<CheckoutItem>,
    pub invoice_numbers: BTreeSet<String>,
    pub invoice_type: Option<InvoiceType>,
    pub tally_result: Option<TallyResult>,
    pub stock_processed: bool,
    pub cancel_reason: Option<String>,
    pub summary: CheckoutSummary,
}

#[derive(Serialize)]
pub struct CheckoutSummary {
    pub item_lines: i64,
    pub total_quantity_taken: i64,
    pub invoice_count: i64,
}

impl From<Checkout> for CheckoutResponse {
    fn from(c: Checkout) -> Self {
        let summary = CheckoutSummary {
            item_lines: c.items_taken.len() as i64,
            total_quantity_taken: c.total_quantity_taken(),
            invoice_count: c.invoice_numbers.len() as i64,
        };
        CheckoutResponse {
            id: c.id,
            employee_name: c.employee_name,
            employee_id: c.employee_id,
            truck_number: c.truck_number,
            checkout_date: c.checkout_date,
            completed_date: c.completed_date,
            notes: c.notes,
            status: c.status,
            items_taken: c.items_taken,
            invoice_numbers: c.invoice_numbers,
            invoice_type: c.invoice_type,
            tally_result: c.tally_result,
            stock_processed: c.stock_processed,
            cancel_reason: c.cancel_reason,
            summary,
        }
    }
}

#[derive(Serialize)]
pub struct CheckoutListItem {
    pub id: i64,
    pub employee_name: String,
    pub truck_number: Option<String>,
    pub checkout_date: DateTime<Utc>,
    pub status: CheckoutStatus,
    pub stock_processed: bool,
    pub total_quantity_taken: i64,
    pub invoice_count: i64,
    pub discrepancy_count: Option<i64>,
}

impl From<Checkout> for CheckoutListItem {
    fn from(c: Checkout) -> Self {
        CheckoutListItem {
            id: c.id,
            total_quantity_taken: c.total_quantity_taken(),
            invoice_count: c.invoice_numbers.len() as i64,
            discrepancy_count: c.tally_result.as_ref().map(|t| t.discrepancy_count),
            employee_name: c.employee_name,
            truck_number: c.truck_number,
            checkout_date: c.checkout_date,
            status: c.status,
            stock_processed: c.stock_processed,
        }
    }
}

#[derive(Serialize)]
pub struct CheckoutListResponse {
    pub items: Vec<CheckoutListItem>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}
