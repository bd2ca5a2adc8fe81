use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::tally::TallyResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "checkout_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    CheckedOut,
    Completed,
    Cancelled,
}

impl CheckoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutStatus::CheckedOut => "checked_out",
            CheckoutStatus::Completed => "completed",
            CheckoutStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CheckoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckoutStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "checked_out" => Ok(CheckoutStatus::CheckedOut),
            "completed" => Ok(CheckoutStatus::Completed),
            "cancelled" => Ok(CheckoutStatus::Cancelled),
            other => Err(format!("unknown checkout status '{other}'")),
        }
    }
}

/// Which side of the invoice directory an invoice number is looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "invoice_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceType {
    Pending,
    Closed,
}

impl InvoiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceType::Pending => "pending",
            InvoiceType::Closed => "closed",
        }
    }
}

impl fmt::Display for InvoiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of `items_taken`, already resolved to its canonical name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutItem {
    pub canonical_name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkout {
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
    /// Bumped on every write; stores use it for compare-and-swap.
    pub version: i64,
}

impl Checkout {
    pub fn total_quantity_taken(&self) -> i64 {
        self.items_taken
            .iter()
            .fold(0i64, |total, i| total.saturating_add(i.quantity))
    }
}

/// Validated input for a new checkout. Items are canonical and merged.
#[derive(Debug, Clone)]
pub struct NewCheckout {
    pub employee_name: String,
    pub employee_id: Option<String>,
    pub truck_number: Option<String>,
    pub notes: Option<String>,
    pub items_taken: Vec<CheckoutItem>,
    pub checkout_date: DateTime<Utc>,
}

/// Persisted result of a commit or re-tally.
#[derive(Debug, Clone)]
pub struct TallyUpdate {
    pub checkout_id: i64,
    pub expected_version: i64,
    pub invoice_numbers: BTreeSet<String>,
    pub invoice_type: InvoiceType,
    pub tally_result: TallyResult,
    pub completed_at: DateTime<Utc>,
}

/// An invoice number already attached to some checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceClaim {
    pub invoice_number: String,
    pub checkout_id: i64,
    pub employee_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct CheckoutFilter {
    pub status: Option<CheckoutStatus>,
    pub employee_name: Option<String>,
    pub page: u32,
    pub limit: u32,
}

impl CheckoutFilter {
    pub fn offset(&self) -> u32 {
        self.page.saturating_sub(1).saturating_mul(self.limit)
    }
}

#[derive(Debug, Clone)]
pub struct CheckoutPage {
    pub items: Vec<Checkout>,
    pub total: i64,
}
