//! Invoice lookups and per-item sold quantities.
//!
//! Lookups for a batch run concurrently. A failed lookup is recorded against
//! its invoice number and never fails the batch.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;

use crate::models::checkout::InvoiceType;
use crate::models::tally::InvoiceFetchStatus;
use crate::services::alias::AliasResolver;

const VOID_LINE_STATUSES: [&str; 4] = ["void", "voided", "cancelled", "canceled"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub item_name: String,
    #[serde(default)]
    pub sku: Option<String>,
    pub quantity: i64,
    #[serde(default)]
    pub status: Option<String>,
}

impl InvoiceLine {
    pub fn counts_as_sold(&self) -> bool {
        match &self.status {
            Some(status) => {
                let status = status.trim().to_ascii_lowercase();
                !VOID_LINE_STATUSES.contains(&status.as_str())
            }
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_number: String,
    #[serde(default)]
    pub line_items: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvoiceLookupError {
    #[error("invoice {0} not found")]
    NotFound(String),

    #[error("invoice directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait InvoiceDirectory: Send + Sync {
    async fn fetch_invoice(
        &self,
        invoice_number: &str,
        invoice_type: InvoiceType,
    ) -> Result<Invoice, InvoiceLookupError>;
}

/// `GET {base}/invoice/{number}?type={pending|closed}`
#[derive(Debug, Clone)]
pub struct HttpInvoiceDirectory {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpInvoiceDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InvoiceLookupError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| InvoiceLookupError::Unavailable(format!("invalid base url '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(InvoiceLookupError::Unavailable(format!(
                "invalid base url '{base_url}'"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InvoiceLookupError::Unavailable(e.to_string()))?;
        Ok(Self { client, base_url })
    }

    fn invoice_url(&self, invoice_number: &str) -> Result<Url, InvoiceLookupError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| InvoiceLookupError::Unavailable("invalid base url".to_string()))?
            .pop_if_empty()
            .push("invoice")
            .push(invoice_number);
        Ok(url)
    }
}

#[async_trait]
impl InvoiceDirectory for HttpInvoiceDirectory {
    async fn fetch_invoice(
        &self,
        invoice_number: &str,
        invoice_type: InvoiceType,
    ) -> Result<Invoice, InvoiceLookupError> {
        let url = self.invoice_url(invoice_number)?;
        let response = self
            .client
            .get(url)
            .query(&[("type", invoice_type.as_str())])
            .send()
            .await
            .map_err(|e| InvoiceLookupError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(InvoiceLookupError::NotFound(invoice_number.to_string())),
            status if !status.is_success() => {
                Err(InvoiceLookupError::Unavailable(format!("directory responded {status}")))
            }
            _ => response
                .json::<Invoice>()
                .await
                .map_err(|e| InvoiceLookupError::Unavailable(format!("malformed invoice body: {e}"))),
        }
    }
}

/// Fixed set of invoices, for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryInvoiceDirectory {
    invoices: RwLock<HashMap<(String, InvoiceType), Invoice>>,
    unavailable: RwLock<HashSet<String>>,
    lookups: AtomicUsize,
}

impl InMemoryInvoiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, invoice_type: InvoiceType, invoice: Invoice) {
        if let Ok(mut invoices) = self.invoices.write() {
            invoices.insert((invoice.invoice_number.clone(), invoice_type), invoice);
        }
    }

    /// Shorthand for an invoice whose lines are `(item name, quantity)`.
    pub fn insert_lines(&self, invoice_number: &str, invoice_type: InvoiceType, lines: &[(&str, i64)]) {
        self.insert(
            invoice_type,
            Invoice {
                invoice_number: invoice_number.to_string(),
                line_items: lines
                    .iter()
                    .map(|(name, quantity)| InvoiceLine {
                        item_name: name.to_string(),
                        sku: None,
                        quantity: *quantity,
                        status: None,
                    })
                    .collect(),
            },
        );
    }

    /// Make lookups of `invoice_number` fail as if the directory were down.
    pub fn mark_unavailable(&self, invoice_number: &str) {
        if let Ok(mut unavailable) = self.unavailable.write() {
            unavailable.insert(invoice_number.to_string());
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InvoiceDirectory for InMemoryInvoiceDirectory {
    async fn fetch_invoice(
        &self,
        invoice_number: &str,
        invoice_type: InvoiceType,
    ) -> Result<Invoice, InvoiceLookupError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        let down = self
            .unavailable
            .read()
            .map(|u| u.contains(invoice_number))
            .unwrap_or(true);
        if down {
            return Err(InvoiceLookupError::Unavailable(format!(
                "lookup of {invoice_number} failed"
            )));
        }

        self.invoices
            .read()
            .map_err(|_| InvoiceLookupError::Unavailable("directory lock poisoned".to_string()))?
            .get(&(invoice_number.to_string(), invoice_type))
            .cloned()
            .ok_or_else(|| InvoiceLookupError::NotFound(invoice_number.to_string()))
    }
}

/// Sold quantities across a set of invoices, keyed by canonical item name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoldQuantities {
    pub per_invoice_status: BTreeMap<String, InvoiceFetchStatus>,
    pub sold_by_canonical_name: BTreeMap<String, i64>,
}

#[derive(Clone)]
pub struct InvoiceDirectoryClient {
    directory: Arc<dyn InvoiceDirectory>,
    aliases: Arc<dyn AliasResolver>,
}

impl InvoiceDirectoryClient {
    pub fn new(directory: Arc<dyn InvoiceDirectory>, aliases: Arc<dyn AliasResolver>) -> Self {
        Self { directory, aliases }
    }

    /// Add one invoice's sold lines to `totals`. All or nothing: a negative
    /// quantity or an overflowing sum leaves `totals` untouched.
    fn merge_lines(&self, totals: &mut BTreeMap<String, i64>, invoice: &Invoice) -> Result<(), String> {
        let mut lines: BTreeMap<String, i64> = BTreeMap::new();
        for line in invoice.line_items.iter().filter(|l| l.counts_as_sold()) {
            if line.quantity < 0 {
                return Err(format!("line '{}' has negative quantity {}", line.item_name, line.quantity));
            }
            let entry = lines.entry(self.aliases.resolve(&line.item_name)).or_insert(0);
            *entry = entry
                .checked_add(line.quantity)
                .ok_or_else(|| format!("quantity of '{}' overflows", line.item_name))?;
        }

        let mut merged = Vec::with_capacity(lines.len());
        for (canonical, quantity) in lines {
            let total = totals
                .get(&canonical)
                .copied()
                .unwrap_or(0)
                .checked_add(quantity)
                .ok_or_else(|| format!("sold total of '{canonical}' overflows"))?;
            merged.push((canonical, total));
        }
        totals.extend(merged);
        Ok(())
    }

    /// Read-only; safe to call any number of times.
    pub async fn fetch_and_aggregate(
        &self,
        invoice_numbers: &BTreeSet<String>,
        invoice_type: InvoiceType,
    ) -> SoldQuantities {
        let mut lookups = JoinSet::new();
        for number in invoice_numbers {
            let directory = Arc::clone(&self.directory);
            let number = number.clone();
            lookups.spawn(async move {
                let result = directory.fetch_invoice(&number, invoice_type).await;
                (number, result)
            });
        }

        let mut sold = SoldQuantities::default();
        while let Some(joined) = lookups.join_next().await {
            let (number, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!(error = %e, "invoice lookup task failed");
                    continue;
                }
            };

            let status = match result {
                Ok(invoice) => {
                    match self.merge_lines(&mut sold.sold_by_canonical_name, &invoice) {
                        Ok(()) => InvoiceFetchStatus::Fetched,
                        Err(reason) => {
                            tracing::warn!(invoice = %number, %invoice_type, %reason, "invoice lines rejected");
                            InvoiceFetchStatus::Error
                        }
                    }
                }
                Err(InvoiceLookupError::NotFound(_)) => {
                    tracing::warn!(invoice = %number, %invoice_type, "invoice not found");
                    InvoiceFetchStatus::NotFound
                }
                Err(e) => {
                    tracing::warn!(invoice = %number, %invoice_type, error = %e, "invoice lookup failed");
                    InvoiceFetchStatus::Error
                }
            };
            sold.per_invoice_status.insert(number, status);
        }

        // A panicked lookup task still has to show up as an error.
        for number in invoice_numbers {
            sold.per_invoice_status
                .entry(number.clone())
                .or_insert(InvoiceFetchStatus::Error);
        }

        sold
    }
}
