//! Postgres-backed checkout repository and inventory store.
//!
//! Writes that attach invoice numbers take a `SHARE ROW EXCLUSIVE` lock on
//! `checkout_invoices` so the claim check and the insert see the same
//! snapshot; the table's primary key on `invoice_number` backs that up.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, QueryBuilder};
use tracing::instrument;

use super::{AdjustmentOutcome, CheckoutRepository, InventoryError, InventoryStore, StoreError};
use crate::models::checkout::{
    Checkout, CheckoutFilter, CheckoutItem, CheckoutPage, CheckoutStatus, InvoiceClaim,
    InvoiceType, NewCheckout, TallyUpdate,
};
use crate::models::stock::StockAdjustment;
use crate::models::tally::TallyResult;

const CHECKOUT_COLUMNS: &str = "id, employee_name, employee_id, truck_number, checkout_date, \
     completed_date, notes, status, invoice_type, tally_result, stock_processed, cancel_reason, version";

#[derive(Debug, FromRow)]
struct CheckoutRow {
    id: i64,
    employee_name: String,
    employee_id: Option<String>,
    truck_number: Option<String>,
    checkout_date: DateTime<Utc>,
    completed_date: Option<DateTime<Utc>>,
    notes: Option<String>,
    status: CheckoutStatus,
    invoice_type: Option<InvoiceType>,
    tally_result: Option<Json<TallyResult>>,
    stock_processed: bool,
    cancel_reason: Option<String>,
    version: i64,
}

#[derive(Debug, FromRow)]
struct ItemRow {
    checkout_id: i64,
    canonical_name: String,
    sku: Option<String>,
    quantity: i64,
    notes: Option<String>,
}

#[derive(Debug, FromRow)]
struct InvoiceRow {
    checkout_id: i64,
    invoice_number: String,
}

#[derive(Debug, FromRow)]
struct ClaimRow {
    invoice_number: String,
    checkout_id: i64,
    employee_name: String,
}

#[derive(Debug, Clone)]
pub struct PgCheckoutStore {
    pool: PgPool,
}

impl PgCheckoutStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Attach items and invoice numbers to checkout rows, preserving row order.
async fn hydrate(conn: &mut PgConnection, rows: Vec<CheckoutRow>) -> Result<Vec<Checkout>, StoreError> {
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();

    let items = sqlx::query_as::<_, ItemRow>(
        r#"SELECT checkout_id, canonical_name, sku, quantity, notes
           FROM checkout_items
           WHERE checkout_id = ANY($1)
           ORDER BY checkout_id, position"#,
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await?;

    let invoices = sqlx::query_as::<_, InvoiceRow>(
        r#"SELECT checkout_id, invoice_number
           FROM checkout_invoices
           WHERE checkout_id = ANY($1)"#,
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await?;

    let mut items_by_checkout: HashMap<i64, Vec<CheckoutItem>> = HashMap::new();
    for item in items {
        items_by_checkout.entry(item.checkout_id).or_default().push(CheckoutItem {
            canonical_name: item.canonical_name,
            sku: item.sku,
            quantity: item.quantity,
            notes: item.notes,
        });
    }

    let mut invoices_by_checkout: HashMap<i64, BTreeSet<String>> = HashMap::new();
    for invoice in invoices {
        invoices_by_checkout
            .entry(invoice.checkout_id)
            .or_default()
            .insert(invoice.invoice_number);
    }

    rows.into_iter()
        .map(|row| {
            let items_taken = items_by_checkout.remove(&row.id).unwrap_or_default();
            if items_taken.is_empty() {
                return Err(StoreError::Corrupt(format!("checkout {} has no items", row.id)));
            }
            Ok(Checkout {
                id: row.id,
                employee_name: row.employee_name,
                employee_id: row.employee_id,
                truck_number: row.truck_number,
                checkout_date: row.checkout_date,
                completed_date: row.completed_date,
                notes: row.notes,
                status: row.status,
                items_taken,
                invoice_numbers: invoices_by_checkout.remove(&row.id).unwrap_or_default(),
                invoice_type: row.invoice_type,
                tally_result: row.tally_result.map(|Json(t)| t),
                stock_processed: row.stock_processed,
                cancel_reason: row.cancel_reason,
                version: row.version,
            })
        })
        .collect()
}

async fn fetch_checkout(conn: &mut PgConnection, id: i64) -> Result<Option<Checkout>, StoreError> {
    let row = sqlx::query_as::<_, CheckoutRow>(&format!(
        "SELECT {CHECKOUT_COLUMNS} FROM checkouts WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => Ok(hydrate(conn, vec![row]).await?.pop()),
        None => Ok(None),
    }
}

async fn claims_on(
    conn: &mut PgConnection,
    invoice_numbers: &BTreeSet<String>,
    exclude: Option<i64>,
) -> Result<Vec<InvoiceClaim>, StoreError> {
    let numbers: Vec<String> = invoice_numbers.iter().cloned().collect();
    let rows = sqlx::query_as::<_, ClaimRow>(
        r#"SELECT ci.invoice_number, ci.checkout_id, c.employee_name
           FROM checkout_invoices ci
           JOIN checkouts c ON c.id = ci.checkout_id
           WHERE ci.invoice_number = ANY($1)
             AND c.status <> 'cancelled'
             AND ($2::BIGINT IS NULL OR ci.checkout_id <> $2)
           ORDER BY ci.checkout_id, ci.invoice_number"#,
    )
    .bind(&numbers)
    .bind(exclude)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| InvoiceClaim {
            invoice_number: r.invoice_number,
            checkout_id: r.checkout_id,
            employee_name: r.employee_name,
        })
        .collect())
}

/// A compare-and-swap touched no row: tell a missing checkout from a stale one.
async fn stale_or_missing(conn: &mut PgConnection, id: i64) -> StoreError {
    let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM checkouts WHERE id = $1)")
        .bind(id)
        .fetch_one(&mut *conn)
        .await;
    match exists {
        Ok(true) => StoreError::StaleVersion(id),
        Ok(false) => StoreError::NotFound(id),
        Err(e) => StoreError::Database(e),
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &CheckoutFilter) {
    qb.push(" WHERE 1=1");
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status);
    }
    if let Some(name) = &filter.employee_name {
        let escaped = name.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        qb.push(" AND employee_name ILIKE ").push_bind(format!("%{escaped}%"));
    }
}

#[async_trait]
impl CheckoutRepository for PgCheckoutStore {
    #[instrument(skip(self, new), fields(employee = %new.employee_name), err)]
    async fn insert(&self, new: NewCheckout) -> Result<Checkout, StoreError> {
        let mut tx = self.pool.begin().await?;

        let id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO checkouts (employee_name, employee_id, truck_number, checkout_date, notes)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING id"#,
        )
        .bind(&new.employee_name)
        .bind(&new.employee_id)
        .bind(&new.truck_number)
        .bind(new.checkout_date)
        .bind(&new.notes)
        .fetch_one(&mut *tx)
        .await?;

        for (position, item) in new.items_taken.iter().enumerate() {
            sqlx::query(
                r#"INSERT INTO checkout_items (checkout_id, position, canonical_name, sku, quantity, notes)
                   VALUES ($1, $2, $3, $4, $5, $6)"#,
            )
            .bind(id)
            .bind(position as i32)
            .bind(&item.canonical_name)
            .bind(&item.sku)
            .bind(item.quantity)
            .bind(&item.notes)
            .execute(&mut *tx)
            .await?;
        }

        let checkout = fetch_checkout(&mut tx, id).await?.ok_or(StoreError::NotFound(id))?;
        tx.commit().await?;
        Ok(checkout)
    }

    async fn get(&self, id: i64) -> Result<Option<Checkout>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_checkout(&mut conn, id).await
    }

    async fn list(&self, filter: &CheckoutFilter) -> Result<CheckoutPage, StoreError> {
        let mut conn = self.pool.acquire().await?;

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM checkouts");
        push_filters(&mut count, filter);
        let total = count.build_query_scalar::<i64>().fetch_one(&mut *conn).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {CHECKOUT_COLUMNS} FROM checkouts"));
        push_filters(&mut select, filter);
        select
            .push(" ORDER BY checkout_date DESC, id DESC LIMIT ")
            .push_bind(i64::from(filter.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.offset()));
        let rows = select.build_query_as::<CheckoutRow>().fetch_all(&mut *conn).await?;

        let items = hydrate(&mut conn, rows).await?;
        Ok(CheckoutPage { items, total })
    }

    async fn invoice_claims(
        &self,
        invoice_numbers: &BTreeSet<String>,
        exclude: Option<i64>,
    ) -> Result<Vec<InvoiceClaim>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        claims_on(&mut conn, invoice_numbers, exclude).await
    }

    #[instrument(skip(self, update), fields(checkout_id = update.checkout_id), err)]
    async fn save_tally(&self, update: TallyUpdate) -> Result<Checkout, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("LOCK TABLE checkout_invoices IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        let claimed = claims_on(&mut tx, &update.invoice_numbers, Some(update.checkout_id)).await?;
        if !claimed.is_empty() {
            return Err(StoreError::InvoicesClaimed(claimed));
        }

        let updated = sqlx::query_scalar::<_, i64>(
            r#"UPDATE checkouts
               SET status = 'completed',
                   invoice_type = $3,
                   tally_result = $4,
                   completed_date = COALESCE(completed_date, $5),
                   version = version + 1
               WHERE id = $1 AND version = $2 AND status <> 'cancelled'
               RETURNING id"#,
        )
        .bind(update.checkout_id)
        .bind(update.expected_version)
        .bind(update.invoice_type)
        .bind(Json(update.tally_result))
        .bind(update.completed_at)
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_none() {
            return Err(stale_or_missing(&mut tx, update.checkout_id).await);
        }

        let numbers: Vec<String> = update.invoice_numbers.into_iter().collect();
        sqlx::query(
            r#"INSERT INTO checkout_invoices (invoice_number, checkout_id)
               SELECT UNNEST($1::TEXT[]), $2
               ON CONFLICT (invoice_number) DO NOTHING"#,
        )
        .bind(&numbers)
        .bind(update.checkout_id)
        .execute(&mut *tx)
        .await?;

        let checkout = fetch_checkout(&mut tx, update.checkout_id)
            .await?
            .ok_or(StoreError::NotFound(update.checkout_id))?;
        tx.commit().await?;
        Ok(checkout)
    }

    async fn cancel(&self, id: i64, expected_version: i64, reason: &str) -> Result<Checkout, StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_scalar::<_, i64>(
            r#"UPDATE checkouts
               SET status = 'cancelled', cancel_reason = $3, version = version + 1
               WHERE id = $1 AND version = $2
               RETURNING id"#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_none() {
            return Err(stale_or_missing(&mut tx, id).await);
        }

        sqlx::query("DELETE FROM checkout_invoices WHERE checkout_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let checkout = fetch_checkout(&mut tx, id).await?.ok_or(StoreError::NotFound(id))?;
        tx.commit().await?;
        Ok(checkout)
    }

    async fn mark_stock_processed(&self, id: i64, expected_version: i64) -> Result<Checkout, StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_scalar::<_, i64>(
            r#"UPDATE checkouts
               SET stock_processed = TRUE, version = version + 1
               WHERE id = $1 AND version = $2
                 AND status = 'completed'
                 AND NOT stock_processed
                 AND tally_result IS NOT NULL
               RETURNING id"#,
        )
        .bind(id)
        .bind(expected_version)
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_none() {
            return Err(stale_or_missing(&mut tx, id).await);
        }

        let checkout = fetch_checkout(&mut tx, id).await?.ok_or(StoreError::NotFound(id))?;
        tx.commit().await?;
        Ok(checkout)
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM checkouts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Inventory quantities in `inventory_items`, audited through `stock_movements`.
#[derive(Debug, Clone)]
pub struct PgInventory {
    pool: PgPool,
}

impl PgInventory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InventoryStore for PgInventory {
    #[instrument(skip(self, adjustments), fields(count = adjustments.len()), err)]
    async fn apply_adjustments(
        &self,
        adjustments: &[StockAdjustment],
    ) -> Result<Vec<AdjustmentOutcome>, InventoryError> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(adjustments.len());

        for adjustment in adjustments {
            let updated = sqlx::query_scalar::<_, i64>(
                r#"UPDATE inventory_items
                   SET quantity = quantity + $2, updated_at = NOW()
                   WHERE canonical_name = $1
                   RETURNING quantity"#,
            )
            .bind(&adjustment.canonical_name)
            .bind(adjustment.quantity)
            .fetch_optional(&mut *tx)
            .await?;

            if updated.is_none() {
                outcomes.push(Err(format!(
                    "item '{}' is not tracked in inventory",
                    adjustment.canonical_name
                )));
                continue;
            }

            sqlx::query(
                r#"INSERT INTO stock_movements (canonical_name, quantity, checkout_id, reason)
                   VALUES ($1, $2, $3, $4)"#,
            )
            .bind(&adjustment.canonical_name)
            .bind(adjustment.quantity)
            .bind(adjustment.checkout_id)
            .bind(&adjustment.reason)
            .execute(&mut *tx)
            .await?;

            outcomes.push(Ok(()));
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    async fn on_hand(&self, canonical_name: &str) -> Result<Option<i64>, InventoryError> {
        let quantity = sqlx::query_scalar::<_, i64>(
            "SELECT quantity FROM inventory_items WHERE canonical_name = $1",
        )
        .bind(canonical_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(quantity)
    }
}

/// Raw `(alias, canonical_name)` pairs from `item_aliases`.
pub async fn load_aliases(pool: &PgPool) -> Result<Vec<(String, String)>, StoreError> {
    let rows = sqlx::query_as::<_, (String, String)>("SELECT alias, canonical_name FROM item_aliases")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}
