use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use http::StatusCode;

use crate::dtos::checkout::{
    CancelCheckoutRequest, CheckoutListItem, CheckoutListResponse, CheckoutResponse,
    CreateCheckoutRequest, InvoiceSubmissionRequest,
};
use crate::error::AppError;
use crate::middleware::auth::AuthContext;
use crate::models::checkout::{CheckoutFilter, CheckoutStatus};
use crate::models::stock::StockProcessingReport;
use crate::services::ledger::ReconciliationPreview;
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;
const ADMIN_ROLES: [&str; 2] = ["manager", "admin"];

pub async fn create_checkout(
    State(AppState { ledger, .. }): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<CreateCheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutResponse>), AppError> {
    let checkout = ledger.create(req.into()).await?;
    tracing::info!(checkout_id = checkout.id, user = %auth.username, "checkout submitted");
    Ok((StatusCode::CREATED, Json(checkout.into())))
}

pub async fn get_checkout(
    State(AppState { ledger, .. }): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<CheckoutResponse>, AppError> {
    let checkout = ledger.get(id).await?;
    Ok(Json(checkout.into()))
}

pub async fn list_checkouts(
    State(AppState { ledger, .. }): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<CheckoutListResponse>, AppError> {
    let status = params
        .get("status")
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<CheckoutStatus>())
        .transpose()
        .map_err(AppError::validation)?;
    let employee_name = params
        .get("employee_name")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let page = parse_positive(&params, "page")?.unwrap_or(1);
    let limit = parse_positive(&params, "limit")?
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .min(MAX_PAGE_SIZE);

    let filter = CheckoutFilter {
        status,
        employee_name,
        page,
        limit,
    };
    let result = ledger.list(&filter).await?;

    Ok(Json(CheckoutListResponse {
        items: result.items.into_iter().map(CheckoutListItem::from).collect(),
        total: result.total,
        page,
        limit,
    }))
}

fn parse_positive(params: &HashMap<String, String>, key: &str) -> Result<Option<u32>, AppError> {
    match params.get(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<u32>() {
            Ok(value) if value > 0 => Ok(Some(value)),
            _ => Err(AppError::validation(format!("{key} must be a positive integer"))),
        },
    }
}

pub async fn check_work(
    State(AppState { ledger, .. }): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<InvoiceSubmissionRequest>,
) -> Result<Json<ReconciliationPreview>, AppError> {
    let preview = ledger
        .preview_reconciliation(id, &req.invoice_numbers, req.invoice_type)
        .await?;
    Ok(Json(preview))
}

pub async fn complete_checkout(
    State(AppState { ledger, .. }): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<i64>,
    Json(req): Json<InvoiceSubmissionRequest>,
) -> Result<Json<CheckoutResponse>, AppError> {
    let checkout = ledger.commit(id, &req.invoice_numbers, req.invoice_type).await?;
    tracing::info!(checkout_id = id, user = %auth.username, "checkout invoices committed");
    Ok(Json(checkout.into()))
}

pub async fn tally_checkout(
    State(AppState { ledger, .. }): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<CheckoutResponse>, AppError> {
    let checkout = ledger.retally(id).await?;
    Ok(Json(checkout.into()))
}

pub async fn process_stock(
    State(AppState { ledger, .. }): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> Result<Json<StockProcessingReport>, AppError> {
    let report = ledger.process_stock(id).await?;
    tracing::info!(checkout_id = id, user = %auth.username, "stock processing requested");
    Ok(Json(report))
}

pub async fn cancel_checkout(
    State(AppState { ledger, .. }): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<CancelCheckoutRequest>,
) -> Result<Json<CheckoutResponse>, AppError> {
    let checkout = ledger.cancel(id, &req.reason).await?;
    Ok(Json(checkout.into()))
}

pub async fn delete_checkout(
    State(AppState { ledger, .. }): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    if !ADMIN_ROLES.contains(&auth.role.as_str()) {
        return Err(AppError::forbidden("Only managers can delete checkouts"));
    }

    ledger.delete(id).await?;
    tracing::warn!(checkout_id = id, user = %auth.username, "checkout deleted by administrator");
    Ok(StatusCode::NO_CONTENT)
}
