use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::ledger::LedgerError;
use crate::shared::models::{Account, LedgerEntry};
use crate::shared::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AdjustmentRequest {
    /// Decimal string; floats lose cents.
    pub amount: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AccountView {
    pub account: Account,
}

fn parse_amount(raw: &str) -> Result<BigDecimal, (StatusCode, String)> {
    BigDecimal::from_str(raw)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid amount {raw}: {e}")))
}

fn ledger_status(e: &LedgerError) -> StatusCode {
    match e {
        LedgerError::AccountNotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
        LedgerError::NegativeAmount(_) => StatusCode::BAD_REQUEST,
    }
}

/// Out-of-band balance top-up; provisions the account on first use.
pub async fn admin_credit(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<Uuid>,
    Json(req): Json<AdjustmentRequest>,
) -> Result<Json<LedgerEntry>, (StatusCode, String)> {
    let amount = parse_amount(&req.amount)?;
    let description = req.description.unwrap_or_else(|| "manual credit".to_string());
    state
        .ledger
        .credit(account_id, amount, None, &description)
        .await
        .map(Json)
        .map_err(|e| (ledger_status(&e), e.to_string()))
}

pub async fn admin_debit(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<Uuid>,
    Json(req): Json<AdjustmentRequest>,
) -> Result<Json<LedgerEntry>, (StatusCode, String)> {
    let amount = parse_amount(&req.amount)?;
    let description = req.description.unwrap_or_else(|| "manual debit".to_string());
    state
        .ledger
        .debit(account_id, amount, None, &description)
        .await
        .map(Json)
        .map_err(|e| (ledger_status(&e), e.to_string()))
}

pub async fn get_account(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<AccountView>, (StatusCode, String)> {
    state
        .ledger
        .get_account(account_id)
        .await
        .map(|account| Json(AccountView { account }))
        .map_err(|e| (ledger_status(&e), e.to_string()))
}

pub async fn get_account_ledger(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<Vec<LedgerEntry>>, (StatusCode, String)> {
    // Empty history for an unknown account is indistinguishable from a
    // provisioned-but-unused one; surface not-found consistently instead.
    state
        .ledger
        .get_account(account_id)
        .await
        .map_err(|e| (ledger_status(&e), e.to_string()))?;
    Ok(Json(state.ledger.entries_for_account(account_id).await))
}
