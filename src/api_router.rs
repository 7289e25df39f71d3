//! Combines the per-module API endpoints into one router.

use axum::{
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use crate::shared::state::AppState;

pub fn configure_api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        // ===== Generations =====
        .route("/generation", post(crate::generation::api::submit_generation))
        .route("/generation/:id", get(crate::generation::api::get_generation))
        // ===== Workflow runs =====
        .route("/workflow-run", post(crate::workflow::api::submit_workflow_run))
        .route("/workflow-run/:id", get(crate::workflow::api::get_workflow_run))
        // ===== Provider callbacks =====
        .route("/webhook/:provider", post(crate::webhook::api::receive_webhook))
        // ===== Ledger admin =====
        .route("/account/:id", get(crate::ledger::api::get_account))
        .route("/account/:id/ledger", get(crate::ledger::api::get_account_ledger))
        .route("/account/:id/credit", post(crate::ledger::api::admin_credit))
        .route("/account/:id/debit", post(crate::ledger::api::admin_debit))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
