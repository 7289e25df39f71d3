use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::shared::state::AppState;
use crate::webhook::{HandleOutcome, WebhookError};

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub outcome: &'static str,
}

/// `POST /webhook/{provider}` — correlates one provider callback. A
/// callback that races record creation is accepted (202) and retried; a
/// duplicate is acknowledged without effect.
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<WebhookResponse>), (StatusCode, String)> {
    let event = state
        .correlator
        .parse_event(&provider, &payload)
        .map_err(|e| match e {
            WebhookError::UnknownProvider(_) => (StatusCode::NOT_FOUND, e.to_string()),
            other => (StatusCode::UNPROCESSABLE_ENTITY, other.to_string()),
        })?;

    let outcome = state
        .correlator
        .handle_event(&provider, event)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(match outcome {
        HandleOutcome::Applied => (StatusCode::OK, Json(WebhookResponse { outcome: "applied" })),
        HandleOutcome::Ignored => (StatusCode::OK, Json(WebhookResponse { outcome: "ignored" })),
        HandleOutcome::Queued => (
            StatusCode::ACCEPTED,
            Json(WebhookResponse { outcome: "queued" }),
        ),
    })
}
