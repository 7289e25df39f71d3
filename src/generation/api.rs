use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::registry::RegistryError;
use crate::shared::models::GenerationRecord;
use crate::shared::state::AppState;
use crate::workflow::WorkflowError;

#[derive(Debug, Deserialize)]
pub struct SubmitGenerationRequest {
    pub account_id: Uuid,
    pub tool_id: String,
    pub inputs: Value,
    #[serde(default)]
    pub notification_target: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitGenerationResponse {
    pub generation_id: Uuid,
}

pub async fn submit_generation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitGenerationRequest>,
) -> Result<Json<SubmitGenerationResponse>, (StatusCode, String)> {
    let target = req.notification_target.unwrap_or_default();
    let generation_id = state
        .engine
        .submit_standalone(req.account_id, &req.tool_id, req.inputs, &target)
        .await
        .map_err(|e| match e {
            WorkflowError::Registry(RegistryError::UnknownTool(_)) => {
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        })?;
    Ok(Json(SubmitGenerationResponse { generation_id }))
}

pub async fn get_generation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<GenerationRecord>, (StatusCode, String)> {
    state
        .store
        .get(id)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))
}
