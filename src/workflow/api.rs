use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::registry::RegistryError;
use crate::shared::models::{StepDefinition, WorkflowRun};
use crate::shared::state::AppState;
use crate::workflow::WorkflowError;

#[derive(Debug, Deserialize)]
pub struct SubmitRunRequest {
    pub account_id: Uuid,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub notification_target: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitRunResponse {
    pub run_id: Uuid,
}

pub async fn submit_workflow_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRunRequest>,
) -> Result<Json<SubmitRunResponse>, (StatusCode, Json<serde_json::Value>)> {
    let target = req.notification_target.unwrap_or_default();
    let run_id = state
        .engine
        .submit_run(req.account_id, req.steps, &target)
        .await
        .map_err(|e| {
            let (status, code) = match &e {
                WorkflowError::CyclicGraph => (StatusCode::UNPROCESSABLE_ENTITY, "CyclicGraph"),
                WorkflowError::EmptyDefinition
                | WorkflowError::DuplicateStepId(_)
                | WorkflowError::UnknownStepReference { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "InvalidDefinition")
                }
                WorkflowError::Registry(RegistryError::UnknownTool(_)) => {
                    (StatusCode::BAD_REQUEST, "UnknownTool")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal"),
            };
            (
                status,
                Json(serde_json::json!({ "error": code, "message": e.to_string() })),
            )
        })?;
    Ok(Json(SubmitRunResponse { run_id }))
}

pub async fn get_workflow_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowRun>, (StatusCode, String)> {
    state
        .runs
        .get(id)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))
}
