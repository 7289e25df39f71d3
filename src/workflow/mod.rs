//! Workflow runs: step-graph validation and the run store.
//!
//! A run's definition is validated once at submission. A cycle is a hard
//! validation failure rejected before any step is submitted, so there is
//! never a partially-submitted cyclic run to clean up.

pub mod api;
pub mod engine;

use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::generation::GenerationError;
use crate::registry::RegistryError;
use crate::shared::models::{GenerationStatus, InputSource, RunStatus, StepDefinition, WorkflowRun};

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow definition is empty")]
    EmptyDefinition,
    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),
    #[error("step {step_id} references unknown step: {source_step}")]
    UnknownStepReference { step_id: String, source_step: String },
    #[error("workflow definition contains a cycle")]
    CyclicGraph,
    #[error("run not found: {0}")]
    RunNotFound(Uuid),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

/// Kahn's algorithm over the declared input mappings. Returns the steps
/// grouped into waves: every step in wave *n* depends only on steps in
/// waves `< n`, so one wave may be submitted concurrently.
pub fn validate_definition(steps: &[StepDefinition]) -> Result<Vec<Vec<String>>, WorkflowError> {
    if steps.is_empty() {
        return Err(WorkflowError::EmptyDefinition);
    }

    let mut known = HashSet::new();
    for step in steps {
        if !known.insert(step.step_id.as_str()) {
            return Err(WorkflowError::DuplicateStepId(step.step_id.clone()));
        }
    }

    // step -> set of steps it depends on
    let mut deps: HashMap<&str, HashSet<&str>> = HashMap::new();
    for step in steps {
        let entry = deps.entry(step.step_id.as_str()).or_default();
        for source in step.input_mappings.values() {
            if let InputSource::FromStep { step_id, .. } = source {
                if !known.contains(step_id.as_str()) {
                    return Err(WorkflowError::UnknownStepReference {
                        step_id: step.step_id.clone(),
                        source_step: step_id.clone(),
                    });
                }
                entry.insert(step_id.as_str());
            }
        }
    }

    let mut resolved: HashSet<&str> = HashSet::new();
    let mut waves = Vec::new();
    let mut remaining: Vec<&str> = steps.iter().map(|s| s.step_id.as_str()).collect();
    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&str>, Vec<&str>) = remaining
            .into_iter()
            .partition(|id| deps[id].iter().all(|d| resolved.contains(d)));
        if ready.is_empty() {
            return Err(WorkflowError::CyclicGraph);
        }
        resolved.extend(ready.iter().copied());
        waves.push(ready.iter().map(|s| s.to_string()).collect());
        remaining = blocked;
    }
    Ok(waves)
}

pub struct RunStore {
    runs: Arc<RwLock<HashMap<Uuid, WorkflowRun>>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn insert(&self, run: WorkflowRun) -> Uuid {
        let id = run.id;
        self.runs.write().await.insert(id, run);
        id
    }

    pub async fn get(&self, id: Uuid) -> Result<WorkflowRun, WorkflowError> {
        self.runs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(WorkflowError::RunNotFound(id))
    }

    pub async fn set_step(
        &self,
        run_id: Uuid,
        step_id: &str,
        generation_id: Option<Uuid>,
        status: GenerationStatus,
    ) -> Result<(), WorkflowError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&run_id).ok_or(WorkflowError::RunNotFound(run_id))?;
        if let Some(state) = run.step_statuses.get_mut(step_id) {
            if generation_id.is_some() {
                state.generation_id = generation_id;
            }
            state.status = status;
            run.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Terminal transition for the run itself. Idempotent: a run already
    /// terminal is left as-is.
    pub async fn finish(
        &self,
        run_id: Uuid,
        status: RunStatus,
        final_outputs: Value,
    ) -> Result<(), WorkflowError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&run_id).ok_or(WorkflowError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Ok(());
        }
        run.status = status;
        run.final_outputs = final_outputs;
        run.updated_at = Utc::now();
        Ok(())
    }

    pub async fn list_undelivered_terminal(&self) -> Vec<WorkflowRun> {
        self.runs
            .read()
            .await
            .values()
            .filter(|r| r.status.is_terminal() && !r.delivered)
            .cloned()
            .collect()
    }

    pub async fn mark_delivered(&self, run_id: Uuid) -> Result<(), WorkflowError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&run_id).ok_or(WorkflowError::RunNotFound(run_id))?;
        run.delivered = true;
        run.updated_at = Utc::now();
        Ok(())
    }
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, deps: &[&str]) -> StepDefinition {
        let mut input_mappings = HashMap::new();
        input_mappings.insert(
            "prompt".to_string(),
            InputSource::Static { value: json!("hi") },
        );
        for (i, dep) in deps.iter().enumerate() {
            input_mappings.insert(
                format!("in{i}"),
                InputSource::FromStep {
                    step_id: dep.to_string(),
                    field: None,
                },
            );
        }
        StepDefinition {
            step_id: id.to_string(),
            tool_id: "tool".to_string(),
            input_mappings,
        }
    }

    #[test]
    fn test_linear_chain_orders_by_dependency() {
        let waves = validate_definition(&[step("c", &["b"]), step("a", &[]), step("b", &["a"])])
            .unwrap();
        assert_eq!(waves, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_independent_steps_share_a_wave() {
        let waves =
            validate_definition(&[step("a", &[]), step("b", &[]), step("c", &["a", "b"])]).unwrap();
        assert_eq!(waves.len(), 2);
        let mut first = waves[0].clone();
        first.sort();
        assert_eq!(first, vec!["a", "b"]);
        assert_eq!(waves[1], vec!["c"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = validate_definition(&[step("a", &["b"]), step("b", &["a"])]).unwrap_err();
        assert!(matches!(err, WorkflowError::CyclicGraph));

        let err = validate_definition(&[step("a", &["a"])]).unwrap_err();
        assert!(matches!(err, WorkflowError::CyclicGraph));
    }

    #[test]
    fn test_unknown_reference_and_duplicates_rejected() {
        let err = validate_definition(&[step("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownStepReference { .. }));
        assert_eq!(err.to_string(), "step a references unknown step: ghost");

        let err = validate_definition(&[step("a", &[]), step("a", &[])]).unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateStepId(_)));

        let err = validate_definition(&[]).unwrap_err();
        assert!(matches!(err, WorkflowError::EmptyDefinition));
    }

    #[tokio::test]
    async fn test_run_store_finish_is_idempotent() {
        let store = RunStore::new();
        let run = WorkflowRun::new(Uuid::new_v4(), vec![step("a", &[])], "chat:1");
        let id = store.insert(run).await;

        store
            .finish(id, RunStatus::Completed, json!({"output": 1}))
            .await
            .unwrap();
        store
            .finish(id, RunStatus::Failed, Value::Null)
            .await
            .unwrap();

        let run = store.get(id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.final_outputs, json!({"output": 1}));
    }
}
