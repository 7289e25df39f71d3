//! Workflow Execution Engine
//!
//! Drives a validated step graph to submission wave by wave, feeding the
//! outputs of completed steps into the declared inputs of their dependents.
//! The engine never settles money and never touches a callback: it creates
//! records, submits to providers and suspends on the store's event channel
//! until the webhook correlator (or the timeout sweeper) makes a step
//! terminal.

use futures::future::join_all;
use log::{error, info, warn};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::generation::{GenerationStore, UpdateGeneration};
use crate::registry::{InvocationContract, ToolRegistry};
use crate::shared::models::{
    GenerationRecord, GenerationStatus, InputSource, RunStatus, StepDefinition,
};
use crate::workflow::{validate_definition, RunStore, WorkflowError};

/// Output field assumed when a mapping names none, and fallen back to when
/// the named field is absent. Heterogeneous tools rarely share an output
/// schema, so the primary artifact lands here by convention.
pub const DEFAULT_OUTPUT_FIELD: &str = "output";

#[derive(Clone)]
pub struct WorkflowEngine {
    store: Arc<dyn GenerationStore>,
    runs: Arc<RunStore>,
    registry: Arc<dyn ToolRegistry>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn GenerationStore>,
        runs: Arc<RunStore>,
        registry: Arc<dyn ToolRegistry>,
    ) -> Self {
        Self {
            store,
            runs,
            registry,
        }
    }

    /// Validates the whole definition (graph and tool ids) before creating
    /// anything, then drives execution in the background and returns the
    /// run id immediately.
    pub async fn submit_run(
        &self,
        account_id: Uuid,
        steps: Vec<StepDefinition>,
        notification_target: &str,
    ) -> Result<Uuid, WorkflowError> {
        let waves = validate_definition(&steps)?;

        let mut contracts = HashMap::new();
        for step in &steps {
            let contract = self.registry.invocation_contract(&step.tool_id).await?;
            contracts.insert(step.step_id.clone(), contract);
        }

        let run = crate::shared::models::WorkflowRun::new(account_id, steps, notification_target);
        let run_id = self.runs.insert(run).await;
        info!("run {run_id}: accepted, {} wave(s)", waves.len());

        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.drive_run(run_id, waves, contracts).await {
                error!("run {run_id}: aborted: {e}");
            }
        });
        Ok(run_id)
    }

    /// One-off invocation outside any run. The record is created and
    /// submitted; completion and settlement arrive via webhook like any
    /// step. Provider rejection marks the record failed (no cost) and is
    /// reported through the record, not as a submission error.
    pub async fn submit_standalone(
        &self,
        account_id: Uuid,
        tool_id: &str,
        inputs: Value,
        notification_target: &str,
    ) -> Result<Uuid, WorkflowError> {
        let contract = self.registry.invocation_contract(tool_id).await?;
        let record = GenerationRecord::new(
            account_id,
            tool_id,
            inputs.clone(),
            contract.cost_rate.clone(),
            contract.creator_ids.clone(),
            notification_target,
        );
        let id = self.store.create(record).await?;
        self.submit_to_provider(id, &contract, &inputs).await?;
        Ok(id)
    }

    async fn drive_run(
        &self,
        run_id: Uuid,
        waves: Vec<Vec<String>>,
        contracts: HashMap<String, InvocationContract>,
    ) -> Result<(), WorkflowError> {
        let run = self.runs.get(run_id).await?;
        let steps_by_id: HashMap<String, StepDefinition> = run
            .definition
            .iter()
            .map(|s| (s.step_id.clone(), s.clone()))
            .collect();
        let last_step_id = run
            .definition
            .last()
            .map(|s| s.step_id.clone())
            .unwrap_or_default();

        // Terminal records of completed steps, keyed by step id; the data
        // source for downstream input resolution.
        let mut done: HashMap<String, GenerationRecord> = HashMap::new();

        for wave in waves {
            let mut handles = Vec::new();
            for step_id in &wave {
                let step = steps_by_id[step_id].clone();
                let contract = contracts[step_id].clone();
                let inputs = self.resolve_inputs(run_id, &step, &done);
                let engine = self.clone();
                let account_id = run.account_id;
                let target = run.notification_target.clone();
                handles.push(tokio::spawn(async move {
                    engine
                        .run_step(run_id, account_id, step, contract, inputs, &target)
                        .await
                }));
            }

            let mut wave_failed = false;
            for (step_id, joined) in wave.iter().zip(join_all(handles).await) {
                let record = joined.map_err(|_| WorkflowError::RunNotFound(run_id));
                match record {
                    Ok(Ok(record)) => {
                        if record.status != GenerationStatus::Succeeded {
                            wave_failed = true;
                        }
                        done.insert(step_id.clone(), record);
                    }
                    Ok(Err(e)) | Err(e) => {
                        error!("run {run_id}: step {step_id} execution error: {e}");
                        wave_failed = true;
                    }
                }
            }

            if wave_failed {
                // Forward progress halts; charges already settled for prior
                // steps stay settled.
                let succeeded: Vec<&GenerationRecord> = done
                    .values()
                    .filter(|r| r.status == GenerationStatus::Succeeded)
                    .collect();
                let status = if succeeded.is_empty() {
                    RunStatus::Failed
                } else {
                    RunStatus::PartiallyCompleted
                };
                let mut outputs = Map::new();
                for record in succeeded {
                    if let (Some(step), Some(payload)) =
                        (&record.step_id, &record.response_payload)
                    {
                        outputs.insert(step.clone(), payload.clone());
                    }
                }
                warn!("run {run_id}: halted as {status:?}");
                self.runs.finish(run_id, status, Value::Object(outputs)).await?;
                return Ok(());
            }
        }

        let final_outputs = done
            .get(&last_step_id)
            .and_then(|r| r.response_payload.clone())
            .unwrap_or(Value::Null);
        info!("run {run_id}: completed");
        self.runs
            .finish(run_id, RunStatus::Completed, final_outputs)
            .await?;
        Ok(())
    }

    async fn run_step(
        &self,
        run_id: Uuid,
        account_id: Uuid,
        step: StepDefinition,
        contract: InvocationContract,
        inputs: Value,
        notification_target: &str,
    ) -> Result<GenerationRecord, WorkflowError> {
        let mut record = GenerationRecord::new(
            account_id,
            &step.tool_id,
            inputs.clone(),
            contract.cost_rate.clone(),
            contract.creator_ids.clone(),
            notification_target,
        );
        record.run_id = Some(run_id);
        record.step_id = Some(step.step_id.clone());
        let id = self.store.create(record).await?;
        self.runs
            .set_step(run_id, &step.step_id, Some(id), GenerationStatus::Pending)
            .await?;

        let submitted = self.submit_to_provider(id, &contract, &inputs).await?;
        self.runs
            .set_step(run_id, &step.step_id, None, submitted.status)
            .await?;
        if submitted.status.is_terminal() {
            return Ok(submitted);
        }

        let terminal = self.store.wait_terminal(id).await?;
        self.runs
            .set_step(run_id, &step.step_id, None, terminal.status)
            .await?;
        Ok(terminal)
    }

    /// Submit one record to the external provider. Returns the record as
    /// stored afterwards: `submitted` with an external run id on success,
    /// `failed` on provider rejection.
    async fn submit_to_provider(
        &self,
        id: Uuid,
        contract: &InvocationContract,
        inputs: &Value,
    ) -> Result<GenerationRecord, WorkflowError> {
        match contract.invoker.submit(inputs).await {
            Ok(external_run_id) => {
                let record = self
                    .store
                    .update(
                        id,
                        UpdateGeneration {
                            status: Some(GenerationStatus::Submitted),
                            external_run_id: Some(external_run_id.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                info!("generation {id}: submitted as {external_run_id}");
                Ok(record)
            }
            Err(e) => {
                warn!("generation {id}: provider rejected submission: {e}");
                let record = self
                    .store
                    .update(
                        id,
                        UpdateGeneration {
                            status: Some(GenerationStatus::Failed),
                            failure_reason: Some(e.to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(record)
            }
        }
    }

    /// Builds the request payload for one step. Whatever value resolution
    /// produces is recorded verbatim in the record's `request_payload`.
    fn resolve_inputs(
        &self,
        run_id: Uuid,
        step: &StepDefinition,
        done: &HashMap<String, GenerationRecord>,
    ) -> Value {
        let mut resolved = Map::new();
        for (name, source) in &step.input_mappings {
            let value = match source {
                InputSource::Static { value } => value.clone(),
                InputSource::FromStep { step_id, field } => {
                    let payload = done.get(step_id).and_then(|r| r.response_payload.as_ref());
                    self.pick_output(run_id, &step.step_id, step_id, field.as_deref(), payload)
                }
            };
            resolved.insert(name.clone(), value);
        }
        Value::Object(resolved)
    }

    fn pick_output(
        &self,
        run_id: Uuid,
        step_id: &str,
        source_step: &str,
        field: Option<&str>,
        payload: Option<&Value>,
    ) -> Value {
        let wanted = field.unwrap_or(DEFAULT_OUTPUT_FIELD);
        match payload {
            Some(Value::Object(map)) => {
                if let Some(v) = map.get(wanted) {
                    v.clone()
                } else if wanted != DEFAULT_OUTPUT_FIELD {
                    if let Some(v) = map.get(DEFAULT_OUTPUT_FIELD) {
                        warn!(
                            "run {run_id}: step {step_id} input from {source_step}.{wanted} \
                             absent, falling back to {DEFAULT_OUTPUT_FIELD}"
                        );
                        v.clone()
                    } else {
                        warn!(
                            "run {run_id}: step {step_id} found neither {wanted} nor \
                             {DEFAULT_OUTPUT_FIELD} in {source_step} outputs"
                        );
                        Value::Null
                    }
                } else {
                    warn!(
                        "run {run_id}: step {step_id} found no {DEFAULT_OUTPUT_FIELD} field \
                         in {source_step} outputs"
                    );
                    Value::Null
                }
            }
            // A bare (non-object) payload is itself the primary artifact.
            Some(other) => other.clone(),
            None => {
                warn!("run {run_id}: step {step_id} source {source_step} has no outputs");
                Value::Null
            }
        }
    }
}
