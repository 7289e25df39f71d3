use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub balance: BigDecimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Debit,
    Credit,
    Reward,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    pub entry_type: EntryType,
    pub amount: BigDecimal,
    pub balance_before: BigDecimal,
    pub balance_after: BigDecimal,
    pub related_generation_id: Option<Uuid>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Submitted,
    Running,
    Succeeded,
    Failed,
    PaymentFailed,
}

impl GenerationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::PaymentFailed)
    }

    /// One-directional transition guard. A status "behind" the current one
    /// is never reachable again, which is what makes duplicate or replayed
    /// callback events a no-op at the store layer.
    pub fn can_transition_to(&self, next: Self) -> bool {
        use GenerationStatus::*;
        matches!(
            (*self, next),
            (Pending, Submitted)
                | (Pending, Running)
                | (Pending, Succeeded)
                | (Pending, Failed)
                | (Submitted, Running)
                | (Submitted, Succeeded)
                | (Submitted, Failed)
                | (Submitted, PaymentFailed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, PaymentFailed)
                | (Succeeded, PaymentFailed)
        )
    }
}

/// Metered price captured at submission time, so later rate changes in the
/// registry never affect an in-flight generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRate {
    pub amount: BigDecimal,
    pub unit: String,
}

impl CostRate {
    pub fn per_second(amount: BigDecimal) -> Self {
        Self {
            amount,
            unit: "second".to_string(),
        }
    }
}

/// One atomic invocation of one tool. The unit of cost and of webhook
/// correlation. Never deleted; status/cost fields are written by the
/// webhook correlator and `delivered` by the dispatcher only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub tool_id: String,
    pub external_run_id: Option<String>,
    pub status: GenerationStatus,
    pub request_payload: Value,
    pub response_payload: Option<Value>,
    pub failure_reason: Option<String>,
    pub cost_rate: CostRate,
    pub cost_final: Option<BigDecimal>,
    pub creator_ids: Vec<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub run_id: Option<Uuid>,
    pub step_id: Option<String>,
    pub delivered: bool,
    pub notification_target: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationRecord {
    pub fn new(
        account_id: Uuid,
        tool_id: &str,
        request_payload: Value,
        cost_rate: CostRate,
        creator_ids: Vec<Uuid>,
        notification_target: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id,
            tool_id: tool_id.to_string(),
            external_run_id: None,
            status: GenerationStatus::Pending,
            request_payload,
            response_payload: None,
            failure_reason: None,
            cost_rate,
            cost_final: None,
            creator_ids,
            started_at: None,
            ended_at: None,
            run_id: None,
            step_id: None,
            delivered: false,
            notification_target: notification_target.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Where one named input of a step comes from. Validated once at
/// submission, never re-interpreted during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSource {
    Static { value: Value },
    FromStep { step_id: String, field: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub step_id: String,
    pub tool_id: String,
    #[serde(default)]
    pub input_mappings: HashMap<String, InputSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    PartiallyCompleted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub generation_id: Option<Uuid>,
    pub status: GenerationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub account_id: Uuid,
    pub definition: Vec<StepDefinition>,
    pub step_statuses: HashMap<String, StepState>,
    pub status: RunStatus,
    pub final_outputs: Value,
    pub delivered: bool,
    pub notification_target: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(account_id: Uuid, definition: Vec<StepDefinition>, notification_target: &str) -> Self {
        let now = Utc::now();
        let step_statuses = definition
            .iter()
            .map(|s| {
                (
                    s.step_id.clone(),
                    StepState {
                        generation_id: None,
                        status: GenerationStatus::Pending,
                    },
                )
            })
            .collect();
        Self {
            id: Uuid::new_v4(),
            account_id,
            definition,
            step_statuses,
            status: RunStatus::Running,
            final_outputs: Value::Null,
            delivered: false,
            notification_target: notification_target.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}
