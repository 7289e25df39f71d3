//! Notification Dispatcher
//!
//! Scans for terminal, undelivered generations and runs and hands each one
//! to the platform delivery adapter. The order is deliver-then-mark: a
//! crash in between risks one duplicate delivery, never a silent loss.

use async_trait::async_trait;
use log::{error, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::{interval, Duration};

use crate::generation::{GenerationStore, UpdateGeneration};
use crate::shared::models::{GenerationRecord, GenerationStatus, RunStatus, WorkflowRun};
use crate::workflow::RunStore;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery failed, retryable: {0}")]
    Retryable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Succeeded { outputs: Value },
    Failed { reason: String },
    /// Some steps of a run succeeded before one failed; their outputs are
    /// preserved and delivered alongside the failure summary.
    Partial { outputs: Value, reason: String },
    /// The result exists but was withheld because settlement was rejected.
    /// Deliberately carries no artifact.
    PaymentFailed,
}

/// Platform-specific delivery hook, provided by each platform adapter.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    async fn deliver(&self, target: &str, outcome: DeliveryOutcome) -> Result<(), DeliveryError>;
}

/// Default adapter for deployments without a platform wired in: logs the
/// outcome and confirms the hand-off.
pub struct LogDeliveryAdapter;

#[async_trait]
impl DeliveryAdapter for LogDeliveryAdapter {
    async fn deliver(&self, target: &str, outcome: DeliveryOutcome) -> Result<(), DeliveryError> {
        info!("deliver to {target}: {outcome:?}");
        Ok(())
    }
}

pub struct NotificationDispatcher {
    store: Arc<dyn GenerationStore>,
    runs: Arc<RunStore>,
    adapter: Arc<dyn DeliveryAdapter>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn GenerationStore>,
        runs: Arc<RunStore>,
        adapter: Arc<dyn DeliveryAdapter>,
    ) -> Self {
        Self {
            store,
            runs,
            adapter,
        }
    }

    /// One scan cycle. Returns how many hand-offs were confirmed and
    /// marked. Retryable delivery failures stay undelivered and are picked
    /// up again by the next cycle.
    pub async fn dispatch_once(&self) -> usize {
        let mut delivered = 0;

        match self.store.list_undelivered_terminal().await {
            Ok(records) => {
                for record in records {
                    // Step records inside a run are internal state. Only the
                    // run-level result reaches the user, so mark them without
                    // an adapter hand-off.
                    if record.run_id.is_some() {
                        if let Err(e) = self
                            .store
                            .update(
                                record.id,
                                UpdateGeneration {
                                    delivered: Some(true),
                                    ..Default::default()
                                },
                            )
                            .await
                        {
                            error!("generation {}: could not retire step record: {e}", record.id);
                        }
                        continue;
                    }
                    let outcome = generation_outcome(&record);
                    match self.adapter.deliver(&record.notification_target, outcome).await {
                        Ok(()) => {
                            let marked = self
                                .store
                                .update(
                                    record.id,
                                    UpdateGeneration {
                                        delivered: Some(true),
                                        ..Default::default()
                                    },
                                )
                                .await;
                            match marked {
                                Ok(_) => delivered += 1,
                                Err(e) => {
                                    error!("generation {}: delivered but not marked: {e}", record.id)
                                }
                            }
                        }
                        Err(e) => warn!("generation {}: delivery deferred: {e}", record.id),
                    }
                }
            }
            Err(e) => error!("dispatcher scan failed: {e}"),
        }

        for run in self.runs.list_undelivered_terminal().await {
            let outcome = run_outcome(&run);
            match self.adapter.deliver(&run.notification_target, outcome).await {
                Ok(()) => match self.runs.mark_delivered(run.id).await {
                    Ok(()) => delivered += 1,
                    Err(e) => error!("run {}: delivered but not marked: {e}", run.id),
                },
                Err(e) => warn!("run {}: delivery deferred: {e}", run.id),
            }
        }

        delivered
    }
}

fn generation_outcome(record: &GenerationRecord) -> DeliveryOutcome {
    match record.status {
        GenerationStatus::Succeeded => DeliveryOutcome::Succeeded {
            outputs: record.response_payload.clone().unwrap_or(Value::Null),
        },
        GenerationStatus::PaymentFailed => DeliveryOutcome::PaymentFailed,
        _ => DeliveryOutcome::Failed {
            reason: record
                .failure_reason
                .clone()
                .unwrap_or_else(|| "generation failed".to_string()),
        },
    }
}

fn run_outcome(run: &WorkflowRun) -> DeliveryOutcome {
    match run.status {
        RunStatus::Completed => DeliveryOutcome::Succeeded {
            outputs: run.final_outputs.clone(),
        },
        RunStatus::PartiallyCompleted => {
            let failed: Vec<&str> = run
                .step_statuses
                .iter()
                .filter(|(_, s)| s.status != GenerationStatus::Succeeded)
                .map(|(id, _)| id.as_str())
                .collect();
            DeliveryOutcome::Partial {
                outputs: run.final_outputs.clone(),
                reason: format!("steps did not complete: {}", failed.join(", ")),
            }
        }
        _ => DeliveryOutcome::Failed {
            reason: "workflow run failed".to_string(),
        },
    }
}

pub fn spawn_dispatch_loop(dispatcher: Arc<NotificationDispatcher>, every: Duration) {
    tokio::spawn(async move {
        let mut tick = interval(every);
        loop {
            tick.tick().await;
            let n = dispatcher.dispatch_once().await;
            if n > 0 {
                info!("dispatcher: {n} hand-off(s) confirmed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::MemoryGenerationStore;
    use crate::shared::models::CostRate;
    use bigdecimal::BigDecimal;
    use serde_json::json;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    struct RecordingAdapter {
        calls: Mutex<Vec<(String, DeliveryOutcome)>>,
        fail_next: Mutex<bool>,
    }

    impl RecordingAdapter {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_next: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl DeliveryAdapter for RecordingAdapter {
        async fn deliver(
            &self,
            target: &str,
            outcome: DeliveryOutcome,
        ) -> Result<(), DeliveryError> {
            let mut fail = self.fail_next.lock().await;
            if *fail {
                *fail = false;
                return Err(DeliveryError::Retryable("platform unreachable".to_string()));
            }
            self.calls.lock().await.push((target.to_string(), outcome));
            Ok(())
        }
    }

    async fn terminal_record(
        store: &MemoryGenerationStore,
        status: GenerationStatus,
        run_id: Option<Uuid>,
    ) -> Uuid {
        let mut record = GenerationRecord::new(
            Uuid::new_v4(),
            "upscale",
            json!({}),
            CostRate::per_second(BigDecimal::from(1)),
            vec![],
            "chat:42",
        );
        record.run_id = run_id;
        let id = store.create(record).await.unwrap();
        // March through Submitted so every terminal status, PaymentFailed
        // included, is reachable under the transition guard.
        store
            .update(
                id,
                UpdateGeneration {
                    status: Some(GenerationStatus::Submitted),
                    external_run_id: Some(format!("ext-{id}")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let updated = store
            .update(
                id,
                UpdateGeneration {
                    status: Some(status),
                    response_payload: (status == GenerationStatus::Succeeded)
                        .then(|| json!({"output": "art.png"})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, status);
        id
    }

    #[tokio::test]
    async fn test_terminal_record_delivered_exactly_once() {
        let store = Arc::new(MemoryGenerationStore::new());
        let runs = Arc::new(RunStore::new());
        let adapter = Arc::new(RecordingAdapter::new());
        let dispatcher = NotificationDispatcher::new(
            Arc::clone(&store) as Arc<dyn GenerationStore>,
            runs,
            Arc::clone(&adapter) as Arc<dyn DeliveryAdapter>,
        );

        terminal_record(&store, GenerationStatus::Succeeded, None).await;
        assert_eq!(dispatcher.dispatch_once().await, 1);
        assert_eq!(dispatcher.dispatch_once().await, 0);

        let calls = adapter.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "chat:42");
        assert_eq!(
            calls[0].1,
            DeliveryOutcome::Succeeded {
                outputs: json!({"output": "art.png"})
            }
        );
    }

    #[tokio::test]
    async fn test_run_member_record_retired_without_hand_off() {
        let store = Arc::new(MemoryGenerationStore::new());
        let runs = Arc::new(RunStore::new());
        let adapter = Arc::new(RecordingAdapter::new());
        let dispatcher = NotificationDispatcher::new(
            Arc::clone(&store) as Arc<dyn GenerationStore>,
            runs,
            Arc::clone(&adapter) as Arc<dyn DeliveryAdapter>,
        );

        let id =
            terminal_record(&store, GenerationStatus::Succeeded, Some(Uuid::new_v4())).await;
        // Retired silently: no adapter call, no confirmed hand-off.
        assert_eq!(dispatcher.dispatch_once().await, 0);
        assert!(adapter.calls.lock().await.is_empty());
        assert!(store.get(id).await.unwrap().delivered);
        assert_eq!(dispatcher.dispatch_once().await, 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_keeps_record_for_next_scan() {
        let store = Arc::new(MemoryGenerationStore::new());
        let runs = Arc::new(RunStore::new());
        let adapter = Arc::new(RecordingAdapter::new());
        let dispatcher = NotificationDispatcher::new(
            Arc::clone(&store) as Arc<dyn GenerationStore>,
            runs,
            Arc::clone(&adapter) as Arc<dyn DeliveryAdapter>,
        );

        terminal_record(&store, GenerationStatus::Failed, None).await;
        *adapter.fail_next.lock().await = true;
        assert_eq!(dispatcher.dispatch_once().await, 0);
        assert_eq!(dispatcher.dispatch_once().await, 1);
        assert_eq!(adapter.calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_payment_failed_carries_no_artifact() {
        let store = Arc::new(MemoryGenerationStore::new());
        let runs = Arc::new(RunStore::new());
        let adapter = Arc::new(RecordingAdapter::new());
        let dispatcher = NotificationDispatcher::new(
            Arc::clone(&store) as Arc<dyn GenerationStore>,
            runs,
            Arc::clone(&adapter) as Arc<dyn DeliveryAdapter>,
        );

        terminal_record(&store, GenerationStatus::PaymentFailed, None).await;
        dispatcher.dispatch_once().await;
        let calls = adapter.calls.lock().await;
        assert_eq!(calls[0].1, DeliveryOutcome::PaymentFailed);
    }

    #[tokio::test]
    async fn test_terminal_run_delivered_once() {
        use crate::shared::models::{StepDefinition, WorkflowRun};
        let store = Arc::new(MemoryGenerationStore::new());
        let runs = Arc::new(RunStore::new());
        let adapter = Arc::new(RecordingAdapter::new());
        let dispatcher = NotificationDispatcher::new(
            Arc::clone(&store) as Arc<dyn GenerationStore>,
            Arc::clone(&runs),
            Arc::clone(&adapter) as Arc<dyn DeliveryAdapter>,
        );

        let run = WorkflowRun::new(
            Uuid::new_v4(),
            vec![StepDefinition {
                step_id: "a".to_string(),
                tool_id: "t".to_string(),
                input_mappings: Default::default(),
            }],
            "chat:7",
        );
        let run_id = runs.insert(run).await;
        runs.finish(run_id, RunStatus::Completed, json!({"output": "done"}))
            .await
            .unwrap();

        assert_eq!(dispatcher.dispatch_once().await, 1);
        assert_eq!(dispatcher.dispatch_once().await, 0);
        let calls = adapter.calls.lock().await;
        assert_eq!(calls[0].0, "chat:7");
    }
}
