//! Webhook Correlator
//!
//! Reconciles one external provider callback with exactly one generation
//! record and drives settlement. Handling of one record is serialized
//! behind a per-external-run-id lock; events for different records proceed
//! fully in parallel. Orphan callbacks (no matching record yet, usually a
//! race with submission) are retried for a bounded window, then logged.

pub mod api;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, Duration};
use uuid::Uuid;

use crate::generation::{GenerationError, GenerationStore, UpdateGeneration};
use crate::ledger::rewards;
use crate::ledger::{LedgerError, LedgerService};
use crate::shared::models::{GenerationRecord, GenerationStatus};

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("unknown webhook provider: {0}")]
    UnknownProvider(String),
    #[error("payload missing external run identifier")]
    MissingRunId,
    #[error("unmappable provider status: {0}")]
    UnmappableStatus(String),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    Running,
    Succeeded,
    Failed,
}

/// A provider callback normalized to the shape the correlator consumes.
#[derive(Debug, Clone)]
pub struct CallbackEvent {
    pub external_run_id: String,
    pub status: CallbackStatus,
    pub outputs: Option<Value>,
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The event moved the record forward (and settled it, if terminal).
    Applied,
    /// Duplicate or late event: the record was already at or past the
    /// named status. Nothing changed.
    Ignored,
    /// No matching record yet; queued for bounded retry.
    Queued,
}

struct OrphanEvent {
    event: CallbackEvent,
    provider: String,
    expires_at: DateTime<Utc>,
}

pub struct WebhookCorrelator {
    store: Arc<dyn GenerationStore>,
    ledger: Arc<LedgerService>,
    creator_fee_percent: BigDecimal,
    orphan_retry_window: chrono::Duration,
    orphans: Mutex<Vec<OrphanEvent>>,
    record_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl WebhookCorrelator {
    pub fn new(
        store: Arc<dyn GenerationStore>,
        ledger: Arc<LedgerService>,
        creator_fee_percent: BigDecimal,
        orphan_retry_window: chrono::Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            creator_fee_percent,
            orphan_retry_window,
            orphans: Mutex::new(Vec::new()),
            record_locks: RwLock::new(HashMap::new()),
        }
    }

    /// Maps a provider-specific payload into a normalized event. Every
    /// supported provider must surface an external run identifier and a
    /// status mappable to running/succeeded/failed.
    pub fn parse_event(&self, provider: &str, payload: &Value) -> Result<CallbackEvent, WebhookError> {
        match provider {
            "generic" => parse_generic(payload),
            other => Err(WebhookError::UnknownProvider(other.to_string())),
        }
    }

    /// Entry point for the HTTP receiver and the orphan retry loop.
    pub async fn handle_event(
        &self,
        provider: &str,
        event: CallbackEvent,
    ) -> Result<HandleOutcome, WebhookError> {
        match self.store.find_by_external_run_id(&event.external_run_id).await {
            Ok(record) => self.process(record.id, event).await,
            Err(GenerationError::ExternalRunIdNotFound(_)) => {
                info!(
                    "callback for unknown run {} from {provider}, queueing for retry",
                    event.external_run_id
                );
                self.orphans.lock().await.push(OrphanEvent {
                    expires_at: event.received_at + self.orphan_retry_window,
                    provider: provider.to_string(),
                    event,
                });
                Ok(HandleOutcome::Queued)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn process(
        &self,
        generation_id: Uuid,
        event: CallbackEvent,
    ) -> Result<HandleOutcome, WebhookError> {
        let lock = self.lock_for(&event.external_run_id).await;
        let _guard = lock.lock().await;

        // Re-read under the lock: a concurrent duplicate may have already
        // driven the transition.
        let record = self.store.get(generation_id).await?;
        let outcome = match event.status {
            CallbackStatus::Running => self.apply_running(&record, &event).await,
            CallbackStatus::Succeeded => self.settle_success(&record, &event).await,
            CallbackStatus::Failed => self.apply_failure(&record, &event).await,
        };

        // Terminal records take no further transitions, so their lock entry
        // can go. In-flight waiters keep their Arc and re-read a terminal
        // record; a later duplicate gets a fresh lock and is ignored anyway.
        if let Ok(current) = self.store.get(generation_id).await {
            if current.status.is_terminal() {
                self.record_locks
                    .write()
                    .await
                    .remove(&event.external_run_id);
            }
        }
        outcome
    }

    async fn apply_running(
        &self,
        record: &GenerationRecord,
        event: &CallbackEvent,
    ) -> Result<HandleOutcome, WebhookError> {
        if !record.status.can_transition_to(GenerationStatus::Running) {
            return Ok(HandleOutcome::Ignored);
        }
        self.store
            .update(
                record.id,
                UpdateGeneration {
                    status: Some(GenerationStatus::Running),
                    started_at: Some(event.received_at),
                    ..Default::default()
                },
            )
            .await?;
        Ok(HandleOutcome::Applied)
    }

    async fn settle_success(
        &self,
        record: &GenerationRecord,
        event: &CallbackEvent,
    ) -> Result<HandleOutcome, WebhookError> {
        if record.status.is_terminal() {
            return Ok(HandleOutcome::Ignored);
        }
        let ended_at = event.received_at;
        if record.started_at.is_none() {
            warn!(
                "generation {}: terminal callback without a recorded start, billing zero duration",
                record.id
            );
        }
        let duration = rewards::duration_seconds(record.started_at, ended_at);
        let base = rewards::base_cost(duration, &record.cost_rate);
        let fee = if record.creator_ids.is_empty() {
            BigDecimal::from(0)
        } else {
            rewards::creator_fee(&base, &self.creator_fee_percent)
        };
        let total = rewards::settlement_total(&base, &fee);

        let debit = self
            .ledger
            .debit(
                record.account_id,
                total.clone(),
                Some(record.id),
                &format!("generation {} ({} x {}s)", record.id, record.tool_id, duration),
            )
            .await;

        match debit {
            Ok(_) => {
                let updated = self
                    .store
                    .update(
                        record.id,
                        UpdateGeneration {
                            status: Some(GenerationStatus::Succeeded),
                            response_payload: event.outputs.clone(),
                            cost_final: Some(base.clone()),
                            ended_at: Some(ended_at),
                            ..Default::default()
                        },
                    )
                    .await?;
                // The transition guard may have dropped the write (e.g. the
                // timeout sweeper marked the record Failed between our
                // re-read and here). The debit must not stand for a record
                // that never reached Succeeded.
                if updated.status != GenerationStatus::Succeeded {
                    warn!(
                        "generation {}: success write lost to concurrent {:?}, refunding {total}",
                        record.id, updated.status
                    );
                    self.ledger
                        .credit(
                            record.account_id,
                            total.clone(),
                            Some(record.id),
                            &format!("refund for generation {}", record.id),
                        )
                        .await?;
                    return Ok(HandleOutcome::Ignored);
                }
                info!(
                    "generation {}: settled, cost {} (+{} creator fee)",
                    record.id, base, fee
                );
                // Reward issuance only after the consumer's debit committed.
                let share = rewards::split_even(&fee, record.creator_ids.len());
                for creator in &record.creator_ids {
                    if let Err(e) = self
                        .ledger
                        .reward(
                            *creator,
                            share.clone(),
                            Some(record.id),
                            &format!("creator fee share for generation {}", record.id),
                        )
                        .await
                    {
                        // The consumer already paid; a bounced reward is an
                        // accounting gap to flag, not a reason to unwind.
                        error!(
                            "generation {}: reward credit to {creator} failed: {e}",
                            record.id
                        );
                    }
                }
                Ok(HandleOutcome::Applied)
            }
            Err(LedgerError::InsufficientFunds { balance, amount }) => {
                warn!(
                    "generation {}: debit {amount} rejected (balance {balance}), withholding result",
                    record.id
                );
                // The computed result is withheld: response_payload is not
                // persisted as deliverable.
                self.store
                    .update(
                        record.id,
                        UpdateGeneration {
                            status: Some(GenerationStatus::PaymentFailed),
                            failure_reason: Some("insufficient funds".to_string()),
                            cost_final: Some(base),
                            ended_at: Some(ended_at),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(HandleOutcome::Applied)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_failure(
        &self,
        record: &GenerationRecord,
        event: &CallbackEvent,
    ) -> Result<HandleOutcome, WebhookError> {
        if record.status.is_terminal() {
            return Ok(HandleOutcome::Ignored);
        }
        self.store
            .update(
                record.id,
                UpdateGeneration {
                    status: Some(GenerationStatus::Failed),
                    failure_reason: Some(
                        event.error.clone().unwrap_or_else(|| "provider failure".to_string()),
                    ),
                    ended_at: Some(event.received_at),
                    ..Default::default()
                },
            )
            .await?;
        Ok(HandleOutcome::Applied)
    }

    async fn lock_for(&self, external_run_id: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.record_locks.read().await;
            if let Some(lock) = locks.get(external_run_id) {
                return Arc::clone(lock);
            }
        }
        let mut locks = self.record_locks.write().await;
        Arc::clone(
            locks
                .entry(external_run_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// One pass over the orphan queue: retry correlation, keep what is
    /// still inside its window, log and drop the rest. Returns how many
    /// events were re-applied.
    pub async fn retry_orphans_once(&self) -> usize {
        let pending = {
            let mut orphans = self.orphans.lock().await;
            std::mem::take(&mut *orphans)
        };
        if pending.is_empty() {
            return 0;
        }

        let now = Utc::now();
        let mut applied = 0;
        let mut keep = Vec::new();
        for orphan in pending {
            match self
                .store
                .find_by_external_run_id(&orphan.event.external_run_id)
                .await
            {
                Ok(record) => match self.process(record.id, orphan.event.clone()).await {
                    Ok(HandleOutcome::Applied) => applied += 1,
                    Ok(_) => {}
                    Err(e) => error!(
                        "orphan retry for {} failed: {e}",
                        orphan.event.external_run_id
                    ),
                },
                Err(GenerationError::ExternalRunIdNotFound(_)) if now < orphan.expires_at => {
                    keep.push(orphan);
                }
                Err(_) => {
                    warn!(
                        "orphaned callback from {}: no record ever matched external run {}",
                        orphan.provider, orphan.event.external_run_id
                    );
                }
            }
        }
        self.orphans.lock().await.extend(keep);
        applied
    }

    pub async fn orphan_queue_len(&self) -> usize {
        self.orphans.lock().await.len()
    }

    pub async fn record_lock_count(&self) -> usize {
        self.record_locks.read().await.len()
    }
}

fn parse_generic(payload: &Value) -> Result<CallbackEvent, WebhookError> {
    let external_run_id = payload
        .get("id")
        .or_else(|| payload.get("run_id"))
        .or_else(|| payload.get("external_run_id"))
        .and_then(Value::as_str)
        .ok_or(WebhookError::MissingRunId)?
        .to_string();

    let raw_status = payload
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| WebhookError::UnmappableStatus("<missing>".to_string()))?;
    let status = match raw_status {
        "running" | "processing" | "in_progress" | "started" => CallbackStatus::Running,
        "succeeded" | "success" | "completed" | "done" => CallbackStatus::Succeeded,
        "failed" | "error" | "canceled" | "cancelled" => CallbackStatus::Failed,
        other => return Err(WebhookError::UnmappableStatus(other.to_string())),
    };

    let outputs = payload
        .get("outputs")
        .or_else(|| payload.get("output"))
        .cloned();
    let error = payload
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(CallbackEvent {
        external_run_id,
        status,
        outputs,
        error,
        received_at: Utc::now(),
    })
}

pub fn spawn_orphan_retry_loop(correlator: Arc<WebhookCorrelator>, every: Duration) {
    tokio::spawn(async move {
        let mut tick = interval(every);
        loop {
            tick.tick().await;
            let applied = correlator.retry_orphans_once().await;
            if applied > 0 {
                info!("orphan retry: re-applied {applied} callback(s)");
            }
        }
    });
}
