//! Generation Record Store
//!
//! Persisted record of one atomic tool invocation, the unit of cost and of
//! webhook correlation. The store is the single source of truth for a
//! generation's lifecycle: there is no process-local map of start times or
//! in-flight jobs anywhere else (that state dies with a worker restart and
//! races under multiple workers).

pub mod api;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::shared::models::{GenerationRecord, GenerationStatus};

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("generation not found: {0}")]
    NotFound(Uuid),
    #[error("no generation with external run id: {0}")]
    ExternalRunIdNotFound(String),
    #[error("duplicate external run id: {0}")]
    DuplicateExternalRunId(String),
    #[error("store event channel closed")]
    ChannelClosed,
}

/// Partial-merge update. `None` fields are left untouched on the stored
/// record; status writes go through the transition guard and an update
/// carrying a non-allowed status is dropped whole.
#[derive(Debug, Clone, Default)]
pub struct UpdateGeneration {
    pub status: Option<GenerationStatus>,
    pub external_run_id: Option<String>,
    pub response_payload: Option<Value>,
    pub failure_reason: Option<String>,
    pub cost_final: Option<BigDecimal>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub delivered: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct GenerationEvent {
    pub generation_id: Uuid,
    pub run_id: Option<Uuid>,
    pub status: GenerationStatus,
}

#[async_trait]
pub trait GenerationStore: Send + Sync {
    async fn create(&self, record: GenerationRecord) -> Result<Uuid, GenerationError>;

    async fn get(&self, id: Uuid) -> Result<GenerationRecord, GenerationError>;

    async fn find_by_external_run_id(
        &self,
        external_run_id: &str,
    ) -> Result<GenerationRecord, GenerationError>;

    /// Applies a partial update. Returns the record as stored afterwards,
    /// which equals the prior record when a guarded status write was dropped.
    async fn update(
        &self,
        id: Uuid,
        update: UpdateGeneration,
    ) -> Result<GenerationRecord, GenerationError>;

    /// Terminal records not yet handed to the dispatcher.
    async fn list_undelivered_terminal(&self) -> Result<Vec<GenerationRecord>, GenerationError>;

    /// Submitted/running records created before `cutoff`, for the timeout
    /// sweeper.
    async fn list_overdue(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<GenerationRecord>, GenerationError>;

    fn subscribe(&self) -> broadcast::Receiver<GenerationEvent>;

    /// Suspends until the record reaches a terminal status. Subscribes
    /// before the initial read, so a transition between the read and the
    /// first `recv` is never missed.
    async fn wait_terminal(&self, id: Uuid) -> Result<GenerationRecord, GenerationError> {
        let mut rx = self.subscribe();
        let record = self.get(id).await?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        loop {
            match rx.recv().await {
                Ok(ev) if ev.generation_id == id && ev.status.is_terminal() => {
                    return self.get(id).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let record = self.get(id).await?;
                    if record.status.is_terminal() {
                        return Ok(record);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(GenerationError::ChannelClosed);
                }
            }
        }
    }
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<Uuid, GenerationRecord>,
    by_external_run_id: HashMap<String, Uuid>,
}

pub struct MemoryGenerationStore {
    inner: Arc<RwLock<StoreInner>>,
    events: broadcast::Sender<GenerationEvent>,
}

impl MemoryGenerationStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(StoreInner::default())),
            events,
        }
    }
}

impl Default for MemoryGenerationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationStore for MemoryGenerationStore {
    async fn create(&self, record: GenerationRecord) -> Result<Uuid, GenerationError> {
        let id = record.id;
        let mut inner = self.inner.write().await;
        if let Some(ext) = &record.external_run_id {
            if inner.by_external_run_id.contains_key(ext) {
                return Err(GenerationError::DuplicateExternalRunId(ext.clone()));
            }
            inner.by_external_run_id.insert(ext.clone(), id);
        }
        inner.records.insert(id, record);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<GenerationRecord, GenerationError> {
        let inner = self.inner.read().await;
        inner
            .records
            .get(&id)
            .cloned()
            .ok_or(GenerationError::NotFound(id))
    }

    async fn find_by_external_run_id(
        &self,
        external_run_id: &str,
    ) -> Result<GenerationRecord, GenerationError> {
        let inner = self.inner.read().await;
        let id = inner
            .by_external_run_id
            .get(external_run_id)
            .copied()
            .ok_or_else(|| GenerationError::ExternalRunIdNotFound(external_run_id.to_string()))?;
        inner
            .records
            .get(&id)
            .cloned()
            .ok_or(GenerationError::NotFound(id))
    }

    async fn update(
        &self,
        id: Uuid,
        update: UpdateGeneration,
    ) -> Result<GenerationRecord, GenerationError> {
        let mut inner = self.inner.write().await;

        // Guard check first, against the record as currently stored.
        let status_change = {
            let record = inner.records.get(&id).ok_or(GenerationError::NotFound(id))?;
            match update.status {
                Some(next) if !record.status.can_transition_to(next) => {
                    debug!(
                        "generation {}: dropping update, {:?} -> {:?} not allowed",
                        id, record.status, next
                    );
                    return Ok(record.clone());
                }
                other => other,
            }
        };

        if let Some(ext) = &update.external_run_id {
            inner.by_external_run_id.insert(ext.clone(), id);
        }

        let record = inner.records.get_mut(&id).ok_or(GenerationError::NotFound(id))?;
        if let Some(status) = status_change {
            record.status = status;
        }
        if let Some(ext) = update.external_run_id {
            record.external_run_id = Some(ext);
        }
        if let Some(payload) = update.response_payload {
            record.response_payload = Some(payload);
        }
        if let Some(reason) = update.failure_reason {
            record.failure_reason = Some(reason);
        }
        if let Some(cost) = update.cost_final {
            record.cost_final = Some(cost);
        }
        // started_at is write-once: a duplicate "running" event must not
        // shift the clock forward and shrink the billed duration.
        if let (Some(started), None) = (update.started_at, record.started_at) {
            record.started_at = Some(started);
        }
        if let Some(ended) = update.ended_at {
            record.ended_at = Some(ended);
        }
        if let Some(delivered) = update.delivered {
            record.delivered = delivered;
        }
        record.updated_at = Utc::now();

        let result = record.clone();
        if let Some(status) = status_change {
            // Nobody subscribed is fine.
            let _ = self.events.send(GenerationEvent {
                generation_id: id,
                run_id: result.run_id,
                status,
            });
        }
        Ok(result)
    }

    async fn list_undelivered_terminal(&self) -> Result<Vec<GenerationRecord>, GenerationError> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .values()
            .filter(|r| r.status.is_terminal() && !r.delivered)
            .cloned()
            .collect())
    }

    async fn list_overdue(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<GenerationRecord>, GenerationError> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .values()
            .filter(|r| {
                matches!(
                    r.status,
                    GenerationStatus::Submitted | GenerationStatus::Running
                ) && r.created_at < cutoff
            })
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::CostRate;
    use bigdecimal::BigDecimal;
    use serde_json::json;

    fn record() -> GenerationRecord {
        GenerationRecord::new(
            Uuid::new_v4(),
            "upscale",
            json!({"image": "s3://in.png"}),
            CostRate::per_second(BigDecimal::from(1)),
            vec![],
            "chat:123",
        )
    }

    #[tokio::test]
    async fn test_create_get_roundtrip() {
        let store = MemoryGenerationStore::new();
        let rec = record();
        let id = store.create(rec.clone()).await.unwrap();
        let got = store.get(id).await.unwrap();
        assert_eq!(got.tool_id, "upscale");
        assert_eq!(got.status, GenerationStatus::Pending);
        assert!(store.get(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_find_by_external_run_id_after_update() {
        let store = MemoryGenerationStore::new();
        let id = store.create(record()).await.unwrap();
        store
            .update(
                id,
                UpdateGeneration {
                    status: Some(GenerationStatus::Submitted),
                    external_run_id: Some("ext-1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let found = store.find_by_external_run_id("ext-1").await.unwrap();
        assert_eq!(found.id, id);
        assert!(store.find_by_external_run_id("ext-2").await.is_err());
    }

    #[tokio::test]
    async fn test_guarded_update_is_dropped_whole() {
        let store = MemoryGenerationStore::new();
        let id = store.create(record()).await.unwrap();
        store
            .update(
                id,
                UpdateGeneration {
                    status: Some(GenerationStatus::Failed),
                    failure_reason: Some("boom".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Replay of the same terminal event: nothing may change.
        let after = store
            .update(
                id,
                UpdateGeneration {
                    status: Some(GenerationStatus::Failed),
                    failure_reason: Some("boom again".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(after.failure_reason.as_deref(), Some("boom"));
        assert_eq!(after.status, GenerationStatus::Failed);
    }

    #[tokio::test]
    async fn test_started_at_is_write_once() {
        let store = MemoryGenerationStore::new();
        let id = store.create(record()).await.unwrap();
        let first = Utc::now();
        store
            .update(
                id,
                UpdateGeneration {
                    status: Some(GenerationStatus::Running),
                    started_at: Some(first),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let later = first + chrono::Duration::seconds(30);
        let rec = store
            .update(
                id,
                UpdateGeneration {
                    started_at: Some(later),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(rec.started_at, Some(first));
    }

    #[tokio::test]
    async fn test_wait_terminal_wakes_on_transition() {
        let store = Arc::new(MemoryGenerationStore::new());
        let id = store.create(record()).await.unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.wait_terminal(id).await })
        };
        tokio::task::yield_now().await;
        store
            .update(
                id,
                UpdateGeneration {
                    status: Some(GenerationStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let rec = tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(rec.status, GenerationStatus::Failed);
    }

    #[tokio::test]
    async fn test_undelivered_terminal_scan_excludes_delivered() {
        let store = MemoryGenerationStore::new();
        let id = store.create(record()).await.unwrap();
        assert!(store.list_undelivered_terminal().await.unwrap().is_empty());
        store
            .update(
                id,
                UpdateGeneration {
                    status: Some(GenerationStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(store.list_undelivered_terminal().await.unwrap().len(), 1);
        store
            .update(
                id,
                UpdateGeneration {
                    delivered: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(store.list_undelivered_terminal().await.unwrap().is_empty());
    }
}
