//! Timeout sweeper.
//!
//! A generation whose terminal callback never arrives within the
//! configured bound is failed with reason `timeout`, which also wakes any
//! engine wait suspended on it.

use chrono::Utc;
use log::{error, warn};
use std::sync::Arc;
use tokio::time::{interval, Duration};

use crate::generation::{GenerationStore, UpdateGeneration};
use crate::shared::models::GenerationStatus;

pub const TIMEOUT_REASON: &str = "timeout";

pub struct TimeoutSweeper {
    store: Arc<dyn GenerationStore>,
    step_timeout: chrono::Duration,
}

impl TimeoutSweeper {
    pub fn new(store: Arc<dyn GenerationStore>, step_timeout: chrono::Duration) -> Self {
        Self {
            store,
            step_timeout,
        }
    }

    /// One pass: fail every submitted/running record older than the bound.
    /// Returns how many records were timed out.
    pub async fn sweep_once(&self) -> usize {
        let cutoff = Utc::now() - self.step_timeout;
        let overdue = match self.store.list_overdue(cutoff).await {
            Ok(records) => records,
            Err(e) => {
                error!("timeout sweep scan failed: {e}");
                return 0;
            }
        };

        let mut swept = 0;
        for record in overdue {
            warn!(
                "generation {}: no terminal callback within {}s, failing",
                record.id,
                self.step_timeout.num_seconds()
            );
            let result = self
                .store
                .update(
                    record.id,
                    UpdateGeneration {
                        status: Some(GenerationStatus::Failed),
                        failure_reason: Some(TIMEOUT_REASON.to_string()),
                        ended_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await;
            match result {
                Ok(updated) if updated.status == GenerationStatus::Failed => swept += 1,
                // A callback won the race between scan and update; the
                // guard dropped our write, which is exactly right.
                Ok(_) => {}
                Err(e) => error!("generation {}: timeout update failed: {e}", record.id),
            }
        }
        swept
    }
}

pub fn spawn_sweep_loop(sweeper: Arc<TimeoutSweeper>, every: Duration) {
    tokio::spawn(async move {
        let mut tick = interval(every);
        loop {
            tick.tick().await;
            sweeper.sweep_once().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::MemoryGenerationStore;
    use crate::shared::models::{CostRate, GenerationRecord};
    use bigdecimal::BigDecimal;
    use serde_json::json;
    use uuid::Uuid;

    async fn submitted(store: &MemoryGenerationStore) -> Uuid {
        let record = GenerationRecord::new(
            Uuid::new_v4(),
            "t",
            json!({}),
            CostRate::per_second(BigDecimal::from(1)),
            vec![],
            "chat:1",
        );
        let id = store.create(record).await.unwrap();
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
        id
    }

    #[tokio::test]
    async fn test_overdue_record_failed_with_timeout_reason() {
        let store = Arc::new(MemoryGenerationStore::new());
        let id = submitted(&store).await;

        // Zero bound: everything submitted is immediately overdue.
        let sweeper = TimeoutSweeper::new(
            Arc::clone(&store) as Arc<dyn GenerationStore>,
            chrono::Duration::zero(),
        );
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(sweeper.sweep_once().await, 1);

        let record = store.get(id).await.unwrap();
        assert_eq!(record.status, GenerationStatus::Failed);
        assert_eq!(record.failure_reason.as_deref(), Some(TIMEOUT_REASON));

        // Already terminal: nothing left to sweep.
        assert_eq!(sweeper.sweep_once().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_unblocks_engine_wait() {
        let store = Arc::new(MemoryGenerationStore::new());
        let id = submitted(&store).await;
        let sweeper = TimeoutSweeper::new(
            Arc::clone(&store) as Arc<dyn GenerationStore>,
            chrono::Duration::zero(),
        );

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.wait_terminal(id).await })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        sweeper.sweep_once().await;

        let record = tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(record.status, GenerationStatus::Failed);
    }

    #[tokio::test]
    async fn test_fresh_records_not_swept() {
        let store = Arc::new(MemoryGenerationStore::new());
        let id = submitted(&store).await;
        let sweeper = TimeoutSweeper::new(
            Arc::clone(&store) as Arc<dyn GenerationStore>,
            chrono::Duration::hours(1),
        );
        assert_eq!(sweeper.sweep_once().await, 0);
        assert_eq!(
            store.get(id).await.unwrap().status,
            GenerationStatus::Submitted
        );
    }
}
