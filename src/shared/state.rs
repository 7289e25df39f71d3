use std::sync::Arc;

use crate::config::AppConfig;
use crate::generation::GenerationStore;
use crate::ledger::LedgerService;
use crate::registry::ToolRegistry;
use crate::webhook::WebhookCorrelator;
use crate::workflow::engine::WorkflowEngine;
use crate::workflow::RunStore;

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn GenerationStore>,
    pub runs: Arc<RunStore>,
    pub ledger: Arc<LedgerService>,
    pub registry: Arc<dyn ToolRegistry>,
    pub engine: WorkflowEngine,
    pub correlator: Arc<WebhookCorrelator>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn GenerationStore>,
        runs: Arc<RunStore>,
        ledger: Arc<LedgerService>,
        registry: Arc<dyn ToolRegistry>,
    ) -> Self {
        let engine = WorkflowEngine::new(Arc::clone(&store), Arc::clone(&runs), Arc::clone(&registry));
        let correlator = Arc::new(WebhookCorrelator::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            config.creator_fee_percent.clone(),
            config.orphan_retry_window(),
        ));
        Self {
            config,
            store,
            runs,
            ledger,
            registry,
            engine,
            correlator,
        }
    }
}
