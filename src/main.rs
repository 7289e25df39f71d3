use anyhow::Context;
use dotenvy::dotenv;
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::time::Duration;

use genserver::api_router::configure_api_routes;
use genserver::config::AppConfig;
use genserver::dispatch::{spawn_dispatch_loop, LogDeliveryAdapter, NotificationDispatcher};
use genserver::generation::{GenerationStore, MemoryGenerationStore};
use genserver::ledger::LedgerService;
use genserver::registry::{load_tools_file, StaticToolRegistry, ToolRegistry};
use genserver::shared::state::AppState;
use genserver::sweeper::{spawn_sweep_loop, TimeoutSweeper};
use genserver::webhook::spawn_orphan_retry_loop;
use genserver::workflow::RunStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = AppConfig::from_env();

    let registry: Arc<dyn ToolRegistry> = match &config.tools_file {
        Some(path) => {
            let registry = load_tools_file(Path::new(path))
                .await
                .with_context(|| format!("loading tools from {path}"))?;
            info!("registered {} tool(s) from {path}", registry.len().await);
            Arc::new(registry)
        }
        None => {
            warn!("GENSERVER_TOOLS_FILE not set, starting with an empty tool registry");
            Arc::new(StaticToolRegistry::new())
        }
    };

    let store: Arc<dyn GenerationStore> = Arc::new(MemoryGenerationStore::new());
    let runs = Arc::new(RunStore::new());
    let ledger = Arc::new(LedgerService::new());
    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&runs),
        Arc::clone(&ledger),
        registry,
    ));

    let sweeper = Arc::new(TimeoutSweeper::new(Arc::clone(&store), config.step_timeout()));
    spawn_sweep_loop(sweeper, Duration::from_secs(config.sweep_interval_secs));

    let dispatcher = Arc::new(NotificationDispatcher::new(
        Arc::clone(&store),
        Arc::clone(&runs),
        Arc::new(LogDeliveryAdapter),
    ));
    spawn_dispatch_loop(dispatcher, Duration::from_secs(config.dispatch_interval_secs));

    spawn_orphan_retry_loop(
        Arc::clone(&state.correlator),
        Duration::from_secs(config.orphan_retry_interval_secs),
    );

    let app = configure_api_routes().with_state(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!("genserver listening on {}", config.bind_addr);
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
