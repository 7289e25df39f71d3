//! Tool registry seam.
//!
//! The catalog of invocable tools lives in an external registry service;
//! this module only defines the contract the engine consumes, a static
//! in-process registry the deployment populates, and an HTTP invoker for
//! providers that accept a JSON submission and return a run id.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::shared::models::CostRate;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("provider rejected submission: {0}")]
    Submission(String),
    #[error("invalid tool definition: {0}")]
    InvalidDefinition(String),
}

/// Submits one invocation to the external compute provider and returns the
/// provider's run id. Completion arrives later via webhook, never here.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn submit(&self, inputs: &Value) -> Result<String, RegistryError>;
}

#[derive(Clone)]
pub struct InvocationContract {
    pub cost_rate: CostRate,
    pub creator_ids: Vec<Uuid>,
    pub invoker: Arc<dyn ToolInvoker>,
}

#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn invocation_contract(&self, tool_id: &str) -> Result<InvocationContract, RegistryError>;
}

pub struct StaticToolRegistry {
    tools: RwLock<HashMap<String, InvocationContract>>,
}

impl StaticToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, tool_id: &str, contract: InvocationContract) {
        self.tools
            .write()
            .await
            .insert(tool_id.to_string(), contract);
    }

    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }
}

impl Default for StaticToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolRegistry for StaticToolRegistry {
    async fn invocation_contract(&self, tool_id: &str) -> Result<InvocationContract, RegistryError> {
        self.tools
            .read()
            .await
            .get(tool_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownTool(tool_id.to_string()))
    }
}

/// POSTs the step inputs as JSON to the tool's submit endpoint and expects
/// `{"id": "..."}` (or `run_id`) back.
pub struct HttpToolInvoker {
    client: reqwest::Client,
    submit_url: String,
}

impl HttpToolInvoker {
    pub fn new(client: reqwest::Client, submit_url: &str) -> Self {
        Self {
            client,
            submit_url: submit_url.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(alias = "run_id")]
    id: String,
}

#[async_trait]
impl ToolInvoker for HttpToolInvoker {
    async fn submit(&self, inputs: &Value) -> Result<String, RegistryError> {
        let response = self
            .client
            .post(&self.submit_url)
            .json(inputs)
            .send()
            .await
            .map_err(|e| RegistryError::Submission(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RegistryError::Submission(format!(
                "{} returned {}",
                self.submit_url,
                response.status()
            )));
        }
        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Submission(format!("bad submit response: {e}")))?;
        Ok(body.id)
    }
}

#[derive(Debug, Deserialize)]
struct ToolFileEntry {
    tool_id: String,
    submit_url: String,
    cost_rate: String,
    #[serde(default)]
    creator_ids: Vec<Uuid>,
}

/// Loads tool definitions from a JSON file into a static registry.
/// Deployment convenience for running without the external registry
/// service; format is a JSON array of
/// `{tool_id, submit_url, cost_rate, creator_ids}`.
pub async fn load_tools_file(path: &Path) -> Result<StaticToolRegistry, RegistryError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RegistryError::InvalidDefinition(format!("{}: {e}", path.display())))?;
    let entries: Vec<ToolFileEntry> = serde_json::from_str(&raw)
        .map_err(|e| RegistryError::InvalidDefinition(format!("{}: {e}", path.display())))?;

    let registry = StaticToolRegistry::new();
    let client = reqwest::Client::new();
    for entry in entries {
        let amount = BigDecimal::from_str(&entry.cost_rate).map_err(|e| {
            RegistryError::InvalidDefinition(format!("{}: cost_rate: {e}", entry.tool_id))
        })?;
        registry
            .register(
                &entry.tool_id,
                InvocationContract {
                    cost_rate: CostRate::per_second(amount),
                    creator_ids: entry.creator_ids,
                    invoker: Arc::new(HttpToolInvoker::new(client.clone(), &entry.submit_url)),
                },
            )
            .await;
    }
    Ok(registry)
}
