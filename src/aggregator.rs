use anyhow::Result;
use rmcp::model::CallToolResult;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

use crate::client::BackendClient;

/// A backend tool augmented with its origin service and the name the backend
/// knows it by. The external `name` is what clients of the daemon see.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespacedTool {
    pub name: String,
    pub service: String,
    pub original_name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Routing failures surfaced to the calling MCP request.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouteError {
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("invalid tool name '{0}': no matching service prefix")]
    InvalidName(String),
}

struct BackendEntry {
    name: String,
    client: Arc<dyn BackendClient>,
    exclude: HashSet<String>,
}

/// Aggregates tool inventories from all connected backends and routes calls
/// back to them. Backends are kept in registration order so listings are
/// stable.
pub struct ToolAggregator {
    backends: RwLock<Vec<BackendEntry>>,
}

impl ToolAggregator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            backends: RwLock::new(Vec::new()),
        })
    }

    /// Register a backend. Re-registering a name replaces the old entry and
    /// resets its exclusions to the set given here.
    pub async fn add_backend(
        &self,
        name: &str,
        client: Arc<dyn BackendClient>,
        exclude_tools: Option<HashSet<String>>,
    ) {
        let mut backends = self.backends.write().await;
        backends.retain(|b| b.name != name);
        backends.push(BackendEntry {
            name: name.to_string(),
            client,
            exclude: exclude_tools.unwrap_or_default(),
        });
    }

    pub async fn remove_backend(&self, name: &str) -> bool {
        let mut backends = self.backends.write().await;
        let before = backends.len();
        backends.retain(|b| b.name != name);
        backends.len() != before
    }

    pub async fn backend_count(&self) -> usize {
        self.backends.read().await.len()
    }

    pub async fn backend_names(&self) -> Vec<String> {
        self.backends
            .read()
            .await
            .iter()
            .map(|b| b.name.clone())
            .collect()
    }

    /// Fan out `list_tools` to every backend concurrently and merge the
    /// inventories in registration order. Namespacing applies only when more
    /// than one backend is registered. A backend that fails to list is
    /// logged and skipped.
    pub async fn list_all_tools(&self) -> Vec<NamespacedTool> {
        let snapshot: Vec<(String, Arc<dyn BackendClient>, HashSet<String>)> = {
            let backends = self.backends.read().await;
            backends
                .iter()
                .map(|b| (b.name.clone(), Arc::clone(&b.client), b.exclude.clone()))
                .collect()
        };
        let multi = snapshot.len() > 1;

        let listings = futures::future::join_all(
            snapshot
                .iter()
                .map(|(_, client, _)| client.list_tools()),
        )
        .await;

        let mut tools = Vec::new();
        for ((service, _, exclude), listing) in snapshot.iter().zip(listings) {
            let defs = match listing {
                Ok(defs) => defs,
                Err(e) => {
                    warn!(service = %service, error = %e, "backend tool listing failed");
                    continue;
                }
            };
            for def in defs {
                if exclude.contains(&def.name) {
                    continue;
                }
                let name = if multi {
                    format!("{service}_{}", def.name)
                } else {
                    def.name.clone()
                };
                let description = if def.description.is_empty() {
                    format!("[{service}]")
                } else {
                    format!("[{service}] {}", def.description)
                };
                tools.push(NamespacedTool {
                    name,
                    service: service.clone(),
                    original_name: def.name,
                    description,
                    input_schema: def.input_schema,
                });
            }
        }
        tools
    }

    /// Split an external tool name into (service, original name).
    ///
    /// With a single backend the name maps to it unchanged. With several,
    /// every underscore position is a candidate split and the longest
    /// left-hand side naming a registered backend wins — so with backends
    /// `a` and `a_b`, `a_b_tool` routes to `a_b`.
    pub async fn parse_name(&self, name: &str) -> Result<(String, String), RouteError> {
        let backends = self.backends.read().await;

        if backends.len() == 1 {
            return Ok((backends[0].name.clone(), name.to_string()));
        }

        let mut best: Option<(String, String)> = None;
        for (idx, _) in name.match_indices('_') {
            let (prefix, rest) = (&name[..idx], &name[idx + 1..]);
            if backends.iter().any(|b| b.name == prefix)
                && best.as_ref().is_none_or(|(p, _)| prefix.len() > p.len())
            {
                best = Some((prefix.to_string(), rest.to_string()));
            }
        }

        best.ok_or_else(|| RouteError::InvalidName(name.to_string()))
    }

    /// Invoke a tool on a named backend by its original name.
    pub async fn call_service(
        &self,
        service: &str,
        original_name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult> {
        let client = {
            let backends = self.backends.read().await;
            backends
                .iter()
                .find(|b| b.name == service)
                .map(|b| Arc::clone(&b.client))
        };
        let client =
            client.ok_or_else(|| RouteError::UnknownService(service.to_string()))?;
        client.call_tool(original_name, arguments).await
    }

    /// Parse an external name and dispatch the call to its backend.
    pub async fn route_tool_call(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult> {
        let (service, original) = self.parse_name(name).await?;
        self.call_service(&service, &original, arguments).await
    }
}
