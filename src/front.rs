use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler, model::*, service::RequestContext,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::aggregator::{NamespacedTool, RouteError, ToolAggregator};
use crate::config::ServiceConfig;
use crate::middleware::{self, Middleware};

/// Per-service response middleware chains, resolved once at startup.
pub type Pipelines = HashMap<String, Vec<&'static Middleware>>;

/// Resolve every service's configured middleware chain. Unknown names abort
/// startup.
pub fn pipelines_from_config(
    services: &HashMap<String, ServiceConfig>,
) -> anyhow::Result<Pipelines> {
    let mut pipelines = Pipelines::new();
    for (name, cfg) in services {
        if cfg.middleware.response.is_empty() {
            continue;
        }
        let chain = middleware::resolve_chain(&cfg.middleware.response)
            .map_err(|e| anyhow::anyhow!("service '{name}': {e}"))?;
        pipelines.insert(name.clone(), chain);
    }
    Ok(pipelines)
}

/// The MCP server exposed to the host runtime over stdio. Tool listings come
/// from the aggregator; calls are routed back to the origin backend and the
/// result is folded through that service's middleware chain.
#[derive(Clone)]
pub struct FrontServer {
    aggregator: Arc<ToolAggregator>,
    pipelines: Arc<Pipelines>,
}

impl FrontServer {
    pub fn new(aggregator: Arc<ToolAggregator>, pipelines: Pipelines) -> Self {
        Self {
            aggregator,
            pipelines: Arc::new(pipelines),
        }
    }
}

/// Internal routing fields stay internal; the wire tool carries only what
/// MCP clients need.
fn to_wire_tool(tool: &NamespacedTool) -> Tool {
    let schema: JsonObject = tool
        .input_schema
        .as_object()
        .cloned()
        .unwrap_or_default();
    Tool::new(
        tool.name.clone(),
        tool.description.clone(),
        Arc::new(schema),
    )
}

fn route_error(err: &anyhow::Error) -> McpError {
    match err.downcast_ref::<RouteError>() {
        Some(route) => McpError::invalid_params(route.to_string(), None),
        None => McpError::internal_error(err.to_string(), None),
    }
}

impl ServerHandler for FrontServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "mcpd multiplexes the tools of several backend MCP servers. \
                 With more than one backend configured, tool names are \
                 prefixed with the owning service name."
                    .into(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        async move {
            let tools = self.aggregator.list_all_tools().await;
            debug!(tools = tools.len(), "listing aggregated tools");
            Ok(ListToolsResult {
                meta: None,
                next_cursor: None,
                tools: tools.iter().map(to_wire_tool).collect(),
            })
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move {
            let name = request.name.to_string();
            let arguments = request.arguments.map(Value::Object);

            let (service, original) = self
                .aggregator
                .parse_name(&name)
                .await
                .map_err(|e| McpError::invalid_params(e.to_string(), None))?;

            let result = self
                .aggregator
                .call_service(&service, &original, arguments)
                .await
                .map_err(|e| {
                    warn!(service = %service, tool = %original, error = %e, "tool call failed");
                    route_error(&e)
                })?;

            match self.pipelines.get(&service) {
                Some(chain) => Ok(middleware::apply(chain, &name, result)),
                None => Ok(result),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MiddlewareConfig, MiddlewareEntry, RestartPolicy, Transport};
    use serde_json::json;

    fn service_with_middleware(names: &[&str]) -> ServiceConfig {
        ServiceConfig {
            command: "run".to_string(),
            args: Vec::new(),
            transport: Transport::Sse,
            url: Some("http://127.0.0.1:9000".to_string()),
            cwd: None,
            env: HashMap::new(),
            readiness: Default::default(),
            restart: RestartPolicy::Never,
            keep_alive: true,
            exclude_tools: Default::default(),
            middleware: MiddlewareConfig {
                response: names
                    .iter()
                    .map(|n| MiddlewareEntry {
                        name: n.to_string(),
                        config: Value::Null,
                    })
                    .collect(),
            },
        }
    }

    #[test]
    fn pipelines_resolve_per_service() {
        let mut services = HashMap::new();
        services.insert(
            "serena".to_string(),
            service_with_middleware(&["strip-result-wrapper", "strip-json-keys"]),
        );
        services.insert("plain".to_string(), service_with_middleware(&[]));

        let pipelines = pipelines_from_config(&services).unwrap();
        assert_eq!(pipelines.get("serena").unwrap().len(), 2);
        assert!(!pipelines.contains_key("plain"));
    }

    #[test]
    fn pipelines_reject_unknown_middleware() {
        let mut services = HashMap::new();
        services.insert("svc".to_string(), service_with_middleware(&["nope"]));
        assert!(pipelines_from_config(&services).is_err());
    }

    #[test]
    fn wire_tool_drops_internal_fields() {
        let tool = NamespacedTool {
            name: "serena_search".to_string(),
            service: "serena".to_string(),
            original_name: "search".to_string(),
            description: "[serena] Search".to_string(),
            input_schema: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
        };
        let wire = to_wire_tool(&tool);
        assert_eq!(wire.name.as_ref(), "serena_search");
        assert_eq!(wire.description.as_deref(), Some("[serena] Search"));
        let schema = serde_json::to_value(&wire.input_schema).unwrap();
        assert_eq!(schema["type"], "object");
        assert!(schema.get("_service").is_none());
    }
}
