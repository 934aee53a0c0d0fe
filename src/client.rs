use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rmcp::{
    ServiceExt,
    model::*,
    service::RunningService,
    transport::sse_client::SseClientTransport,
};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

/// Tool descriptor as reported by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Uniform interface over stdio/SSE MCP clients. The aggregator borrows
/// these; it does not own their lifetime.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDef>>;
    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult>;
    async fn disconnect(&self) -> Result<()>;
    /// Non-None only when this client owns a stdio child process.
    fn pid(&self) -> Option<u32>;
}

/// Where a client connects.
#[derive(Debug, Clone)]
enum Target {
    Sse { url: String },
    Stdio(StdioOptions),
}

/// Spawn options for a stdio backend.
#[derive(Debug, Clone, Default)]
pub struct StdioOptions {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
}

struct ChildHandle {
    pid: u32,
    exit_rx: watch::Receiver<Option<i32>>,
}

/// An MCP client over one transport. A stdio client owns its child process;
/// `disconnect` terminates it.
pub struct McpClient {
    target: Target,
    service: RwLock<Option<RunningService<rmcp::RoleClient, ()>>>,
    child: RwLock<Option<ChildHandle>>,
}

impl McpClient {
    /// Connect to an SSE backend.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Self {
            target: Target::Sse {
                url: url.to_string(),
            },
            service: RwLock::new(None),
            child: RwLock::new(None),
        };
        client.establish().await?;
        Ok(client)
    }

    /// Spawn a stdio backend and connect over its standard streams.
    pub async fn connect_stdio(opts: StdioOptions) -> Result<Self> {
        let client = Self {
            target: Target::Stdio(opts),
            service: RwLock::new(None),
            child: RwLock::new(None),
        };
        client.establish().await?;
        Ok(client)
    }

    /// (Re)establish the transport for the configured target. Used at
    /// connect time and by the proxy's reconnect path.
    pub async fn establish(&self) -> Result<()> {
        match &self.target {
            Target::Sse { url } => {
                let transport = SseClientTransport::start(url.clone())
                    .await
                    .with_context(|| format!("failed to open SSE transport to {url}"))?;
                let service = ().serve(transport).await.with_context(|| {
                    format!("failed MCP handshake with SSE backend at {url}")
                })?;

                if let Some(peer) = service.peer_info() {
                    info!(
                        url = %url,
                        server_name = %peer.server_info.name,
                        "MCP handshake complete"
                    );
                }
                *self.service.write().await = Some(service);
            }
            Target::Stdio(opts) => {
                let mut cmd = Command::new(&opts.command);
                if !opts.args.is_empty() {
                    cmd.args(&opts.args);
                }
                for (key, value) in &opts.env {
                    cmd.env(key, value);
                }
                if let Some(cwd) = &opts.cwd {
                    cmd.current_dir(cwd);
                }
                cmd.stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit());

                // Own process group so terminating the backend reaps its
                // grandchildren too.
                #[cfg(unix)]
                cmd.process_group(0);

                let mut child = cmd
                    .spawn()
                    .with_context(|| format!("failed to spawn '{}'", opts.command))?;

                let pid = child
                    .id()
                    .ok_or_else(|| anyhow!("spawned '{}' has no pid", opts.command))?;

                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| anyhow!("failed to capture stdout of '{}'", opts.command))?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| anyhow!("failed to capture stdin of '{}'", opts.command))?;

                // The watcher task owns the child; everyone else observes the
                // exit through the channel. Signals go to the recorded pid.
                let (exit_tx, exit_rx) = watch::channel(None);
                tokio::spawn(async move {
                    let code = match child.wait().await {
                        Ok(status) => status.code(),
                        Err(_) => None,
                    };
                    let _ = exit_tx.send(Some(code.unwrap_or(-1)));
                });
                *self.child.write().await = Some(ChildHandle { pid, exit_rx });

                let service = match ().serve((stdout, stdin)).await {
                    Ok(service) => service,
                    Err(e) => {
                        // A child that failed the handshake must not linger.
                        self.terminate_child().await;
                        return Err(anyhow!(
                            "failed MCP handshake with '{}': {e}",
                            opts.command
                        ));
                    }
                };

                if let Some(peer) = service.peer_info() {
                    info!(
                        command = %opts.command,
                        pid,
                        server_name = %peer.server_info.name,
                        "MCP handshake complete"
                    );
                }

                *self.service.write().await = Some(service);
            }
        }
        Ok(())
    }

    /// Capabilities the backend reported during the handshake.
    pub async fn server_capabilities(&self) -> Option<ServerCapabilities> {
        let guard = self.service.read().await;
        guard
            .as_ref()
            .and_then(|s| s.peer_info())
            .map(|info| info.capabilities.clone())
    }

    /// Resolve once the owned child exits, yielding its exit code. Returns
    /// immediately for SSE clients, which have no child to watch.
    pub async fn wait_for_exit(&self) -> Option<i32> {
        let mut rx = {
            let guard = self.child.read().await;
            guard.as_ref()?.exit_rx.clone()
        };
        loop {
            if let Some(code) = *rx.borrow() {
                return Some(code);
            }
            rx.changed().await.ok()?;
        }
    }

    async fn terminate_child(&self) {
        let Some(handle) = self.child.write().await.take() else {
            return;
        };
        if handle.exit_rx.borrow().is_some() {
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(handle.pid as i32);
            let _ = killpg(pgid, Signal::SIGTERM);

            let mut rx = handle.exit_rx.clone();
            let grace = tokio::time::timeout(Duration::from_secs(2), async {
                while rx.borrow().is_none() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;

            if grace.is_err() {
                warn!(pid = handle.pid, "child ignored SIGTERM, sending SIGKILL");
                let _ = killpg(pgid, Signal::SIGKILL);
            }
        }
    }

    fn call_params(name: &str, arguments: Option<Value>) -> CallToolRequestParams {
        CallToolRequestParams {
            meta: None,
            name: name.to_string().into(),
            arguments: arguments.and_then(|v| v.as_object().cloned()),
            task: None,
        }
    }

    // --- Forwarding surface used by the proxy sessions ---

    pub async fn list_tools_paginated(
        &self,
        request: Option<PaginatedRequestParams>,
    ) -> Result<ListToolsResult> {
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("client not connected"))?;
        service
            .list_tools(request)
            .await
            .map_err(|e| anyhow!("backend list_tools failed: {e}"))
    }

    pub async fn list_prompts(
        &self,
        request: Option<PaginatedRequestParams>,
    ) -> Result<ListPromptsResult> {
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("client not connected"))?;
        service
            .list_prompts(request)
            .await
            .map_err(|e| anyhow!("backend list_prompts failed: {e}"))
    }

    pub async fn get_prompt(&self, request: GetPromptRequestParams) -> Result<GetPromptResult> {
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("client not connected"))?;
        service
            .get_prompt(request)
            .await
            .map_err(|e| anyhow!("backend get_prompt failed: {e}"))
    }

    pub async fn list_resources(
        &self,
        request: Option<PaginatedRequestParams>,
    ) -> Result<ListResourcesResult> {
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("client not connected"))?;
        service
            .list_resources(request)
            .await
            .map_err(|e| anyhow!("backend list_resources failed: {e}"))
    }

    pub async fn list_resource_templates(
        &self,
        request: Option<PaginatedRequestParams>,
    ) -> Result<ListResourceTemplatesResult> {
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("client not connected"))?;
        service
            .list_resource_templates(request)
            .await
            .map_err(|e| anyhow!("backend list_resource_templates failed: {e}"))
    }

    pub async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
    ) -> Result<ReadResourceResult> {
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("client not connected"))?;
        service
            .read_resource(request)
            .await
            .map_err(|e| anyhow!("backend read_resource failed: {e}"))
    }

    pub async fn call_tool_raw(&self, params: CallToolRequestParams) -> Result<CallToolResult> {
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("client not connected"))?;
        let result = service
            .call_tool(params)
            .await
            .map_err(|e| anyhow!("backend call_tool failed: {e}"))?;

        // Legacy servers answer with a bare `toolResult` instead of a content
        // array; rmcp surfaces that payload as structured content.
        if result.content.is_empty()
            && let Some(sc) = result.structured_content.as_ref()
            && sc.get("toolResult").is_some()
        {
            return Ok(normalize_legacy_result(sc.clone()));
        }
        Ok(result)
    }
}

#[async_trait]
impl BackendClient for McpClient {
    async fn list_tools(&self) -> Result<Vec<ToolDef>> {
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("client not connected"))?;
        let tools = service
            .list_all_tools()
            .await
            .map_err(|e| anyhow!("backend list_tools failed: {e}"))?;
        debug!(tools = tools.len(), "listed backend tools");
        Ok(tool_defs(tools))
    }

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        self.call_tool_raw(Self::call_params(name, arguments)).await
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(service) = self.service.write().await.take()
            && let Err(e) = service.cancel().await
        {
            warn!(error = %e, "error cancelling client service");
        }
        self.terminate_child().await;
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.child
            .try_read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|h| h.pid))
    }
}

/// Map rmcp tools to adapter descriptors.
fn tool_defs(tools: Vec<Tool>) -> Vec<ToolDef> {
    tools
        .into_iter()
        .map(|t| ToolDef {
            name: t.name.to_string(),
            description: t.description.map(|d| d.to_string()).unwrap_or_default(),
            input_schema: serde_json::to_value(&t.input_schema)
                .unwrap_or(Value::Object(Default::default())),
        })
        .collect()
}

/// Normalize a raw result value that lacks a `content` array but carries the
/// legacy `toolResult` field: synthesize a single text block from it,
/// JSON-encoding non-string payloads.
pub fn normalize_legacy_result(raw: Value) -> CallToolResult {
    if let Ok(result) = serde_json::from_value::<CallToolResult>(raw.clone())
        && !result.content.is_empty()
    {
        return result;
    }

    let text = match raw.get("toolResult") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => raw.to_string(),
    };
    CallToolResult::success(vec![Content::text(text)])
}
