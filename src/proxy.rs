use anyhow::{Context, Result};
use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    model::*,
    service::RequestContext,
    transport::sse_server::{SseServer, SseServerConfig},
};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{BackendClient, McpClient, StdioOptions};
use crate::config::RestartPolicy;
use crate::state::{ServiceRecord, ServiceStatus, StateStore};

/// Reconnect backoff: 1s doubling to a 30s cap.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

const PHASE_STARTING: u8 = 0;
const PHASE_SERVING: u8 = 1;
const PHASE_RECONNECTING: u8 = 2;
const PHASE_SHUTTING_DOWN: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyPhase {
    Starting,
    Serving,
    Reconnecting,
    ShuttingDown,
}

fn phase_from_atomic(phase: &AtomicU8) -> ProxyPhase {
    match phase.load(Ordering::Acquire) {
        PHASE_STARTING => ProxyPhase::Starting,
        PHASE_SERVING => ProxyPhase::Serving,
        PHASE_RECONNECTING => ProxyPhase::Reconnecting,
        _ => ProxyPhase::ShuttingDown,
    }
}

fn store_phase(phase: &AtomicU8, value: u8) {
    phase.store(value, Ordering::Release);
}

fn next_backoff(current: Duration) -> Duration {
    std::cmp::min(current * 2, BACKOFF_MAX)
}

/// Options for one proxy run.
pub struct ProxyOptions {
    /// Port to listen on; 0 lets the OS choose.
    pub port: u16,
    /// State-file entry name. Defaults to the command's basename.
    pub name: Option<String>,
    pub restart: RestartPolicy,
    pub command: String,
    pub args: Vec<String>,
}

impl ProxyOptions {
    fn service_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            std::path::Path::new(&self.command)
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or(self.command.as_str())
                .to_string()
        })
    }
}

/// Advertise only the capabilities the backend reported; a backend that
/// reports none still gets tools.
fn forwarded_capabilities(backend: Option<ServerCapabilities>) -> ServerCapabilities {
    let caps = backend.unwrap_or_default();
    if caps.tools.is_none() && caps.resources.is_none() && caps.prompts.is_none() {
        return ServerCapabilities {
            tools: Some(ToolsCapability::default()),
            ..Default::default()
        };
    }
    ServerCapabilities {
        tools: caps.tools,
        resources: caps.resources,
        prompts: caps.prompts,
        ..Default::default()
    }
}

fn unsupported(what: &str) -> McpError {
    McpError::new(
        ErrorCode::METHOD_NOT_FOUND,
        format!("backend does not support {what}"),
        None,
    )
}

/// One SSE client's server object. Every session shares the same backend
/// client; the transport's framing serializes request/response pairing.
#[derive(Clone)]
struct ProxySession {
    client: Arc<McpClient>,
    capabilities: ServerCapabilities,
}

impl ServerHandler for ProxySession {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: self.capabilities.clone(),
            server_info: Implementation::from_build_env(),
            instructions: None,
        }
    }

    fn list_tools(
        &self,
        request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        async move {
            self.client
                .list_tools_paginated(request)
                .await
                .map_err(|e| McpError::internal_error(e.to_string(), None))
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move {
            self.client
                .call_tool_raw(request)
                .await
                .map_err(|e| McpError::internal_error(e.to_string(), None))
        }
    }

    fn list_resources(
        &self,
        request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        async move {
            if self.capabilities.resources.is_none() {
                return Err(unsupported("resources"));
            }
            self.client
                .list_resources(request)
                .await
                .map_err(|e| McpError::internal_error(e.to_string(), None))
        }
    }

    fn list_resource_templates(
        &self,
        request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListResourceTemplatesResult, McpError>> + Send + '_ {
        async move {
            if self.capabilities.resources.is_none() {
                return Err(unsupported("resources"));
            }
            self.client
                .list_resource_templates(request)
                .await
                .map_err(|e| McpError::internal_error(e.to_string(), None))
        }
    }

    fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ReadResourceResult, McpError>> + Send + '_ {
        async move {
            if self.capabilities.resources.is_none() {
                return Err(unsupported("resources"));
            }
            self.client
                .read_resource(request)
                .await
                .map_err(|e| McpError::internal_error(e.to_string(), None))
        }
    }

    fn list_prompts(
        &self,
        request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListPromptsResult, McpError>> + Send + '_ {
        async move {
            if self.capabilities.prompts.is_none() {
                return Err(unsupported("prompts"));
            }
            self.client
                .list_prompts(request)
                .await
                .map_err(|e| McpError::internal_error(e.to_string(), None))
        }
    }

    fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<GetPromptResult, McpError>> + Send + '_ {
        async move {
            if self.capabilities.prompts.is_none() {
                return Err(unsupported("prompts"));
            }
            self.client
                .get_prompt(request)
                .await
                .map_err(|e| McpError::internal_error(e.to_string(), None))
        }
    }
}

/// Run the proxy until the backend is gone for good or a signal arrives.
pub async fn run(opts: ProxyOptions, store: StateStore) -> Result<()> {
    let phase = AtomicU8::new(PHASE_STARTING);
    let service_name = opts.service_name();

    let client = Arc::new(
        McpClient::connect_stdio(StdioOptions {
            command: opts.command.clone(),
            args: opts.args.clone(),
            cwd: None,
            env: HashMap::new(),
        })
        .await?,
    );

    let capabilities = forwarded_capabilities(client.server_capabilities().await);

    let bind: SocketAddr = SocketAddr::from(([127, 0, 0, 1], opts.port));
    let ct = CancellationToken::new();
    let (sse_server, router) = SseServer::new(SseServerConfig {
        bind,
        sse_path: "/sse".to_string(),
        post_path: "/message".to_string(),
        ct: ct.clone(),
        sse_keep_alive: None,
    });
    let router = router.route("/health", axum::routing::get(|| async { "ok" }));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    let local_addr = listener.local_addr()?;

    // Port 0 resolves here; report the effective endpoint.
    println!("mcpd proxy listening on http://{local_addr}/sse");
    info!(addr = %local_addr, service = %service_name, "proxy listening");

    let server_ct = ct.child_token();
    let server_task = tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_ct.cancelled().await })
            .await;
    });

    let sessions_ct = {
        let client = Arc::clone(&client);
        let capabilities = capabilities.clone();
        sse_server.with_service(move || ProxySession {
            client: Arc::clone(&client),
            capabilities: capabilities.clone(),
        })
    };

    // Register under the service name so ps/kill and the supervisor's reuse
    // logic see this backend.
    let register = |pid: Option<u32>| -> Result<()> {
        let mut map = store.load();
        map.insert(
            service_name.clone(),
            ServiceRecord {
                state: ServiceStatus::Ready,
                pid,
                url: Some(format!("http://{local_addr}/sse")),
            },
        );
        store.save(&map)
    };
    register(client.pid())?;

    store_phase(&phase, PHASE_SERVING);
    info!(phase = ?phase_from_atomic(&phase), "proxy serving");

    // Repeated signals land on an already-cancelled token, keeping shutdown
    // idempotent.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(s) => s,
                    Err(_) => return,
                };
                let mut sigint = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::interrupt(),
                ) {
                    Ok(s) => s,
                    Err(_) => return,
                };
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigint.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            shutdown.cancel();
        });
    }

    let mut backoff = BACKOFF_INITIAL;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            exit = client.wait_for_exit() => {
                let Some(code) = exit else { break };
                warn!(code, "backend exited");

                if opts.restart == RestartPolicy::Never {
                    break;
                }

                store_phase(&phase, PHASE_RECONNECTING);
                let mut reconnected = false;
                loop {
                    info!(backoff_secs = backoff.as_secs(), "backing off before reconnect");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.cancelled() => break,
                    }

                    match client.establish().await {
                        Ok(()) => {
                            info!(pid = ?client.pid(), "backend reconnected");
                            reconnected = true;
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "reconnect attempt failed");
                            if opts.restart == RestartPolicy::OnFailure && backoff >= BACKOFF_MAX {
                                break;
                            }
                            backoff = next_backoff(backoff);
                        }
                    }
                }

                if !reconnected {
                    break;
                }
                backoff = BACKOFF_INITIAL;
                store_phase(&phase, PHASE_SERVING);
                let _ = register(client.pid());
            }
        }
    }

    store_phase(&phase, PHASE_SHUTTING_DOWN);
    info!("proxy shutting down");

    sessions_ct.cancel();
    ct.cancel();
    if let Err(e) = client.disconnect().await {
        warn!(error = %e, "error disconnecting backend client");
    }

    let mut map = store.load();
    map.remove(&service_name);
    if let Err(e) = store.save(&map) {
        warn!(error = %e, "failed to remove proxy state entry");
    }

    let _ = server_task.await;
    info!("proxy stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = BACKOFF_INITIAL;
        let mut sequence = vec![backoff];
        for _ in 0..6 {
            backoff = next_backoff(backoff);
            sequence.push(backoff);
        }
        assert_eq!(sequence[0], Duration::from_secs(1));
        assert_eq!(sequence[1], Duration::from_secs(2));
        assert_eq!(sequence[2], Duration::from_secs(4));
        assert_eq!(sequence[3], Duration::from_secs(8));
        assert_eq!(sequence[4], Duration::from_secs(16));
        assert_eq!(sequence[5], Duration::from_secs(30));
        assert_eq!(sequence[6], Duration::from_secs(30));
    }

    #[test]
    fn capabilities_default_to_tools() {
        let caps = forwarded_capabilities(None);
        assert!(caps.tools.is_some());
        assert!(caps.resources.is_none());
        assert!(caps.prompts.is_none());

        let caps = forwarded_capabilities(Some(ServerCapabilities::default()));
        assert!(caps.tools.is_some());
    }

    #[test]
    fn capabilities_forward_only_reported() {
        let backend = ServerCapabilities {
            resources: Some(ResourcesCapability::default()),
            ..Default::default()
        };
        let caps = forwarded_capabilities(Some(backend));
        assert!(caps.resources.is_some());
        assert!(caps.tools.is_none());
        assert!(caps.prompts.is_none());
    }

    #[test]
    fn service_name_defaults_to_command_basename() {
        let opts = ProxyOptions {
            port: 0,
            name: None,
            restart: RestartPolicy::OnFailure,
            command: "/usr/local/bin/echo-server".to_string(),
            args: Vec::new(),
        };
        assert_eq!(opts.service_name(), "echo-server");

        let named = ProxyOptions {
            name: Some("echo".to_string()),
            ..opts
        };
        assert_eq!(named.service_name(), "echo");
    }

    #[test]
    fn phase_round_trip() {
        let phase = AtomicU8::new(PHASE_STARTING);
        assert_eq!(phase_from_atomic(&phase), ProxyPhase::Starting);
        store_phase(&phase, PHASE_SERVING);
        assert_eq!(phase_from_atomic(&phase), ProxyPhase::Serving);
        store_phase(&phase, PHASE_RECONNECTING);
        assert_eq!(phase_from_atomic(&phase), ProxyPhase::Reconnecting);
        store_phase(&phase, PHASE_SHUTTING_DOWN);
        assert_eq!(phase_from_atomic(&phase), ProxyPhase::ShuttingDown);
    }
}
