mod aggregator;
mod cli;
mod client;
mod cmd;
mod config;
mod front;
mod middleware;
mod pidfile;
mod probe;
mod proxy;
mod state;
mod supervisor;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use rmcp::{ServiceExt, transport::stdio};
use std::collections::HashMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregator::ToolAggregator;
use crate::client::{BackendClient, McpClient, StdioOptions};
use crate::config::{Config, Transport};
use crate::state::StateStore;
use crate::supervisor::Supervisor;

/// Logs go to stderr so the stdio MCP transport stays clean.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

/// Default mode: supervise configured services and serve the aggregated
/// tool inventory to the host runtime over stdio.
async fn run_start(config_override: Option<&Path>) -> Result<()> {
    let config_path = config::find_config(config_override)?;
    let cfg = Config::load(&config_path)?;
    init_tracing(&cfg.log_level);

    info!(
        config = %config_path.display(),
        services = cfg.services.len(),
        "mcpd starting"
    );

    let pid_path = pidfile::default_path();
    pidfile::write(&pid_path).context("failed to write daemon pid file")?;

    let store = StateStore::at_project_root();
    let sup = Supervisor::new(store);

    // SSE services run under supervision; already-running keep-alive ones
    // are adopted by the reuse path instead of spawned again.
    let sse_services: HashMap<String, _> = cfg
        .services
        .iter()
        .filter(|(_, svc)| svc.transport == Transport::Sse)
        .map(|(name, svc)| (name.clone(), svc.clone()))
        .collect();

    if let Err(e) = sup.start_all(&sse_services).await {
        pidfile::remove(&pid_path);
        return Err(e);
    }

    // Connect a client per service and hand the inventory to the aggregator.
    let aggregator = ToolAggregator::new();
    let mut clients: Vec<(String, Arc<McpClient>)> = Vec::new();
    let mut connect_err: Option<anyhow::Error> = None;

    for (name, svc) in &cfg.services {
        let connected = match svc.transport {
            Transport::Sse => {
                let url = svc
                    .url
                    .as_deref()
                    .ok_or_else(|| anyhow!("service '{name}' missing url"))?;
                McpClient::connect(url).await
            }
            Transport::Stdio => {
                McpClient::connect_stdio(StdioOptions {
                    command: svc.command.clone(),
                    args: svc.args.clone(),
                    cwd: svc.cwd.clone(),
                    env: svc.env.clone(),
                })
                .await
            }
        };

        match connected {
            Ok(client) => {
                let client = Arc::new(client);
                // Stdio clients own their child; record the pid so ps/kill
                // and the next instance share the supervisor's view.
                if let Some(pid) = client.pid() {
                    sup.register_pid(name, pid).await;
                }
                aggregator
                    .add_backend(name, client.clone(), Some(svc.exclude_tools.clone()))
                    .await;
                clients.push((name.clone(), client));
            }
            Err(e) => {
                connect_err = Some(e.context(format!("failed to connect backend '{name}'")));
                break;
            }
        }
    }

    if let Some(e) = connect_err {
        for (_, client) in &clients {
            let _ = client.disconnect().await;
        }
        shutdown_services(&sup, &cfg).await;
        pidfile::remove(&pid_path);
        return Err(e);
    }

    let pipelines = front::pipelines_from_config(&cfg.services)?;
    let server = front::FrontServer::new(Arc::clone(&aggregator), pipelines);

    info!(backends = clients.len(), "serving aggregator on stdio");
    let service = server.serve(stdio()).await?;

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            result = service.waiting() => {
                if let Err(e) = result {
                    warn!(error = %e, "MCP service exited with error");
                }
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        service.waiting().await?;
    }

    info!("shutting down");
    for (name, client) in &clients {
        if let Err(e) = client.disconnect().await {
            warn!(service = %name, error = %e, "error disconnecting backend");
        }
    }
    shutdown_services(&sup, &cfg).await;
    pidfile::remove(&pid_path);

    Ok(())
}

/// Stop services on daemon exit. Keep-alive services stay up for the next
/// instance to reuse.
async fn shutdown_services(sup: &Arc<Supervisor>, cfg: &Config) {
    for (name, svc) in &cfg.services {
        if svc.transport == Transport::Sse && !svc.keep_alive {
            sup.stop(name).await;
        }
    }
}

async fn dispatch(cli: cli::Cli) -> Result<i32> {
    let store = StateStore::at_project_root();

    match cli.command {
        None | Some(cli::Command::Start) => {
            run_start(cli.config.as_deref()).await?;
            Ok(0)
        }

        Some(cli::Command::Ps) => cmd::ps(&store),

        Some(cli::Command::Kill { target }) => cmd::kill(&store, target.as_deref()),

        Some(cli::Command::Stop) => cmd::kill(&store, Some("all")),

        Some(cli::Command::Restart { target }) => {
            let config_path = config::find_config(cli.config.as_deref())?;
            let cfg = Config::load(&config_path)?;
            init_tracing(&cfg.log_level);
            cmd::restart(&store, &cfg, target.as_deref()).await
        }

        Some(cli::Command::Proxy {
            port,
            name,
            restart,
            command,
        }) => {
            init_tracing("info");
            let mut parts = command.into_iter();
            let program = parts
                .next()
                .ok_or_else(|| anyhow!("proxy requires a backend command after --"))?;
            let opts = proxy::ProxyOptions {
                port,
                name,
                restart,
                command: program,
                args: parts.collect(),
            };
            proxy::run(opts, store).await?;
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("mcpd: {e:#}");
            ExitCode::FAILURE
        }
    }
}
