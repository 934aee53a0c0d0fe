use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::RestartPolicy;

#[derive(Parser)]
#[command(
    name = "mcpd",
    version,
    about = "MCP daemon multiplexing backend tool servers over stdio"
)]
pub struct Cli {
    /// Path to the configuration file (default: ./mcpd.yml, then
    /// ~/.config/mcpd/config.yml).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start supervised services and expose the aggregator over stdio (default).
    Start,

    /// Show daemon status and per-service pid/url/state.
    #[command(alias = "list", alias = "ls")]
    Ps,

    /// SIGTERM the tracked PID of one service, or of all.
    Kill {
        /// Service name, or "all".
        target: Option<String>,
    },

    /// Kill tracked PID(s), wait a moment, restart SSE services.
    Restart {
        /// Service name, or "all".
        target: Option<String>,
    },

    /// Stop all tracked services (same as `kill all`).
    Stop,

    /// Bridge a stdio MCP server to an HTTP/SSE endpoint.
    Proxy {
        /// Port to listen on (0 = OS-chosen).
        #[arg(short, long, default_value_t = 0)]
        port: u16,

        /// State-file entry name (default: command basename).
        #[arg(short, long)]
        name: Option<String>,

        /// Reconnect policy when the backend exits.
        #[arg(long, default_value = "on-failure", value_parser = parse_restart)]
        restart: RestartPolicy,

        /// Backend command and arguments, after `--`.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn parse_restart(s: &str) -> Result<RestartPolicy, String> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_args_after_separator() {
        let cli = Cli::parse_from([
            "mcpd", "proxy", "-p", "8900", "-n", "echo", "--", "node", "server.js",
        ]);
        match cli.command {
            Some(Command::Proxy {
                port,
                name,
                restart,
                command,
            }) => {
                assert_eq!(port, 8900);
                assert_eq!(name.as_deref(), Some("echo"));
                assert_eq!(restart, RestartPolicy::OnFailure);
                assert_eq!(command, vec!["node", "server.js"]);
            }
            _ => panic!("expected proxy command"),
        }
    }

    #[test]
    fn ps_aliases() {
        for alias in ["ps", "list", "ls"] {
            let cli = Cli::parse_from(["mcpd", alias]);
            assert!(matches!(cli.command, Some(Command::Ps)));
        }
    }

    #[test]
    fn default_command_is_start() {
        let cli = Cli::parse_from(["mcpd"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn proxy_restart_policy_parses() {
        let cli = Cli::parse_from(["mcpd", "proxy", "--restart", "always", "--", "srv"]);
        match cli.command {
            Some(Command::Proxy { restart, .. }) => assert_eq!(restart, RestartPolicy::Always),
            _ => panic!("expected proxy command"),
        }
    }
}
