use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Per-request budget for a single readiness GET.
pub const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// GET the readiness URL and report whether it answered 2xx.
///
/// Only the status line is read: `send()` resolves once headers arrive and
/// dropping the response aborts the connection, so probing an SSE endpoint
/// never hangs on its unbounded body.
pub async fn http_ready(client: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, client.get(url).send()).await {
        Ok(Ok(resp)) => resp.status().is_success(),
        Ok(Err(e)) => {
            debug!(url = %url, error = %e, "readiness probe failed");
            false
        }
        Err(_) => {
            debug!(url = %url, "readiness probe timed out");
            false
        }
    }
}

/// A process listening on a probed port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub pid: u32,
    pub command: String,
}

/// OS-specific port→PID lookup. The default shells out to `lsof`; an
/// alternative platform can slot in another implementation.
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn listeners_on(&self, port: u16) -> Result<Vec<Listener>>;
}

/// `lsof`-backed probe (Linux/macOS).
pub struct LsofProbe;

#[async_trait]
impl PortProbe for LsofProbe {
    async fn listeners_on(&self, port: u16) -> Result<Vec<Listener>> {
        let output = tokio::process::Command::new("lsof")
            .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-Fpc"])
            .output()
            .await
            .context("failed to run lsof")?;

        // lsof exits non-zero with empty output when nothing matches.
        Ok(parse_lsof_records(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `lsof -Fpc` field output: `p<pid>` lines followed by `c<command>`.
fn parse_lsof_records(out: &str) -> Vec<Listener> {
    let mut listeners: Vec<Listener> = Vec::new();
    let mut pid: Option<u32> = None;

    for line in out.lines() {
        if let Some(rest) = line.strip_prefix('p') {
            pid = rest.trim().parse().ok();
        } else if let Some(command) = line.strip_prefix('c')
            && let Some(p) = pid.take()
            && !listeners.iter().any(|l| l.pid == p)
        {
            listeners.push(Listener {
                pid: p,
                command: command.trim().to_string(),
            });
        }
    }

    listeners
}

/// Command hints for PID recovery: the command's basename plus non-flag args.
fn command_hints(command: &str, args: &[String]) -> Vec<String> {
    let mut hints = Vec::new();
    if let Some(base) = std::path::Path::new(command)
        .file_name()
        .and_then(|s| s.to_str())
        && !base.is_empty()
    {
        hints.push(base.to_string());
    }
    for arg in args {
        if !arg.starts_with('-') && !arg.is_empty() {
            hints.push(arg.clone());
        }
    }
    hints
}

/// Pick the listener whose command matches one of the hints. Fail closed:
/// with hints given and none matching, no PID is recovered. lsof truncates
/// command names, so matching runs in both directions.
fn match_pid(listeners: &[Listener], hints: &[String]) -> Option<u32> {
    if hints.is_empty() {
        return listeners.first().map(|l| l.pid);
    }
    listeners
        .iter()
        .find(|l| {
            hints
                .iter()
                .any(|h| l.command.contains(h.as_str()) || h.contains(l.command.as_str()))
        })
        .map(|l| l.pid)
}

/// Recover the PID of an externally-started service from the port its URL
/// names.
pub async fn recover_pid(
    probe: &dyn PortProbe,
    url: &str,
    command: &str,
    args: &[String],
) -> Option<u32> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let port = parsed.port_or_known_default()?;

    let listeners = match probe.listeners_on(port).await {
        Ok(listeners) => listeners,
        Err(e) => {
            debug!(port, error = %e, "port listener lookup failed");
            return None;
        }
    };

    let hints = command_hints(command, args);
    let pid = match_pid(&listeners, &hints);
    debug!(port, ?hints, ?pid, "pid recovery");
    pid
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSOF_OUTPUT: &str = "p1234\ncnode\nf23\np5678\ncpython3.1\nf11\n";

    #[test]
    fn parse_lsof_field_output() {
        let listeners = parse_lsof_records(LSOF_OUTPUT);
        assert_eq!(
            listeners,
            vec![
                Listener {
                    pid: 1234,
                    command: "node".to_string()
                },
                Listener {
                    pid: 5678,
                    command: "python3.1".to_string()
                },
            ]
        );
    }

    #[test]
    fn parse_lsof_dedups_repeated_pids() {
        let out = "p1234\ncnode\np1234\ncnode\n";
        assert_eq!(parse_lsof_records(out).len(), 1);
    }

    #[test]
    fn parse_lsof_empty() {
        assert!(parse_lsof_records("").is_empty());
    }

    #[test]
    fn hints_from_command_and_args() {
        let hints = command_hints(
            "/usr/local/bin/node",
            &["-y".to_string(), "serena-mcp".to_string()],
        );
        assert_eq!(hints, vec!["node", "serena-mcp"]);
    }

    #[test]
    fn match_pid_by_hint() {
        let listeners = parse_lsof_records(LSOF_OUTPUT);
        assert_eq!(
            match_pid(&listeners, &["python3.13".to_string()]),
            Some(5678)
        );
        assert_eq!(match_pid(&listeners, &["node".to_string()]), Some(1234));
    }

    #[test]
    fn match_pid_fails_closed() {
        let listeners = parse_lsof_records(LSOF_OUTPUT);
        assert_eq!(match_pid(&listeners, &["java".to_string()]), None);
    }

    #[test]
    fn match_pid_without_hints_takes_first() {
        let listeners = parse_lsof_records(LSOF_OUTPUT);
        assert_eq!(match_pid(&listeners, &[]), Some(1234));
    }

    #[tokio::test]
    async fn http_ready_refused_connection() {
        let client = reqwest::Client::new();
        // Nothing listens here; the probe must report not-ready, not hang.
        let ready = http_ready(
            &client,
            "http://127.0.0.1:1/health",
            Duration::from_millis(500),
        )
        .await;
        assert!(!ready);
    }

    #[tokio::test]
    async fn http_ready_against_live_listener() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                let _ = sock
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                    .await;
            }
        });

        let client = reqwest::Client::new();
        let url = format!("http://{addr}/");
        assert!(http_ready(&client, &url, Duration::from_secs(2)).await);
    }
}
