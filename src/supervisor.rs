use anyhow::{Context, Result, anyhow, bail};
use dashmap::DashMap;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{ReadinessCheck, RestartPolicy, ServiceConfig, Transport};
use crate::pidfile::pid_alive;
use crate::probe::{self, LsofProbe, PROBE_REQUEST_TIMEOUT, PortProbe, http_ready};
use crate::state::{ServiceRecord, ServiceStatus, StateStore};

/// SIGTERM grace period before escalating to SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Exit code as reported by `wait()`: None when the child died to a signal.
type ExitCode = Option<i32>;

struct ChildHandle {
    pid: u32,
    exit_rx: watch::Receiver<Option<ExitCode>>,
}

/// Supervises backend service processes: spawn, readiness, restart policy,
/// cross-instance reuse via the state file, and PID recovery for services
/// started outside the daemon.
///
/// The supervisor exclusively owns every child it spawns and is the only
/// writer of the state file.
pub struct Supervisor {
    configs: RwLock<HashMap<String, ServiceConfig>>,
    children: DashMap<String, ChildHandle>,
    records: DashMap<String, ServiceRecord>,
    urls: DashMap<String, String>,
    store: StateStore,
    store_write: Mutex<()>,
    probe: Arc<dyn PortProbe>,
    http: reqwest::Client,
}

impl Supervisor {
    pub fn new(store: StateStore) -> Arc<Self> {
        Self::with_probe(store, Arc::new(LsofProbe))
    }

    pub fn with_probe(store: StateStore, probe: Arc<dyn PortProbe>) -> Arc<Self> {
        Arc::new(Self {
            configs: RwLock::new(HashMap::new()),
            children: DashMap::new(),
            records: DashMap::new(),
            urls: DashMap::new(),
            store,
            store_write: Mutex::new(()),
            probe,
            http: reqwest::Client::new(),
        })
    }

    /// Snapshot the in-memory records into the state file. Writes are
    /// serialized; the store itself renames atomically.
    async fn persist(&self) {
        let _guard = self.store_write.lock().await;
        let snapshot: HashMap<String, ServiceRecord> = self
            .records
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        if let Err(e) = self.store.save(&snapshot) {
            warn!(error = %e, "failed to persist service state");
        }
    }

    async fn set_state(&self, name: &str, state: ServiceStatus) {
        if let Some(mut rec) = self.records.get_mut(name) {
            rec.state = state;
        } else {
            self.records
                .insert(name.to_string(), ServiceRecord::new(state));
        }
        self.persist().await;
    }

    pub fn get_state(&self, name: &str) -> Option<ServiceRecord> {
        self.records.get(name).map(|r| r.value().clone())
    }

    pub fn get_all(&self) -> HashMap<String, ServiceRecord> {
        self.records
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    /// Adopt a PID the supervisor did not spawn (e.g. a stdio backend owned
    /// by its client) so `ps`, `kill`, and the next instance's reuse logic
    /// see a consistent record.
    pub async fn register_pid(&self, name: &str, pid: u32) {
        let url = self.urls.get(name).map(|u| u.value().clone());
        self.records
            .entry(name.to_string())
            .and_modify(|rec| rec.pid = Some(pid))
            .or_insert_with(|| ServiceRecord {
                state: ServiceStatus::Ready,
                pid: Some(pid),
                url,
            });
        self.persist().await;
    }

    /// Start a service. For sse transports this first tries to reuse a
    /// process recorded by an earlier instance, then to adopt one started
    /// externally, and only then spawns.
    pub async fn start(self: &Arc<Self>, name: &str, cfg: ServiceConfig) -> Result<()> {
        self.configs
            .write()
            .await
            .insert(name.to_string(), cfg.clone());
        if let Some(url) = &cfg.url {
            self.urls.insert(name.to_string(), url.clone());
        }

        if cfg.transport == Transport::Sse {
            let readiness_url = cfg
                .readiness_url()
                .ok_or_else(|| anyhow!("service '{name}' has no readiness URL"))?
                .to_string();

            let persisted = self.store.load();
            if let Some(rec) = persisted.get(name)
                && let Some(pid) = rec.pid
                && pid_alive(pid)
                && http_ready(&self.http, &readiness_url, PROBE_REQUEST_TIMEOUT).await
            {
                info!(service = %name, pid, "reusing running service from previous instance");
                self.records.insert(
                    name.to_string(),
                    ServiceRecord {
                        state: ServiceStatus::Ready,
                        pid: Some(pid),
                        url: cfg.url.clone(),
                    },
                );
                self.persist().await;
                return Ok(());
            }

            if http_ready(&self.http, &readiness_url, PROBE_REQUEST_TIMEOUT).await {
                let pid =
                    probe::recover_pid(&*self.probe, &readiness_url, &cfg.command, &cfg.args)
                        .await;
                info!(service = %name, ?pid, "adopting externally started service");
                self.records.insert(
                    name.to_string(),
                    ServiceRecord {
                        state: ServiceStatus::Ready,
                        pid,
                        url: cfg.url.clone(),
                    },
                );
                self.persist().await;
                return Ok(());
            }
        }

        self.spawn_service(name, &cfg).await
    }

    async fn spawn_service(self: &Arc<Self>, name: &str, cfg: &ServiceConfig) -> Result<()> {
        if self.children.contains_key(name) {
            bail!("service '{name}' is already running");
        }

        self.records.insert(
            name.to_string(),
            ServiceRecord {
                state: ServiceStatus::Starting,
                pid: None,
                url: cfg.url.clone(),
            },
        );
        self.persist().await;

        let mut cmd = Command::new(&cfg.command);
        if !cfg.args.is_empty() {
            cmd.args(&cfg.args);
        }
        for (key, value) in &cfg.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &cfg.cwd {
            cmd.current_dir(cwd);
        }
        // No pipes: the child must never block on a full stdio buffer.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.set_state(name, ServiceStatus::Error).await;
                return Err(e).with_context(|| {
                    format!("failed to spawn service '{name}' ({})", cfg.command)
                });
            }
        };
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("service '{name}' spawned without a pid"))?;
        debug!(service = %name, pid, "spawned child process");

        // The watcher task owns the child; exits are observed through the
        // channel so stop() never contends with wait().
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(_) => None,
            };
            let _ = exit_tx.send(Some(code));
        });

        self.children.insert(
            name.to_string(),
            ChildHandle {
                pid,
                exit_rx: exit_rx.clone(),
            },
        );
        if let Some(mut rec) = self.records.get_mut(name) {
            rec.pid = Some(pid);
        }
        self.persist().await;

        // Exit callback, attached at spawn.
        {
            let sup = Arc::clone(self);
            let service = name.to_string();
            let mut rx = exit_rx.clone();
            tokio::spawn(async move {
                let code = loop {
                    if let Some(code) = *rx.borrow() {
                        break code;
                    }
                    if rx.changed().await.is_err() {
                        break None;
                    }
                };
                sup.handle_exit(&service, pid, code).await;
            });
        }

        if cfg.transport == Transport::Sse && cfg.readiness.check == ReadinessCheck::Http {
            let readiness_url = cfg
                .readiness_url()
                .ok_or_else(|| anyhow!("service '{name}' has no readiness URL"))?;
            if let Err(e) = self
                .wait_ready(name, readiness_url, cfg.readiness.timeout, cfg.readiness.interval)
                .await
            {
                // The orphan must not outlive the failed start.
                let original = self.suppress_restart(name).await;
                if let Some((_, handle)) = self.children.remove(name) {
                    terminate(&handle).await;
                }
                self.restore_restart(name, original).await;

                if let Some(mut rec) = self.records.get_mut(name) {
                    rec.state = ServiceStatus::Error;
                    rec.pid = None;
                }
                self.persist().await;
                return Err(e);
            }
        }

        self.set_state(name, ServiceStatus::Ready).await;
        info!(service = %name, pid, "service ready");
        Ok(())
    }

    /// Poll the readiness URL until it answers 2xx or the deadline passes.
    async fn wait_ready(
        &self,
        name: &str,
        url: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if http_ready(&self.http, url, PROBE_REQUEST_TIMEOUT).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "service '{name}' readiness check timed out after {}ms ({url})",
                    timeout.as_millis()
                );
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Applies the restart policy when a supervised child exits.
    async fn handle_exit(self: &Arc<Self>, name: &str, pid: u32, code: ExitCode) {
        // A supervised stop removes the entry before killing; a stale watcher
        // from a replaced child must not fire either.
        match self.children.get(name) {
            Some(handle) if handle.pid == pid => {}
            _ => return,
        }
        self.children.remove(name);

        let prior = self.records.get(name).map(|r| r.state);
        let policy = self
            .configs
            .read()
            .await
            .get(name)
            .map(|c| c.restart)
            .unwrap_or(RestartPolicy::Never);

        let mut retried = false;

        if prior == Some(ServiceStatus::Ready) {
            warn!(service = %name, ?code, "service crashed");
            if let Some(mut rec) = self.records.get_mut(name) {
                rec.state = ServiceStatus::Error;
                rec.pid = None;
            }
            self.persist().await;
            if policy != RestartPolicy::Never {
                self.schedule_restart(name);
                retried = true;
            }
        } else if matches!(code, Some(c) if c != 0) {
            warn!(service = %name, ?code, "service failed during start");
            if let Some(mut rec) = self.records.get_mut(name) {
                rec.state = ServiceStatus::Error;
                rec.pid = None;
            }
            self.persist().await;
            if policy != RestartPolicy::Never {
                self.schedule_restart(name);
                retried = true;
            }
        } else if code == Some(0) && prior != Some(ServiceStatus::Starting) {
            info!(service = %name, "service exited cleanly");
            if let Some(mut rec) = self.records.get_mut(name) {
                rec.state = ServiceStatus::Stopped;
                rec.pid = None;
            }
            self.persist().await;
        }

        if !retried && policy == RestartPolicy::Always {
            self.schedule_restart(name);
        }
    }

    /// Queue a restart on the runtime rather than recursing in-line from the
    /// exit callback. Best-effort: terminal failure is only logged.
    fn schedule_restart(self: &Arc<Self>, name: &str) {
        let sup = Arc::clone(self);
        let service = name.to_string();
        tokio::spawn(async move {
            let cfg = sup.configs.read().await.get(&service).cloned();
            let Some(cfg) = cfg else { return };
            info!(service = %service, "restarting per policy");
            if let Err(e) = sup.start(&service, cfg).await {
                error!(service = %service, error = %e, "restart failed");
            }
        });
    }

    async fn suppress_restart(&self, name: &str) -> Option<RestartPolicy> {
        let mut configs = self.configs.write().await;
        configs
            .get_mut(name)
            .map(|c| std::mem::replace(&mut c.restart, RestartPolicy::Never))
    }

    async fn restore_restart(&self, name: &str, original: Option<RestartPolicy>) {
        if let Some(policy) = original {
            let mut configs = self.configs.write().await;
            if let Some(c) = configs.get_mut(name) {
                c.restart = policy;
            }
        }
    }

    /// Stop a service: SIGTERM, 5s grace, then SIGKILL. Restart handling is
    /// suppressed for the duration. Stopping a non-running service is a
    /// no-op.
    pub async fn stop(&self, name: &str) {
        let original = self.suppress_restart(name).await;

        if let Some((_, handle)) = self.children.remove(name) {
            terminate(&handle).await;
        } else if let Some(pid) = self.records.get(name).and_then(|r| r.pid) {
            // Adopted process: no exit channel, poll liveness instead.
            terminate_pid(pid).await;
        }

        if let Some(mut rec) = self.records.get_mut(name) {
            rec.state = ServiceStatus::Stopped;
            rec.pid = None;
        } else {
            self.records
                .insert(name.to_string(), ServiceRecord::new(ServiceStatus::Stopped));
        }
        self.persist().await;

        self.restore_restart(name, original).await;
        info!(service = %name, "service stopped");
    }

    /// Stop then start from the stored config.
    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<()> {
        let cfg = self
            .configs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no config for service '{name}'"))?;
        self.stop(name).await;
        self.start(name, cfg).await
    }

    /// Launch every service concurrently. If any fails, stop the ones that
    /// succeeded and surface an aggregated error naming each failure.
    pub async fn start_all(
        self: &Arc<Self>,
        services: &HashMap<String, ServiceConfig>,
    ) -> Result<()> {
        let mut join_set = tokio::task::JoinSet::new();
        for (name, cfg) in services {
            let sup = Arc::clone(self);
            let name = name.clone();
            let cfg = cfg.clone();
            join_set.spawn(async move {
                let result = sup.start(&name, cfg).await;
                (name, result)
            });
        }

        let mut started = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => started.push(name),
                Ok((name, Err(e))) => failures.push(format!("{name}: {e}")),
                Err(e) => failures.push(format!("join error: {e}")),
            }
        }

        if failures.is_empty() {
            return Ok(());
        }

        warn!(failed = failures.len(), "rolling back started services");
        for name in started {
            self.stop(&name).await;
        }
        bail!("failed to start services: {}", failures.join("; "))
    }

    /// Stop every tracked service in parallel.
    pub async fn stop_all(self: &Arc<Self>) {
        let names: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        let mut join_set = tokio::task::JoinSet::new();
        for name in names {
            let sup = Arc::clone(self);
            join_set.spawn(async move { sup.stop(&name).await });
        }
        while join_set.join_next().await.is_some() {}
    }
}

/// SIGTERM the child's process group, give it the grace period, then
/// SIGKILL and wait unconditionally.
async fn terminate(handle: &ChildHandle) {
    if handle.exit_rx.borrow().is_some() {
        return;
    }

    signal_group(handle.pid, false);

    let mut rx = handle.exit_rx.clone();
    let graceful = tokio::time::timeout(STOP_GRACE, async {
        while rx.borrow().is_none() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await;

    if graceful.is_err() {
        warn!(pid = handle.pid, "child ignored SIGTERM, sending SIGKILL");
        signal_group(handle.pid, true);
        while rx.borrow().is_none() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Terminate a process the supervisor did not spawn: same ladder, but exit
/// is observed by polling liveness.
async fn terminate_pid(pid: u32) {
    if !pid_alive(pid) {
        return;
    }

    signal_pid(pid, false);
    let deadline = Instant::now() + STOP_GRACE;
    while pid_alive(pid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if pid_alive(pid) {
        warn!(pid, "process ignored SIGTERM, sending SIGKILL");
        signal_pid(pid, true);
        while pid_alive(pid) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, force: bool) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if killpg(Pid::from_raw(pid as i32), sig).is_err() {
        signal_pid(pid, force);
    }
}

#[cfg(unix)]
fn signal_pid(pid: u32, force: bool) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    let _ = kill(Pid::from_raw(pid as i32), sig);
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _force: bool) {}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _force: bool) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Listener;
    use async_trait::async_trait;
    use std::collections::HashSet;

    fn store_in(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(dir.path().join(".mcpd-state.json"))
    }

    fn stdio_cfg(command: &str, args: &[&str]) -> ServiceConfig {
        ServiceConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            transport: Transport::Stdio,
            url: None,
            cwd: None,
            env: HashMap::new(),
            readiness: Default::default(),
            restart: RestartPolicy::Never,
            keep_alive: false,
            exclude_tools: HashSet::new(),
            middleware: Default::default(),
        }
    }

    fn sse_cfg(url: &str, command: &str) -> ServiceConfig {
        let mut cfg = stdio_cfg(command, &[]);
        cfg.transport = Transport::Sse;
        cfg.url = Some(url.to_string());
        cfg.readiness.timeout = Duration::from_millis(500);
        cfg.readiness.interval = Duration::from_millis(100);
        cfg
    }

    /// Loop a minimal HTTP 200 responder on an ephemeral port.
    async fn ok_server() -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = sock.read(&mut buf).await;
                    let _ = sock
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                        .await;
                });
            }
        });
        addr
    }

    struct FixedProbe(Vec<Listener>);

    #[async_trait]
    impl PortProbe for FixedProbe {
        async fn listeners_on(&self, _port: u16) -> Result<Vec<Listener>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn readiness_timeout_sets_error() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(store_in(&dir));

        // Port 1 refuses connections, so readiness can never pass.
        let mut cfg = sse_cfg("http://127.0.0.1:1/sse", "sleep");
        cfg.args = vec!["30".to_string()];

        let err = sup.start("svc", cfg).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");

        let rec = sup.get_state("svc").unwrap();
        assert_eq!(rec.state, ServiceStatus::Error);
        assert_eq!(rec.pid, None);
    }

    #[tokio::test]
    async fn stop_kills_child_and_records_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(store_in(&dir));

        sup.start("sleeper", stdio_cfg("sleep", &["30"]))
            .await
            .unwrap();
        let pid = sup.get_state("sleeper").unwrap().pid.unwrap();
        assert!(pid_alive(pid));

        sup.stop("sleeper").await;
        let rec = sup.get_state("sleeper").unwrap();
        assert_eq!(rec.state, ServiceStatus::Stopped);
        assert_eq!(rec.pid, None);
        assert!(!pid_alive(pid));
    }

    #[tokio::test]
    async fn stop_unknown_service_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(store_in(&dir));
        sup.stop("ghost").await;
    }

    #[tokio::test]
    async fn double_start_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(store_in(&dir));

        sup.start("svc", stdio_cfg("sleep", &["30"])).await.unwrap();
        let err = sup
            .start("svc", stdio_cfg("sleep", &["30"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already running"), "{err}");
        sup.stop("svc").await;
    }

    #[tokio::test]
    async fn crash_while_ready_marks_error() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(store_in(&dir));

        // Lives just long enough to be marked ready, then exits.
        sup.start("flaky", stdio_cfg("sh", &["-c", "sleep 0.3; exit 0"]))
            .await
            .unwrap();
        assert_eq!(sup.get_state("flaky").unwrap().state, ServiceStatus::Ready);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let state = sup.get_state("flaky").unwrap().state;
            if state == ServiceStatus::Error {
                break;
            }
            assert!(Instant::now() < deadline, "state stuck at {state:?}");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn reuse_adopts_recorded_pid_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        // A previous instance recorded our own (live) pid for this service.
        let mut persisted = HashMap::new();
        let url_addr = ok_server().await;
        let url = format!("http://{url_addr}/sse");
        persisted.insert(
            "svc".to_string(),
            ServiceRecord {
                state: ServiceStatus::Ready,
                pid: Some(std::process::id()),
                url: Some(url.clone()),
            },
        );
        store.save(&persisted).unwrap();

        let sup = Supervisor::new(store);
        // The command does not exist, so any spawn attempt would fail loudly.
        sup.start("svc", sse_cfg(&url, "mcpd-test-no-such-command"))
            .await
            .unwrap();

        let rec = sup.get_state("svc").unwrap();
        assert_eq!(rec.state, ServiceStatus::Ready);
        assert_eq!(rec.pid, Some(std::process::id()));
    }

    #[tokio::test]
    async fn external_service_adopted_with_pid_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(FixedProbe(vec![Listener {
            pid: 4242,
            command: "mock-server".to_string(),
        }]));
        let sup = Supervisor::with_probe(store_in(&dir), probe);

        let addr = ok_server().await;
        let url = format!("http://{addr}/sse");
        sup.start("svc", sse_cfg(&url, "mock-server")).await.unwrap();

        let rec = sup.get_state("svc").unwrap();
        assert_eq!(rec.state, ServiceStatus::Ready);
        assert_eq!(rec.pid, Some(4242));
    }

    #[tokio::test]
    async fn pid_recovery_fails_closed_on_hint_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(FixedProbe(vec![Listener {
            pid: 4242,
            command: "something-else".to_string(),
        }]));
        let sup = Supervisor::with_probe(store_in(&dir), probe);

        let addr = ok_server().await;
        let url = format!("http://{addr}/sse");
        sup.start("svc", sse_cfg(&url, "mock-server")).await.unwrap();

        let rec = sup.get_state("svc").unwrap();
        assert_eq!(rec.state, ServiceStatus::Ready);
        assert_eq!(rec.pid, None);
    }

    #[tokio::test]
    async fn start_all_rolls_back_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(store_in(&dir));

        let mut services = HashMap::new();
        services.insert("good".to_string(), stdio_cfg("sleep", &["30"]));
        services.insert(
            "bad".to_string(),
            stdio_cfg("mcpd-test-no-such-command", &[]),
        );

        let err = sup.start_all(&services).await.unwrap_err();
        assert!(err.to_string().contains("bad"), "{err}");

        let rec = sup.get_state("good").unwrap();
        assert_eq!(rec.state, ServiceStatus::Stopped);
        assert_eq!(rec.pid, None);
    }

    #[tokio::test]
    async fn register_pid_adopts_external_view() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let sup = Supervisor::new(store.clone());

        sup.register_pid("stdio-svc", 777).await;
        let rec = sup.get_state("stdio-svc").unwrap();
        assert_eq!(rec.state, ServiceStatus::Ready);
        assert_eq!(rec.pid, Some(777));

        // Visible to a later instance through the state file.
        assert_eq!(store.load().get("stdio-svc").unwrap().pid, Some(777));
    }

    #[tokio::test]
    async fn state_persisted_across_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let sup = Supervisor::new(store.clone());

        sup.start("svc", stdio_cfg("sleep", &["30"])).await.unwrap();
        assert_eq!(
            store.load().get("svc").unwrap().state,
            ServiceStatus::Ready
        );

        sup.stop("svc").await;
        assert_eq!(
            store.load().get("svc").unwrap().state,
            ServiceStatus::Stopped
        );
    }
}
