use anyhow::Result;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use crate::config::{Config, Transport};
use crate::pidfile;
use crate::state::{ServiceStatus, StateStore};
use crate::supervisor::Supervisor;

/// `ps` / `list` / `ls`: daemon liveness plus the tracked service table.
pub fn ps(store: &StateStore) -> Result<i32> {
    let pid_path = pidfile::default_path();
    match pidfile::read(&pid_path) {
        Some(pid) if pidfile::pid_alive(pid) => println!("daemon: running (pid {pid})"),
        Some(pid) => println!("daemon: not running (stale pid file, pid {pid})"),
        None => println!("daemon: not running"),
    }

    let map = store.load();
    if map.is_empty() {
        println!("no services tracked");
        return Ok(0);
    }

    println!("{:<20} {:>8}  {:<8} {}", "SERVICE", "PID", "STATE", "URL");
    let mut names: Vec<&String> = map.keys().collect();
    names.sort();
    for name in names {
        let rec = &map[name];
        let pid = rec
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:>8}  {:<8} {}",
            name,
            pid,
            rec.state.to_string(),
            rec.url.as_deref().unwrap_or("-")
        );
    }
    Ok(0)
}

/// `kill [name|all]`: SIGTERM tracked PID(s) and mark them stopped.
/// Unknown name exits 1.
pub fn kill(store: &StateStore, target: Option<&str>) -> Result<i32> {
    let target = target.unwrap_or("all");
    let mut map = store.load();

    if target == "all" {
        for (name, rec) in map.iter_mut() {
            if let Some(pid) = rec.pid.take() {
                println!("stopping {name} (pid {pid})");
                sigterm(pid);
            }
            rec.state = ServiceStatus::Stopped;
        }
        store.save(&map)?;
        return Ok(0);
    }

    match map.get_mut(target) {
        None => {
            eprintln!("unknown service '{target}'");
            Ok(1)
        }
        Some(rec) => {
            if let Some(pid) = rec.pid.take() {
                println!("stopping {target} (pid {pid})");
                sigterm(pid);
            }
            rec.state = ServiceStatus::Stopped;
            store.save(&map)?;
            Ok(0)
        }
    }
}

/// `restart [name|all]`: kill tracked PID(s), give them a moment to release
/// their ports, then start SSE services fresh under a supervisor. The new
/// processes keep running for the next `start` instance to adopt.
pub async fn restart(store: &StateStore, config: &Config, target: Option<&str>) -> Result<i32> {
    let target = target.unwrap_or("all");

    let services: HashMap<String, _> = config
        .services
        .iter()
        .filter(|(name, cfg)| {
            cfg.transport == Transport::Sse && (target == "all" || name.as_str() == target)
        })
        .map(|(name, cfg)| (name.clone(), cfg.clone()))
        .collect();

    if target != "all" && services.is_empty() {
        eprintln!("unknown service '{target}'");
        return Ok(1);
    }

    let killed = kill(store, Some(target))?;
    if killed != 0 {
        return Ok(killed);
    }

    tokio::time::sleep(Duration::from_secs(1)).await;

    let sup = Supervisor::new(store.clone());
    sup.start_all(&services).await?;
    info!(services = services.len(), "services restarted");
    Ok(0)
}

#[cfg(unix)]
fn sigterm(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn sigterm(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ServiceRecord;

    fn store_with(names: &[(&str, Option<u32>)]) -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join(".mcpd-state.json"));
        let mut map = HashMap::new();
        for (name, pid) in names {
            map.insert(
                name.to_string(),
                ServiceRecord {
                    state: ServiceStatus::Ready,
                    pid: *pid,
                    url: None,
                },
            );
        }
        store.save(&map).unwrap();
        (dir, store)
    }

    #[test]
    fn kill_unknown_service_fails() {
        let (_dir, store) = store_with(&[("svc", None)]);
        let code = kill(&store, Some("ghost")).unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn kill_marks_stopped() {
        // A pid far above pid_max cannot exist, so the SIGTERM is a no-op.
        let (_dir, store) = store_with(&[("svc", Some(2_000_000_001))]);
        let code = kill(&store, Some("svc")).unwrap();
        assert_eq!(code, 0);

        let rec = store.load().remove("svc").unwrap();
        assert_eq!(rec.state, ServiceStatus::Stopped);
        assert_eq!(rec.pid, None);
    }

    #[test]
    fn kill_all_sweeps_every_record() {
        let (_dir, store) = store_with(&[("a", Some(2_000_000_001)), ("b", None)]);
        let code = kill(&store, None).unwrap();
        assert_eq!(code, 0);

        let map = store.load();
        assert!(map.values().all(|r| r.state == ServiceStatus::Stopped));
        assert!(map.values().all(|r| r.pid.is_none()));
    }

    #[test]
    fn ps_runs_against_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join(".mcpd-state.json"));
        assert_eq!(ps(&store).unwrap(), 0);
    }

    #[tokio::test]
    async fn restart_unknown_service_fails() {
        let (_dir, store) = store_with(&[]);
        let config = Config::default();
        let code = restart(&store, &config, Some("ghost")).await.unwrap();
        assert_eq!(code, 1);
    }
}
