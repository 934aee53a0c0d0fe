use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Default state file name, relative to the project root.
pub const STATE_FILE: &str = ".mcpd-state.json";

/// Runtime state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Ready,
    Error,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Ready => "ready",
            ServiceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Persisted record for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub state: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ServiceRecord {
    pub fn new(state: ServiceStatus) -> Self {
        Self {
            state,
            pid: None,
            url: None,
        }
    }
}

/// Durable service registry on disk. The supervisor is the only writer; a
/// later daemon instance reads it to detect reusable backends.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// State store at the project root.
    pub fn at_project_root() -> Self {
        Self::new(STATE_FILE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the registry. A missing file is an empty registry; an unparsable
    /// one (e.g. a write that crashed mid-flush) is treated the same, with a
    /// warning.
    pub fn load(&self) -> HashMap<String, ServiceRecord> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return HashMap::new(),
        };

        match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "state file unparsable, treating as empty registry"
                );
                HashMap::new()
            }
        }
    }

    /// Write the full registry atomically: serialize to a sibling temp file,
    /// then rename over the target so readers never observe a torn write.
    pub fn save(&self, map: &HashMap<String, ServiceRecord>) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Delete the state file, ignoring a missing one.
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
