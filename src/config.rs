use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level mcpd configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

/// Declaration of one backend service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// Command to spawn.
    pub command: String,

    /// Arguments for the command.
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_transport")]
    pub transport: Transport,

    /// Where to connect (required for sse) and, by default, where readiness
    /// is probed.
    pub url: Option<String>,

    /// Working directory for the child process.
    pub cwd: Option<String>,

    /// Environment variables passed to the child process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub readiness: ReadinessConfig,

    #[serde(default = "default_restart")]
    pub restart: RestartPolicy,

    /// Services with keep_alive survive daemon shutdown for reuse by a
    /// later instance.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,

    /// Tool names hidden from this backend's inventory.
    #[serde(default)]
    pub exclude_tools: HashSet<String>,

    #[serde(default)]
    pub middleware: MiddlewareConfig,
}

impl ServiceConfig {
    /// The URL polled for readiness: explicit `readiness.url`, else the
    /// service url.
    pub fn readiness_url(&self) -> Option<&str> {
        self.readiness.url.as_deref().or(self.url.as_deref())
    }
}

/// Transport type for a service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Sse,
    Stdio,
}

/// Restart policy applied on child exit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    OnFailure,
    Always,
    Never,
}

impl std::str::FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on-failure" => Ok(RestartPolicy::OnFailure),
            "always" => Ok(RestartPolicy::Always),
            "never" => Ok(RestartPolicy::Never),
            _ => Err(format!(
                "unknown restart policy '{s}' (expected on-failure, always, or never)"
            )),
        }
    }
}

/// Readiness probing for sse services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadinessConfig {
    #[serde(default)]
    pub check: ReadinessCheck,

    /// Overrides the probed URL. Defaults to the service url.
    pub url: Option<String>,

    #[serde(default = "default_readiness_timeout", with = "duration_ms")]
    pub timeout: Duration,

    #[serde(default = "default_readiness_interval", with = "duration_ms")]
    pub interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            check: ReadinessCheck::Http,
            url: None,
            timeout: default_readiness_timeout(),
            interval: default_readiness_interval(),
        }
    }
}

/// Readiness check kind. Only HTTP polling is recognized.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessCheck {
    #[default]
    Http,
}

/// Per-service middleware chains.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MiddlewareConfig {
    /// Response transforms, applied in declared order.
    #[serde(default)]
    pub response: Vec<MiddlewareEntry>,
}

/// One middleware reference: either a bare name or a `{name: cfg}` map.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MiddlewareEntry {
    pub name: String,
    pub config: Value,
}

impl<'de> Deserialize<'de> for MiddlewareEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Name(String),
            Configured(HashMap<String, Value>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Name(name) => Ok(MiddlewareEntry {
                name,
                config: Value::Null,
            }),
            Repr::Configured(map) => {
                let mut entries: Vec<(String, Value)> = map.into_iter().collect();
                if entries.len() != 1 {
                    return Err(serde::de::Error::custom(
                        "middleware entry map must have exactly one key",
                    ));
                }
                let (name, config) = entries.remove(0);
                Ok(MiddlewareEntry { name, config })
            }
        }
    }
}

// --- Defaults ---

fn default_log_level() -> String {
    "info".to_string()
}
fn default_transport() -> Transport {
    Transport::Sse
}
fn default_restart() -> RestartPolicy {
    RestartPolicy::OnFailure
}
fn default_keep_alive() -> bool {
    true
}
fn default_readiness_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_readiness_interval() -> Duration {
    Duration::from_millis(500)
}

// --- duration_ms serde helper ---
//
// Accepts "500ms", "30s", "5m", or a bare number of milliseconds.

mod duration_ms {
    use serde::{self, Deserializer, Serializer, de};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms = duration.as_millis() as u64;
        if ms >= 1000 && ms.is_multiple_of(1000) {
            serializer.serialize_str(&format!("{}s", ms / 1000))
        } else {
            serializer.serialize_str(&format!("{ms}ms"))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl de::Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a duration like '500ms', '30s', '5m', or milliseconds")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_millis(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                if v < 0 {
                    return Err(E::custom("duration must be non-negative"));
                }
                Ok(Duration::from_millis(v as u64))
            }

            fn visit_str<E: de::Error>(self, s: &str) -> Result<Duration, E> {
                super::parse_duration(s).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

/// Parse `<num>(ms|s|m)` or a raw number of milliseconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(n) = s.strip_suffix("ms") {
        n.trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| format!("invalid duration '{s}': {e}"))
    } else if let Some(n) = s.strip_suffix('s') {
        n.trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| format!("invalid duration '{s}': {e}"))
    } else if let Some(n) = s.strip_suffix('m') {
        n.trim()
            .parse::<u64>()
            .map(|m| Duration::from_secs(m * 60))
            .map_err(|e| format!("invalid duration '{s}': {e}"))
    } else {
        s.parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| format!("invalid duration '{s}': expected '500ms', '30s', '5m', or ms"))
    }
}

// --- Placeholder expansion ---

/// Expand `${env.VAR}`, `${workspaceRoot}`, and `${home}` in the raw config
/// text. Substituted values are expanded again so nested references resolve;
/// unknown placeholders are left literal.
pub fn expand_placeholders(raw: &str) -> String {
    use regex::{Captures, Regex};
    use std::sync::OnceLock;

    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{(?:env\.([A-Za-z_][A-Za-z0-9_]*)|(workspaceRoot)|(home))\}").unwrap()
    });

    let mut text = raw.to_string();
    // Bounded passes so a self-referential env var cannot loop forever.
    for _ in 0..8 {
        let next = re
            .replace_all(&text, |caps: &Captures| {
                if let Some(var) = caps.get(1) {
                    match std::env::var(var.as_str()) {
                        Ok(value) => value,
                        Err(_) => caps[0].to_string(),
                    }
                } else if caps.get(2).is_some() {
                    std::env::current_dir()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|_| caps[0].to_string())
                } else {
                    dirs::home_dir()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| caps[0].to_string())
                }
            })
            .into_owned();
        if next == text {
            break;
        }
        text = next;
    }
    text
}

// --- Loading ---

/// Locate the config file: explicit path (must exist), `./mcpd.yml`, then
/// `~/.config/mcpd/config.yml`.
pub fn find_config(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if !path.exists() {
            bail!("config file not found: {}", path.display());
        }
        return Ok(path.to_path_buf());
    }

    let local = PathBuf::from("mcpd.yml");
    if local.is_file() {
        return Ok(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let user = config_dir.join("mcpd").join("config.yml");
        if user.is_file() {
            return Ok(user);
        }
    }

    bail!("no config file found (looked for ./mcpd.yml and ~/.config/mcpd/config.yml)")
}

impl Config {
    /// Load config from a YAML file.
    ///
    /// Pipeline: read file → expand placeholders → deserialize YAML → validate
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let expanded = expand_placeholders(&raw);

        let config: Config = serde_yaml_ng::from_str(&expanded)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Violations abort startup.
    pub fn validate(&self) -> Result<()> {
        for (name, service) in &self.services {
            if service.command.trim().is_empty() {
                bail!("service '{name}': 'command' must be non-empty");
            }

            if service.transport == Transport::Sse && service.url.is_none() {
                bail!("service '{name}': sse transport requires 'url' field");
            }

            if service.readiness.timeout.is_zero() {
                bail!("service '{name}': readiness timeout must be positive");
            }
            if service.readiness.interval.is_zero() {
                bail!("service '{name}': readiness interval must be positive");
            }

            for entry in &service.middleware.response {
                if crate::middleware::builtin(&entry.name).is_none() {
                    bail!(
                        "service '{name}': unknown middleware '{}' in middleware.response",
                        entry.name
                    );
                }
            }
        }
        Ok(())
    }
}
