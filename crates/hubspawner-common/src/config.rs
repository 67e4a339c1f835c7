//! Spawner configuration: YAML file plus `HUBSPAWNER_*` environment overrides.

use crate::{PullPolicy, ResourceLimits, Result, SpawnerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "HUBSPAWNER_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnerConfig {
    /// Leading component of every object name.
    pub prefix: String,
    pub image: String,
    /// Remove the object on stop instead of leaving it stopped.
    pub remove: bool,
    pub network_name: String,
    /// Connect to the object's network address instead of a published host port.
    pub use_internal_ip: bool,
    pub port: u16,
    pub host_ip: String,
    pub extra_host_config: serde_json::Map<String, serde_json::Value>,
    /// Host path or volume name template -> path inside the object.
    pub volumes: BTreeMap<String, String>,
    pub read_only_volumes: BTreeMap<String, String>,
    /// e.g. `512M`, `2G`, or plain bytes.
    pub mem_limit: Option<String>,
    pub cpu_limit: Option<f64>,
    pub environment: BTreeMap<String, String>,
    /// Images a user may select. Empty means only `image` is used.
    pub allowed_images: Vec<String>,
    pub pull_policy: PullPolicy,
    pub command: Option<Vec<String>>,
    pub start_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub poll_interval_ms: u64,
    /// Use the strict replacement table: resource changes recreate the object.
    pub recreate_on_resource_change: bool,
    pub engine: EngineSettings,
    pub system_user: SystemUserSettings,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            prefix: "hubspawner".to_string(),
            image: "quay.io/jupyterhub/singleuser:latest".to_string(),
            remove: false,
            network_name: "bridge".to_string(),
            use_internal_ip: false,
            port: 8888,
            host_ip: "127.0.0.1".to_string(),
            extra_host_config: serde_json::Map::new(),
            volumes: BTreeMap::new(),
            read_only_volumes: BTreeMap::new(),
            mem_limit: None,
            cpu_limit: None,
            environment: BTreeMap::new(),
            allowed_images: Vec::new(),
            pull_policy: PullPolicy::IfNotPresent,
            command: None,
            start_timeout_secs: 120,
            stop_grace_secs: 10,
            poll_interval_ms: 500,
            recreate_on_resource_change: false,
            engine: EngineSettings::default(),
            system_user: SystemUserSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Upper bound on a single engine call.
    pub call_timeout_secs: u64,
    pub retry: RetrySettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            retry: RetrySettings::default(),
        }
    }
}

impl EngineSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl RetrySettings {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemUserSettings {
    pub host_homedir_format_string: String,
    pub image_homedir_format_string: String,
    /// Explicit uid per user; users not listed are looked up on the host.
    pub user_ids: BTreeMap<String, u32>,
    /// Group id for every user; defaults to the user's primary group.
    pub group_id: Option<u32>,
}

impl Default for SystemUserSettings {
    fn default() -> Self {
        Self {
            host_homedir_format_string: "/home/{username}".to_string(),
            image_homedir_format_string: "/home/{username}".to_string(),
            user_ids: BTreeMap::new(),
            group_id: None,
        }
    }
}

impl SpawnerConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: SpawnerConfig = serde_yaml::from_str(raw)?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Overlay `HUBSPAWNER_*` variables from the process environment.
    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Overlay variables from `lookup`, which receives full names like `HUBSPAWNER_IMAGE`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("PREFIX") {
            self.prefix = v;
        }
        if let Some(v) = get("IMAGE") {
            self.image = v;
        }
        if let Some(v) = get("NETWORK") {
            self.network_name = v;
        }
        if let Some(v) = get("HOST_IP") {
            self.host_ip = v;
        }
        if let Some(v) = get("REMOVE") {
            self.remove = parse_bool("REMOVE", &v)?;
        }
        if let Some(v) = get("USE_INTERNAL_IP") {
            self.use_internal_ip = parse_bool("USE_INTERNAL_IP", &v)?;
        }
        if let Some(v) = get("PORT") {
            self.port = v
                .parse()
                .map_err(|_| SpawnerError::Config(format!("{ENV_PREFIX}PORT: invalid port '{v}'")))?;
        }
        if let Some(v) = get("MEM_LIMIT") {
            self.mem_limit = Some(v);
        }
        if let Some(v) = get("CPU_LIMIT") {
            self.cpu_limit = Some(v.parse().map_err(|_| {
                SpawnerError::Config(format!("{ENV_PREFIX}CPU_LIMIT: invalid number '{v}'"))
            })?);
        }
        if let Some(v) = get("PULL_POLICY") {
            self.pull_policy = serde_yaml::from_str(&v.to_lowercase())?;
        }
        if let Some(v) = get("START_TIMEOUT") {
            self.start_timeout_secs = v.parse().map_err(|_| {
                SpawnerError::Config(format!("{ENV_PREFIX}START_TIMEOUT: invalid seconds '{v}'"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(SpawnerError::Config("image must not be empty".to_string()));
        }
        if self.network_name.trim().is_empty() {
            return Err(SpawnerError::Config("network_name must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(SpawnerError::Config("port must be non-zero".to_string()));
        }
        if self.engine.call_timeout_secs == 0 {
            return Err(SpawnerError::Config(
                "engine.call_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(SpawnerError::Config("poll_interval_ms must be non-zero".to_string()));
        }
        if self.engine.retry.max_attempts == 0 {
            return Err(SpawnerError::Config(
                "engine.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        self.resources()?;
        Ok(())
    }

    pub fn resources(&self) -> Result<ResourceLimits> {
        let memory_bytes = self.mem_limit.as_deref().map(parse_memory).transpose()?;
        let nano_cpus = match self.cpu_limit {
            Some(cpus) if !cpus.is_finite() || cpus <= 0.0 => {
                return Err(SpawnerError::Config(format!("cpu_limit must be positive, got {cpus}")))
            }
            Some(cpus) => Some((cpus * 1_000_000_000.0) as i64),
            None => None,
        };
        Ok(ResourceLimits {
            memory_bytes,
            nano_cpus,
        })
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SpawnerError::Config(format!(
            "{ENV_PREFIX}{name}: expected a boolean, got '{raw}'"
        ))),
    }
}

/// Parse `1024`, `512k`, `512M`, `2G`, `1T` (binary multiples, optional trailing `b`).
pub fn parse_memory(raw: &str) -> Result<i64> {
    let lowered = raw.trim().to_ascii_lowercase();
    let s = lowered.strip_suffix('b').unwrap_or(lowered.as_str());
    let (digits, multiplier) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], 1i64 << 10),
        Some('m') => (&s[..s.len() - 1], 1i64 << 20),
        Some('g') => (&s[..s.len() - 1], 1i64 << 30),
        Some('t') => (&s[..s.len() - 1], 1i64 << 40),
        _ => (s, 1),
    };
    let value: f64 = digits
        .trim()
        .parse()
        .map_err(|_| SpawnerError::Config(format!("invalid memory limit '{raw}'")))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(SpawnerError::Config(format!("memory limit must be positive, got '{raw}'")));
    }
    let bytes = value * multiplier as f64;
    if bytes >= i64::MAX as f64 {
        return Err(SpawnerError::Config(format!("memory limit '{raw}' is too large")));
    }
    Ok(bytes as i64)
}
