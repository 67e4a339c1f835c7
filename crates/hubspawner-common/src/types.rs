use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display};

/// Which kind of engine object backs a user's server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Container,
    Service,
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Container => write!(f, "container"),
            ObjectKind::Service => write!(f, "service"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
}

impl ResourceLimits {
    pub fn is_unlimited(&self) -> bool {
        self.memory_bytes.is_none() && self.nano_cpus.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
    pub kind: MountKind,
}

impl MountSpec {
    /// `source` is a host path for binds and a volume name otherwise.
    pub fn new(source: impl Into<String>, target: impl Into<String>, read_only: bool) -> Self {
        let source = source.into();
        let kind = if source.starts_with('/') {
            MountKind::Bind
        } else {
            MountKind::Volume
        };
        Self {
            source,
            target: target.into(),
            read_only,
            kind,
        }
    }

    /// Docker `binds` notation: `source:target:ro|rw`.
    pub fn to_bind(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.source, self.target, mode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub use_internal_ip: bool,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            name: "bridge".to_string(),
            use_internal_ip: false,
        }
    }
}

/// Options the hub passes along with a spawn (e.g. from a user's options form).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserOptions {
    pub image: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Everything one start attempt needs, built fresh from config on every start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub user_id: String,
    /// Empty for the user's default server.
    pub server_name: String,
    pub image: String,
    pub resources: ResourceLimits,
    pub environment: BTreeMap<String, String>,
    pub network: NetworkSpec,
    pub mounts: Vec<MountSpec>,
}

/// Engine-facing description of the object a variant wants to exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSpec {
    pub name: String,
    pub kind: ObjectKind,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub network: NetworkSpec,
    pub resources: ResourceLimits,
    /// Port the notebook server listens on inside the object.
    pub port: u16,
    /// Host interface for published ports (containers only).
    pub host_ip: String,
    /// `user` to run the entrypoint as, if the variant overrides the image default.
    pub user: Option<String>,
    pub working_dir: Option<String>,
    /// Desired running replicas (services only).
    pub replicas: u64,
    /// Raw `HostConfig` fields merged over the generated ones (containers only).
    pub extra_host_config: serde_json::Map<String, serde_json::Value>,
}

impl ObjectSpec {
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// Point-in-time engine view of one object. Never cached or persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineObservation {
    pub id: String,
    pub name: String,
    pub kind: Option<ObjectKind>,
    pub running: bool,
    /// Engine status text, e.g. `running`, `exited`, `created`.
    pub status: String,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub ip_address: Option<String>,
    pub host_port: Option<u16>,
    pub labels: BTreeMap<String, String>,
    pub image: Option<String>,
    pub resources: ResourceLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Reported by `poll()` once the object is no longer running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: i64,
    pub message: String,
}

impl ExitStatus {
    pub fn from_observation(obs: &EngineObservation) -> Self {
        let code = obs.exit_code.unwrap_or(0);
        let message = match &obs.error {
            Some(err) if !err.is_empty() => {
                format!("ExitCode={code}, Status={}, Error='{err}'", obs.status)
            }
            _ => format!("ExitCode={code}, Status={}", obs.status),
        };
        Self { code, message }
    }

    /// The object disappeared from the engine.
    pub fn vanished(name: &str) -> Self {
        Self {
            code: 0,
            message: format!("{name} not found"),
        }
    }
}

impl Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStatus {
    Absent,
    Created,
    Starting,
    Running,
    Stopped,
    Removed,
    Error,
}

impl ObjectStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ObjectStatus::Absent | ObjectStatus::Stopped | ObjectStatus::Removed | ObjectStatus::Error
        )
    }
}

/// The one object a spawner owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedObject {
    pub engine_object_id: Option<String>,
    pub kind: ObjectKind,
    pub name: String,
    pub status: ObjectStatus,
    pub endpoint: Option<Endpoint>,
}

impl ManagedObject {
    pub fn absent(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            engine_object_id: None,
            kind,
            name: name.into(),
            status: ObjectStatus::Absent,
            endpoint: None,
        }
    }
}

/// What the hub stores between restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ObjectKind>,
}

impl PersistedState {
    pub fn is_empty(&self) -> bool {
        self.object_id.is_none()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_value(value: serde_json::Value) -> crate::Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    #[default]
    IfNotPresent,
    Always,
    Never,
    Skip,
}
