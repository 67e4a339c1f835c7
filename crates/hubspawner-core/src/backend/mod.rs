//! Per-variant strategies: how a spawn request becomes an engine object and
//! how that object's address is derived.

mod container;
mod swarm;
mod system_user;

pub use container::ContainerBackend;
pub use swarm::SwarmBackend;
pub use system_user::{lookup_passwd, SystemUserBackend};

use crate::docker::LABEL_NETWORK;
use crate::naming::CanonicalName;
use async_trait::async_trait;
use hubspawner_common::{
    Endpoint, EngineClient, EngineError, EngineObservation, EngineResult, LogStream, MountSpec,
    ObjectKind, ObjectSpec, PullPolicy, ResourceLimits, Result, SpawnRequest, SpawnerConfig,
    SpawnerError,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const LABEL_GEN_IMAGE: &str = "hubspawner.gen.image";
pub const LABEL_GEN_MOUNTS: &str = "hubspawner.gen.mounts";
pub const LABEL_GEN_NETWORK: &str = LABEL_NETWORK;
pub const LABEL_GEN_USER: &str = "hubspawner.gen.user";

/// What to do with an existing, stopped object whose field no longer matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    Recreate,
    UpdateInPlace,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Image,
    Mounts,
    Network,
    User,
    Resources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplacementPolicy {
    pub image: FieldPolicy,
    pub mounts: FieldPolicy,
    pub network: FieldPolicy,
    pub user: FieldPolicy,
    pub resources: FieldPolicy,
}

impl ReplacementPolicy {
    /// Identity-bearing fields recreate, resource limits are updated in place.
    pub fn standard() -> Self {
        Self {
            image: FieldPolicy::Recreate,
            mounts: FieldPolicy::Recreate,
            network: FieldPolicy::Recreate,
            user: FieldPolicy::Recreate,
            resources: FieldPolicy::UpdateInPlace,
        }
    }

    pub fn strict() -> Self {
        Self {
            resources: FieldPolicy::Recreate,
            ..Self::standard()
        }
    }

    pub fn from_config(config: &SpawnerConfig) -> Self {
        if config.recreate_on_resource_change {
            Self::strict()
        } else {
            Self::standard()
        }
    }

    pub fn for_field(&self, field: Field) -> FieldPolicy {
        match field {
            Field::Image => self.image,
            Field::Mounts => self.mounts,
            Field::Network => self.network,
            Field::User => self.user,
            Field::Resources => self.resources,
        }
    }
}

impl Default for ReplacementPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Deployment variant selected by the operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    #[default]
    Container,
    Swarm,
    SystemUser,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Container => write!(f, "container"),
            Variant::Swarm => write!(f, "swarm"),
            Variant::SystemUser => write!(f, "system-user"),
        }
    }
}

impl FromStr for Variant {
    type Err = SpawnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "container" | "docker" => Ok(Variant::Container),
            "swarm" | "service" => Ok(Variant::Swarm),
            "system-user" | "system_user" => Ok(Variant::SystemUser),
            other => Err(SpawnerError::Config(format!("unknown variant '{other}'"))),
        }
    }
}

/// Build the backend for `variant`.
pub fn backend_for(
    variant: Variant,
    engine: Arc<dyn EngineClient>,
    config: Arc<SpawnerConfig>,
) -> Arc<dyn ObjectBackend> {
    match variant {
        Variant::Container => Arc::new(ContainerBackend::new(engine, config)),
        Variant::Swarm => Arc::new(SwarmBackend::new(engine, config)),
        Variant::SystemUser => Arc::new(SystemUserBackend::new(engine, config)),
    }
}

/// Capability set every variant provides. Engine operations have shared
/// defaults; variants override spec construction and endpoint derivation.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    fn kind(&self) -> ObjectKind;

    fn engine(&self) -> &dyn EngineClient;

    fn policy(&self) -> ReplacementPolicy;

    fn pull_policy(&self) -> PullPolicy;

    fn build_spec(&self, request: &SpawnRequest, name: &CanonicalName) -> Result<ObjectSpec>;

    /// Address the hub should proxy to, if the observation has one.
    fn endpoint(&self, observed: &EngineObservation) -> Option<Endpoint>;

    /// Make sure the image is available according to the pull policy.
    async fn prepare(&self, spec: &ObjectSpec) -> EngineResult<()> {
        self.engine().ensure_image(&spec.image, self.pull_policy()).await
    }

    async fn create(&self, spec: &ObjectSpec) -> EngineResult<String> {
        self.engine().create(spec).await
    }

    async fn start(&self, id: &str) -> EngineResult<()> {
        self.engine().start(self.kind(), id).await
    }

    async fn stop(&self, id: &str, grace: Duration) -> EngineResult<()> {
        self.engine().stop(self.kind(), id, grace).await
    }

    async fn remove(&self, id: &str) -> EngineResult<()> {
        self.engine().remove(self.kind(), id, true).await
    }

    /// `Ok(None)` when the engine has no such object.
    async fn inspect(&self, id_or_name: &str) -> EngineResult<Option<EngineObservation>> {
        match self.engine().inspect(self.kind(), id_or_name).await {
            Ok(obs) => Ok(Some(obs)),
            Err(EngineError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Find the object carrying `selector`, preferring a running one.
    async fn find_by_labels(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> EngineResult<Option<EngineObservation>> {
        let mut found = self.engine().list_by_label(self.kind(), selector).await?;
        if found.len() > 1 {
            warn!(
                matches = found.len(),
                ?selector,
                "Several objects carry the same owner labels"
            );
        }
        found.sort_by_key(|obs| !obs.running);
        Ok(found.into_iter().next())
    }

    async fn update_resources(&self, id: &str, limits: &ResourceLimits) -> EngineResult<()> {
        self.engine().update_resources(self.kind(), id, limits).await
    }

    async fn logs(&self, id: &str) -> EngineResult<LogStream> {
        self.engine().logs(self.kind(), id).await
    }
}

/// Fields shared by every variant; callers adjust the result.
pub fn base_spec(
    kind: ObjectKind,
    request: &SpawnRequest,
    name: &CanonicalName,
    config: &SpawnerConfig,
) -> ObjectSpec {
    let mut env = request.environment.clone();
    env.insert("JUPYTER_IMAGE_SPEC".to_string(), request.image.clone());
    env.insert("JUPYTER_IMAGE".to_string(), request.image.clone());

    ObjectSpec {
        name: name.name.clone(),
        kind,
        image: request.image.clone(),
        command: config.command.clone(),
        env,
        labels: name.labels.clone(),
        mounts: request.mounts.clone(),
        network: request.network.clone(),
        resources: request.resources,
        port: config.port,
        host_ip: config.host_ip.clone(),
        user: None,
        working_dir: None,
        replicas: 1,
        extra_host_config: serde_json::Map::new(),
    }
}

/// Stable digest of a mount list, independent of order.
pub fn mounts_digest(mounts: &[MountSpec]) -> String {
    let mut sorted: Vec<&MountSpec> = mounts.iter().collect();
    sorted.sort();
    let canonical: Vec<String> = sorted.iter().map(|m| m.to_bind()).collect();
    format!("{:x}", Sha256::digest(canonical.join("\n").as_bytes()))
}

/// Generation markers recorded on the object at creation.
pub fn generation_labels(spec: &ObjectSpec) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_GEN_IMAGE.to_string(), spec.image.clone());
    labels.insert(LABEL_GEN_MOUNTS.to_string(), mounts_digest(&spec.mounts));
    labels.insert(LABEL_GEN_NETWORK.to_string(), spec.network.name.clone());
    labels.insert(
        LABEL_GEN_USER.to_string(),
        spec.user.clone().unwrap_or_default(),
    );
    labels
}

/// Add the generation markers for the object's current contents.
pub fn stamp_generation(spec: &mut ObjectSpec) {
    let markers = generation_labels(spec);
    spec.labels.extend(markers);
}
