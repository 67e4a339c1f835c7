use super::{base_spec, stamp_generation, ObjectBackend, ReplacementPolicy};
use crate::naming::CanonicalName;
use async_trait::async_trait;
use hubspawner_common::{
    Endpoint, EngineClient, EngineObservation, ObjectKind, ObjectSpec, PullPolicy, Result,
    SpawnRequest, SpawnerConfig,
};
use std::sync::Arc;

/// One plain container per user server.
pub struct ContainerBackend {
    engine: Arc<dyn EngineClient>,
    config: Arc<SpawnerConfig>,
}

impl ContainerBackend {
    pub fn new(engine: Arc<dyn EngineClient>, config: Arc<SpawnerConfig>) -> Self {
        Self { engine, config }
    }
}

/// Published ports bound to every interface are reached through loopback.
pub(super) fn connect_ip(host_ip: &str) -> String {
    match host_ip {
        "" | "0.0.0.0" => "127.0.0.1".to_string(),
        "::" => "::1".to_string(),
        ip => ip.to_string(),
    }
}

pub(super) fn container_endpoint(
    config: &SpawnerConfig,
    observed: &EngineObservation,
) -> Option<Endpoint> {
    if !observed.running {
        return None;
    }
    if config.use_internal_ip {
        observed.ip_address.clone().map(|ip| Endpoint {
            ip,
            port: config.port,
        })
    } else {
        observed.host_port.map(|port| Endpoint {
            ip: connect_ip(&config.host_ip),
            port,
        })
    }
}

#[async_trait]
impl ObjectBackend for ContainerBackend {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Container
    }

    fn engine(&self) -> &dyn EngineClient {
        self.engine.as_ref()
    }

    fn policy(&self) -> ReplacementPolicy {
        ReplacementPolicy::from_config(&self.config)
    }

    fn pull_policy(&self) -> PullPolicy {
        self.config.pull_policy
    }

    fn build_spec(&self, request: &SpawnRequest, name: &CanonicalName) -> Result<ObjectSpec> {
        let mut spec = base_spec(ObjectKind::Container, request, name, &self.config);
        spec.extra_host_config = self.config.extra_host_config.clone();
        stamp_generation(&mut spec);
        Ok(spec)
    }

    fn endpoint(&self, observed: &EngineObservation) -> Option<Endpoint> {
        container_endpoint(&self.config, observed)
    }
}
