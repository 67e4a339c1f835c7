use super::{base_spec, stamp_generation, ObjectBackend, ReplacementPolicy};
use crate::docker::{is_node_local_network, LABEL_REPLICAS};
use crate::naming::CanonicalName;
use async_trait::async_trait;
use hubspawner_common::{
    Endpoint, EngineClient, EngineObservation, ObjectKind, ObjectSpec, PullPolicy, Result,
    SpawnRequest, SpawnerConfig,
};
use std::sync::Arc;
use tracing::debug;

/// A replicated swarm service with a single task per user server.
pub struct SwarmBackend {
    engine: Arc<dyn EngineClient>,
    config: Arc<SpawnerConfig>,
}

impl SwarmBackend {
    pub fn new(engine: Arc<dyn EngineClient>, config: Arc<SpawnerConfig>) -> Self {
        Self { engine, config }
    }
}

#[async_trait]
impl ObjectBackend for SwarmBackend {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Service
    }

    fn engine(&self) -> &dyn EngineClient {
        self.engine.as_ref()
    }

    fn policy(&self) -> ReplacementPolicy {
        ReplacementPolicy::from_config(&self.config)
    }

    fn pull_policy(&self) -> PullPolicy {
        // nodes pull for themselves when the task is scheduled
        match self.config.pull_policy {
            PullPolicy::IfNotPresent => PullPolicy::Skip,
            other => other,
        }
    }

    fn build_spec(&self, request: &SpawnRequest, name: &CanonicalName) -> Result<ObjectSpec> {
        if is_node_local_network(&request.network.name) {
            debug!(network = %request.network.name, "Node-local network, service uses the default attachment");
        }
        let mut spec = base_spec(ObjectKind::Service, request, name, &self.config);
        spec.replicas = 1;
        // tasks are reached at their own address, never through host ports
        spec.network.use_internal_ip = true;
        spec.labels
            .insert(LABEL_REPLICAS.to_string(), spec.replicas.to_string());
        stamp_generation(&mut spec);
        Ok(spec)
    }

    fn endpoint(&self, observed: &EngineObservation) -> Option<Endpoint> {
        if !observed.running {
            return None;
        }
        observed.ip_address.clone().map(|ip| Endpoint {
            ip,
            port: self.config.port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::request;
    use crate::naming::NameResolver;
    use crate::testing::MemoryEngine;

    fn backend() -> SwarmBackend {
        let config = Arc::new(SpawnerConfig {
            network_name: "hub-overlay".to_string(),
            ..Default::default()
        });
        SwarmBackend::new(Arc::new(MemoryEngine::new()), config)
    }

    #[test]
    fn spec_is_a_single_replica_service() {
        let name = NameResolver::new("hub").unwrap().resolve("alice", "gpu").unwrap();
        let mut req = request("alice");
        req.network.name = "hub-overlay".to_string();
        let spec = backend().build_spec(&req, &name).unwrap();
        assert_eq!(spec.kind, ObjectKind::Service);
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.labels[LABEL_REPLICAS], "1");
        assert!(spec.network.use_internal_ip);
        assert_eq!(spec.network.name, "hub-overlay");
    }

    #[test]
    fn bridge_network_is_accepted() {
        let name = NameResolver::new("hub").unwrap().resolve("alice", "").unwrap();
        let spec = backend().build_spec(&request("alice"), &name).unwrap();
        assert_eq!(spec.network.name, "bridge");
        assert!(spec.network.use_internal_ip);
    }

    #[test]
    fn endpoint_is_task_address() {
        let obs = EngineObservation {
            running: true,
            ip_address: Some("10.0.1.7".to_string()),
            ..Default::default()
        };
        assert_eq!(backend().endpoint(&obs).unwrap().to_string(), "10.0.1.7:8888");
        assert_eq!(backend().pull_policy(), PullPolicy::Skip);
    }
}
