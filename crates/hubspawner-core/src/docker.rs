//! Docker Engine adapter: containers and swarm services behind [`EngineClient`].

use crate::bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UpdateContainerOptions,
};
use crate::bollard::errors::Error as BollardError;
use crate::bollard::image::CreateImageOptions;
use crate::bollard::models::{
    ContainerInspectResponse, HostConfig, Limit, Mount, MountTypeEnum, NetworkAttachmentConfig,
    PortBinding, Service, ServiceSpec, ServiceSpecMode, ServiceSpecModeReplicated, Task, TaskSpec,
    TaskSpecContainerSpec, TaskSpecResources, TaskSpecRestartPolicy,
    TaskSpecRestartPolicyConditionEnum, TaskState,
};
use crate::bollard::service::{ListServicesOptions, UpdateServiceOptions};
use crate::bollard::task::ListTasksOptions;
use crate::bollard::Docker;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use hubspawner_common::{
    EngineClient, EngineError, EngineObservation, EngineResult, LogStream, MountKind, ObjectKind,
    ObjectSpec, PullPolicy, ResourceLimits,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Label carrying the replica count a service is scaled back to on start.
pub const LABEL_REPLICAS: &str = "hubspawner.replicas";
/// Label naming the network whose address is reported for the object.
pub const LABEL_NETWORK: &str = "hubspawner.gen.network";

#[derive(Clone)]
pub struct DockerEngine {
    docker: Arc<Docker>,
}

impl DockerEngine {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }

    /// Connect over `DOCKER_HOST` or the platform default socket.
    pub fn connect() -> EngineResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| map_docker_error(e, "connect"))?;
        Ok(Self::new(Arc::new(docker)))
    }

    pub fn client(&self) -> &Docker {
        &self.docker
    }

    // --- containers ---

    async fn create_container(&self, spec: &ObjectSpec) -> EngineResult<String> {
        let config = container_config(spec)?;
        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        });
        let response = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| map_docker_error(e, &format!("create container {}", spec.name)))?;
        for warning in &response.warnings {
            warn!(container = %spec.name, %warning, "Engine warning on create");
        }
        Ok(response.id)
    }

    async fn inspect_container(&self, id_or_name: &str) -> EngineResult<EngineObservation> {
        let info = self
            .docker
            .inspect_container(id_or_name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_docker_error(e, &format!("inspect container {id_or_name}")))?;
        Ok(container_observation(info))
    }

    async fn list_containers(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> EngineResult<Vec<EngineObservation>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("label".to_string(), label_filters(labels));
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_docker_error(e, "list containers"))?;

        let mut observations = Vec::with_capacity(summaries.len());
        for id in summaries.into_iter().filter_map(|c| c.id) {
            match self.inspect_container(&id).await {
                Ok(obs) => observations.push(obs),
                // removed between list and inspect
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(observations)
    }

    // --- services ---

    async fn create_service(&self, spec: &ObjectSpec) -> EngineResult<String> {
        let service_spec = service_spec(spec);
        let response = self
            .docker
            .create_service(service_spec, None)
            .await
            .map_err(|e| map_docker_error(e, &format!("create service {}", spec.name)))?;
        Ok(response.id.unwrap_or_else(|| spec.name.clone()))
    }

    async fn inspect_service_raw(&self, id_or_name: &str) -> EngineResult<Service> {
        self.docker
            .inspect_service(id_or_name, None::<crate::bollard::query_parameters::InspectServiceOptions>)
            .await
            .map_err(|e| map_docker_error(e, &format!("inspect service {id_or_name}")))
    }

    async fn service_tasks(&self, service_id: &str) -> EngineResult<Vec<Task>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("service".to_string(), vec![service_id.to_string()]);
        self.docker
            .list_tasks(Some(ListTasksOptions { filters }))
            .await
            .map_err(|e| map_docker_error(e, &format!("list tasks of {service_id}")))
    }

    async fn observe_service(&self, service: Service) -> EngineResult<EngineObservation> {
        let id = service.id.clone().unwrap_or_default();
        let spec = service.spec.clone().unwrap_or_default();
        let name = spec.name.clone().unwrap_or_default();
        let labels: BTreeMap<String, String> =
            spec.labels.clone().unwrap_or_default().into_iter().collect();
        let replicas = desired_replicas(&spec);
        let limits = spec
            .task_template
            .as_ref()
            .and_then(|t| t.resources.as_ref())
            .and_then(|r| r.limits.as_ref());
        let image = spec
            .task_template
            .as_ref()
            .and_then(|t| t.container_spec.as_ref())
            .and_then(|c| c.image.as_deref())
            // swarm pins the digest: `image:tag@sha256:...`
            .map(|image| image.split('@').next().unwrap_or(image).to_string());

        let mut obs = EngineObservation {
            id: id.clone(),
            name: name.clone(),
            kind: Some(ObjectKind::Service),
            labels,
            image,
            resources: ResourceLimits {
                memory_bytes: limits.and_then(|l| l.memory_bytes),
                nano_cpus: limits.and_then(|l| l.nano_cpus),
            },
            ..Default::default()
        };

        if replicas == 0 {
            obs.status = "scaled-down".to_string();
            return Ok(obs);
        }

        let tasks = self.service_tasks(&id).await?;
        let Some(task) = current_task(tasks) else {
            obs.status = "pending".to_string();
            return Ok(obs);
        };
        let status = task.status.unwrap_or_default();
        obs.running = matches!(status.state, Some(TaskState::RUNNING));
        obs.status = status
            .state
            .map(|s| format!("{s:?}").to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());
        obs.error = status.err;
        let container_id = status.container_status.as_ref().and_then(|c| c.container_id.clone());
        obs.exit_code = status.container_status.and_then(|c| c.exit_code);

        if obs.running {
            // Task containers on this node expose their overlay address;
            // elsewhere the service name resolves through swarm DNS.
            obs.ip_address = match container_id {
                Some(cid) => match self.inspect_container(&cid).await {
                    Ok(c) => c.ip_address,
                    Err(EngineError::NotFound(_)) => None,
                    Err(e) => return Err(e),
                },
                None => None,
            }
            .or_else(|| Some(name.clone()));
        }
        Ok(obs)
    }

    async fn scale_service(&self, id: &str, replicas: Option<u64>, force: bool) -> EngineResult<()> {
        let service = self.inspect_service_raw(id).await?;
        let version = service.version.as_ref().and_then(|v| v.index).unwrap_or_default();
        let mut spec = service.spec.unwrap_or_default();
        let target = match replicas {
            Some(n) => n,
            None => spec
                .labels
                .as_ref()
                .and_then(|l| l.get(LABEL_REPLICAS))
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
        };
        spec.mode = Some(ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated {
                replicas: Some(target as i64),
            }),
            ..Default::default()
        });
        if force && target > 0 {
            // a fresh task even though the replica count is unchanged
            if let Some(template) = spec.task_template.as_mut() {
                template.force_update = Some(template.force_update.unwrap_or(0) + 1);
            }
        }
        self.docker
            .update_service(
                id,
                spec,
                UpdateServiceOptions {
                    version,
                    ..Default::default()
                },
                None,
            )
            .await
            .map_err(|e| map_docker_error(e, &format!("scale service {id} to {target}")))?;
        debug!(service = %id, replicas = target, "Service scaled");
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        let (repo, tag) = split_image(image);
        info!(%image, "Pulling image");
        let options = CreateImageOptions {
            from_image: repo.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(|e| map_docker_error(e, &format!("pull {image}")))?;
            if let Some(status) = info.status {
                debug!(%image, %status, "Pull progress");
            }
        }
        info!(%image, "Image pulled");
        Ok(())
    }
}

#[async_trait]
impl EngineClient for DockerEngine {
    #[instrument(skip(self, spec), fields(name = %spec.name, kind = %spec.kind))]
    async fn create(&self, spec: &ObjectSpec) -> EngineResult<String> {
        match spec.kind {
            ObjectKind::Container => self.create_container(spec).await,
            ObjectKind::Service => self.create_service(spec).await,
        }
    }

    async fn start(&self, kind: ObjectKind, id: &str) -> EngineResult<()> {
        match kind {
            ObjectKind::Container => {
                match self
                    .docker
                    .start_container(id, None::<StartContainerOptions<String>>)
                    .await
                {
                    Ok(()) => Ok(()),
                    // already running
                    Err(BollardError::DockerResponseServerError {
                        status_code: 304, ..
                    }) => Ok(()),
                    Err(e) => Err(map_docker_error(e, &format!("start container {id}"))),
                }
            }
            ObjectKind::Service => {
                let obs = self.inspect(ObjectKind::Service, id).await?;
                match service_start_action(&obs.status) {
                    ServiceStart::Leave => {
                        debug!(service = %id, status = %obs.status, "Service task already live");
                        Ok(())
                    }
                    ServiceStart::ScaleUp => self.scale_service(id, None, false).await,
                    ServiceStart::Redeploy => self.scale_service(id, None, true).await,
                }
            }
        }
    }

    async fn stop(&self, kind: ObjectKind, id: &str, grace: Duration) -> EngineResult<()> {
        match kind {
            ObjectKind::Container => {
                let options = StopContainerOptions {
                    t: grace.as_secs() as i64,
                };
                match self.docker.stop_container(id, Some(options)).await {
                    Ok(()) => Ok(()),
                    // already stopped
                    Err(BollardError::DockerResponseServerError {
                        status_code: 304, ..
                    }) => Ok(()),
                    Err(e) => Err(map_docker_error(e, &format!("stop container {id}"))),
                }
            }
            ObjectKind::Service => self.scale_service(id, Some(0), false).await,
        }
    }

    async fn remove(&self, kind: ObjectKind, id: &str, force: bool) -> EngineResult<()> {
        match kind {
            ObjectKind::Container => {
                let options = RemoveContainerOptions {
                    force,
                    ..Default::default()
                };
                self.docker
                    .remove_container(id, Some(options))
                    .await
                    .map_err(|e| map_docker_error(e, &format!("remove container {id}")))
            }
            ObjectKind::Service => self
                .docker
                .delete_service(id)
                .await
                .map_err(|e| map_docker_error(e, &format!("remove service {id}"))),
        }
    }

    async fn inspect(&self, kind: ObjectKind, id_or_name: &str) -> EngineResult<EngineObservation> {
        match kind {
            ObjectKind::Container => self.inspect_container(id_or_name).await,
            ObjectKind::Service => {
                let service = self.inspect_service_raw(id_or_name).await?;
                self.observe_service(service).await
            }
        }
    }

    async fn list_by_label(
        &self,
        kind: ObjectKind,
        labels: &BTreeMap<String, String>,
    ) -> EngineResult<Vec<EngineObservation>> {
        match kind {
            ObjectKind::Container => self.list_containers(labels).await,
            ObjectKind::Service => {
                let mut filters: HashMap<String, Vec<String>> = HashMap::new();
                filters.insert("label".to_string(), label_filters(labels));
                let services = self
                    .docker
                    .list_services(Some(ListServicesOptions {
                        filters,
                        ..Default::default()
                    }))
                    .await
                    .map_err(|e| map_docker_error(e, "list services"))?;
                let mut observations = Vec::with_capacity(services.len());
                for service in services {
                    observations.push(self.observe_service(service).await?);
                }
                Ok(observations)
            }
        }
    }

    async fn logs(&self, kind: ObjectKind, id: &str) -> EngineResult<LogStream> {
        let container_id = match kind {
            ObjectKind::Container => id.to_string(),
            ObjectKind::Service => {
                let tasks = self.service_tasks(id).await?;
                current_task(tasks)
                    .and_then(|t| t.status)
                    .and_then(|s| s.container_status)
                    .and_then(|c| c.container_id)
                    .ok_or_else(|| EngineError::NotFound(format!("no task container for {id}")))?
            }
        };
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };
        let context = format!("logs of {container_id}");
        let stream = self
            .docker
            .logs(&container_id, Some(options))
            .map_ok(|output| match output {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => message.to_vec(),
                LogOutput::StdIn { .. } => Vec::new(),
            })
            .map_err(move |e| map_docker_error(e, &context));
        Ok(Box::pin(stream))
    }

    async fn update_resources(
        &self,
        kind: ObjectKind,
        id: &str,
        limits: &ResourceLimits,
    ) -> EngineResult<()> {
        match kind {
            ObjectKind::Container => {
                let options = UpdateContainerOptions::<String> {
                    memory: limits.memory_bytes,
                    // keep swap from capping the new memory limit
                    memory_swap: limits.memory_bytes.map(|_| -1),
                    nano_cpus: limits.nano_cpus,
                    ..Default::default()
                };
                self.docker
                    .update_container(id, options)
                    .await
                    .map_err(|e| map_docker_error(e, &format!("update container {id}")))
            }
            ObjectKind::Service => {
                let service = self.inspect_service_raw(id).await?;
                let version = service.version.as_ref().and_then(|v| v.index).unwrap_or_default();
                let mut spec = service.spec.unwrap_or_default();
                let template = spec.task_template.get_or_insert_with(TaskSpec::default);
                template.resources = Some(task_resources(limits));
                self.docker
                    .update_service(
                        id,
                        spec,
                        UpdateServiceOptions {
                            version,
                            ..Default::default()
                        },
                        None,
                    )
                    .await
                    .map_err(|e| map_docker_error(e, &format!("update service {id}")))?;
                Ok(())
            }
        }
    }

    async fn ensure_image(&self, image: &str, policy: PullPolicy) -> EngineResult<()> {
        if policy == PullPolicy::Skip {
            return Ok(());
        }
        if policy == PullPolicy::Always {
            return self.pull_image(image).await;
        }
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => match policy {
                PullPolicy::Never => Err(EngineError::NotFound(format!(
                    "image {image} is not present and pull policy is never"
                ))),
                _ => self.pull_image(image).await,
            },
            Err(e) => Err(map_docker_error(e, &format!("inspect image {image}"))),
        }
    }
}

/// Normalize a bollard error into the engine taxonomy.
pub fn map_docker_error(err: BollardError, context: &str) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => EngineError::NotFound(format!("{context}: {message}")),
            409 => EngineError::Conflict(format!("{context}: {message}")),
            401 | 403 => EngineError::Forbidden(format!("{context}: {message}")),
            502..=504 => EngineError::Unavailable(format!("{context}: {message}")),
            _ => EngineError::Unknown(format!("{context}: HTTP {status_code}: {message}")),
        },
        BollardError::RequestTimeoutError => {
            EngineError::Unavailable(format!("{context}: request timed out"))
        }
        err @ (BollardError::IOError { .. }
        | BollardError::HyperResponseError { .. }
        | BollardError::SocketNotFoundError(_)) => {
            EngineError::Unavailable(format!("{context}: {err}"))
        }
        other => EngineError::Unknown(format!("{context}: {other}")),
    }
}

fn label_filters(labels: &BTreeMap<String, String>) -> Vec<String> {
    labels.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

fn container_config(spec: &ObjectSpec) -> EngineResult<ContainerConfig<String>> {
    let port_key = format!("{}/tcp", spec.port);
    let mut host_config = HostConfig {
        network_mode: Some(spec.network.name.clone()),
        binds: Some(spec.mounts.iter().map(|m| m.to_bind()).collect()),
        memory: spec.resources.memory_bytes,
        nano_cpus: spec.resources.nano_cpus,
        ..Default::default()
    };
    if !spec.network.use_internal_ip {
        let mut bindings = HashMap::new();
        bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some(spec.host_ip.clone()),
                // engine picks a free port
                host_port: Some(String::new()),
            }]),
        );
        host_config.port_bindings = Some(bindings);
    }
    let host_config = merge_host_config(host_config, &spec.extra_host_config)?;

    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(port_key, HashMap::new());

    Ok(ContainerConfig {
        image: Some(spec.image.clone()),
        cmd: spec.command.clone(),
        env: Some(spec.env_list()),
        labels: Some(spec.labels.clone().into_iter().collect()),
        user: spec.user.clone(),
        working_dir: spec.working_dir.clone(),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    })
}

/// Overlay user-supplied `HostConfig` fields. Keys may use the API's
/// `PascalCase` or `snake_case` (`shm_size` -> `ShmSize`).
pub fn merge_host_config(
    base: HostConfig,
    extra: &serde_json::Map<String, serde_json::Value>,
) -> EngineResult<HostConfig> {
    if extra.is_empty() {
        return Ok(base);
    }
    let mut value = serde_json::to_value(&base)
        .map_err(|e| EngineError::Unknown(format!("serialize host config: {e}")))?;
    if let Some(object) = value.as_object_mut() {
        for (key, extra_value) in extra {
            object.insert(api_key(key), extra_value.clone());
        }
    }
    serde_json::from_value(value)
        .map_err(|e| EngineError::Unknown(format!("invalid extra_host_config: {e}")))
}

fn api_key(key: &str) -> String {
    if !key.contains('_') {
        let mut chars = key.chars();
        return match chars.next() {
            Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
            None => String::new(),
        };
    }
    key.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

fn container_observation(info: ContainerInspectResponse) -> EngineObservation {
    let state = info.state.unwrap_or_default();
    let config = info.config.unwrap_or_default();
    let host_config = info.host_config.unwrap_or_default();
    let labels: BTreeMap<String, String> =
        config.labels.unwrap_or_default().into_iter().collect();
    let network_settings = info.network_settings.unwrap_or_default();

    let networks = network_settings.networks.unwrap_or_default();
    let preferred = labels.get(LABEL_NETWORK).and_then(|n| networks.get(n));
    let ip_address = preferred
        .and_then(|ep| ep.ip_address.clone())
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            networks
                .values()
                .filter_map(|ep| ep.ip_address.clone())
                .find(|ip| !ip.is_empty())
        })
        .or(network_settings.ip_address)
        .filter(|ip| !ip.is_empty());

    let host_port = network_settings
        .ports
        .unwrap_or_default()
        .into_values()
        .flatten()
        .flatten()
        .find_map(|binding| binding.host_port.and_then(|p| p.parse::<u16>().ok()));

    EngineObservation {
        id: info.id.unwrap_or_default(),
        name: info
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        kind: Some(ObjectKind::Container),
        running: state.running.unwrap_or(false),
        status: state
            .status
            .map(|s| format!("{s:?}").to_lowercase())
            .unwrap_or_else(|| "unknown".to_string()),
        exit_code: state.exit_code,
        error: state.error.filter(|e| !e.is_empty()),
        ip_address,
        host_port,
        labels,
        image: config.image,
        resources: ResourceLimits {
            memory_bytes: host_config.memory.filter(|m| *m > 0),
            nano_cpus: host_config.nano_cpus.filter(|c| *c > 0),
        },
    }
}

fn task_resources(limits: &ResourceLimits) -> TaskSpecResources {
    TaskSpecResources {
        limits: Some(Limit {
            nano_cpus: limits.nano_cpus,
            memory_bytes: limits.memory_bytes,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Networks scoped to one daemon, which a swarm service cannot join by name.
pub fn is_node_local_network(name: &str) -> bool {
    matches!(name, "" | "bridge" | "host" | "none" | "default")
}

fn service_spec(spec: &ObjectSpec) -> ServiceSpec {
    let labels: HashMap<String, String> = spec.labels.clone().into_iter().collect();
    let mounts = spec
        .mounts
        .iter()
        .map(|m| Mount {
            target: Some(m.target.clone()),
            source: Some(m.source.clone()),
            typ: Some(match m.kind {
                MountKind::Bind => MountTypeEnum::BIND,
                MountKind::Volume => MountTypeEnum::VOLUME,
            }),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect();

    ServiceSpec {
        name: Some(spec.name.clone()),
        labels: Some(labels.clone()),
        task_template: Some(TaskSpec {
            container_spec: Some(TaskSpecContainerSpec {
                image: Some(spec.image.clone()),
                labels: Some(labels),
                command: spec.command.clone(),
                env: Some(spec.env_list()),
                user: spec.user.clone(),
                dir: spec.working_dir.clone(),
                mounts: Some(mounts),
                ..Default::default()
            }),
            resources: Some(task_resources(&spec.resources)),
            // an exited notebook stays exited so poll() can report it
            restart_policy: Some(TaskSpecRestartPolicy {
                condition: Some(TaskSpecRestartPolicyConditionEnum::NONE),
                ..Default::default()
            }),
            // node-local networks cannot be attached; tasks get the default attachment
            networks: (!is_node_local_network(&spec.network.name)).then(|| {
                vec![NetworkAttachmentConfig {
                    target: Some(spec.network.name.clone()),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }),
        mode: Some(ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated {
                replicas: Some(spec.replicas as i64),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn desired_replicas(spec: &ServiceSpec) -> i64 {
    spec.mode
        .as_ref()
        .and_then(|m| m.replicated.as_ref())
        .and_then(|r| r.replicas)
        .unwrap_or(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceStart {
    /// A task is running or still on its way up.
    Leave,
    /// Scaled to zero by a stop.
    ScaleUp,
    /// The last task finished; only a forced update schedules another.
    Redeploy,
}

fn service_start_action(status: &str) -> ServiceStart {
    match status {
        "scaled-down" => ServiceStart::ScaleUp,
        "complete" | "failed" | "shutdown" | "rejected" | "orphaned" | "remove" => {
            ServiceStart::Redeploy
        }
        _ => ServiceStart::Leave,
    }
}

/// The running task if there is one, otherwise the most recently updated.
fn current_task(tasks: Vec<Task>) -> Option<Task> {
    let version = |t: &Task| t.version.as_ref().and_then(|v| v.index).unwrap_or(0);
    let (running, others): (Vec<Task>, Vec<Task>) = tasks.into_iter().partition(|t| {
        matches!(
            t.status.as_ref().and_then(|s| s.state.as_ref()),
            Some(TaskState::RUNNING)
        )
    });
    running
        .into_iter()
        .max_by_key(version)
        .or_else(|| others.into_iter().max_by_key(version))
}

/// `repo[:tag][@digest]` -> (`repo`, `tag`), defaulting the tag to `latest`.
pub fn split_image(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    // a colon after the last slash separates the tag; earlier ones are a registry port
    let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_slash..].rfind(':') {
        Some(pos) => {
            let split = last_slash + pos;
            (&image[..split], &image[split + 1..])
        }
        None => (image, "latest"),
    }
}
