//! Lifecycle of one user server: start, poll, stop and rebinding after a hub restart.

use crate::backend::{backend_for, ObjectBackend, Variant};
use crate::naming::{CanonicalName, NameResolver};
use crate::reconciler::{ReconcileOutcome, Reconciler};
use async_trait::async_trait;
use hubspawner_common::{
    Endpoint, EngineClient, EngineError, EngineObservation, ErrorKind, ExitStatus, LogStream,
    ManagedObject, MountSpec, NetworkSpec, ObjectStatus, PersistedState, Result, SpawnRequest,
    SpawnerConfig, SpawnerError, UserOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "kind")]
pub enum SpawnerState {
    Unconfigured,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error(ErrorKind),
}

/// The narrow surface a hub drives a spawner through.
#[async_trait]
pub trait HubSpawner: Send + Sync {
    async fn start(&self) -> Result<Endpoint>;

    /// `now` skips the graceful shutdown period.
    async fn stop(&self, now: bool) -> Result<()>;

    /// `None` while running, otherwise how the server ended.
    async fn poll(&self) -> Result<Option<ExitStatus>>;

    fn get_state(&self) -> PersistedState;

    /// Restore the object identity only. The state stays `Unconfigured` until
    /// the next `poll()` classifies it from a live observation.
    fn load_state(&self, state: PersistedState);

    fn clear_state(&self);
}

#[derive(Debug)]
struct Snapshot {
    state: SpawnerState,
    object: ManagedObject,
}

pub struct Spawner {
    user_id: String,
    server_name: String,
    config: Arc<SpawnerConfig>,
    resolver: NameResolver,
    backend: Arc<dyn ObjectBackend>,
    reconciler: Arc<Reconciler>,
    /// Serializes start/stop/poll on this spawner.
    lifecycle: Mutex<()>,
    snapshot: StdMutex<Snapshot>,
    user_options: StdMutex<UserOptions>,
    hub_env: StdMutex<BTreeMap<String, String>>,
}

impl Spawner {
    pub fn new(
        user_id: impl Into<String>,
        server_name: impl Into<String>,
        config: Arc<SpawnerConfig>,
        backend: Arc<dyn ObjectBackend>,
        reconciler: Arc<Reconciler>,
    ) -> Result<Self> {
        config.validate()?;
        let resolver = NameResolver::new(config.prefix.clone())?;
        let user_id = user_id.into();
        let server_name = server_name.into();
        let name = resolver.resolve_for(backend.kind(), &user_id, &server_name)?;
        let object = ManagedObject::absent(backend.kind(), name.name);
        Ok(Self {
            user_id,
            server_name,
            config,
            resolver,
            backend,
            reconciler,
            lifecycle: Mutex::new(()),
            snapshot: StdMutex::new(Snapshot {
                state: SpawnerState::Unconfigured,
                object,
            }),
            user_options: StdMutex::new(UserOptions::default()),
            hub_env: StdMutex::new(BTreeMap::new()),
        })
    }

    /// Spawner for `variant` on top of `engine`.
    pub fn for_variant(
        variant: Variant,
        user_id: impl Into<String>,
        server_name: impl Into<String>,
        config: Arc<SpawnerConfig>,
        engine: Arc<dyn EngineClient>,
        reconciler: Arc<Reconciler>,
    ) -> Result<Self> {
        let backend = backend_for(variant, engine, config.clone());
        Self::new(user_id, server_name, config, backend, reconciler)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn state(&self) -> SpawnerState {
        self.snapshot().state
    }

    pub fn object(&self) -> ManagedObject {
        self.snapshot().object.clone()
    }

    /// Connection target, only while running.
    pub fn endpoint(&self) -> Option<Endpoint> {
        let snapshot = self.snapshot();
        match snapshot.state {
            SpawnerState::Running => snapshot.object.endpoint.clone(),
            _ => None,
        }
    }

    /// Options from the hub's spawn form, applied on the next start.
    pub fn set_user_options(&self, options: UserOptions) {
        *lock(&self.user_options) = options;
    }

    /// Environment the hub injects (API token, URLs, ...), applied on the next start.
    pub fn set_environment(&self, env: BTreeMap<String, String>) {
        *lock(&self.hub_env) = env;
    }

    /// Restore persisted state and classify it against the engine right away.
    ///
    /// `load_state` alone leaves the spawner `Unconfigured` until the next
    /// `poll()`. This performs that poll, so the state is Running, Stopped
    /// or Error when it returns.
    pub async fn rebind(&self, state: PersistedState) -> Result<Option<ExitStatus>> {
        self.load_state(state);
        match self.poll().await {
            Ok(status) => Ok(status),
            Err(err) => {
                self.fail(&err, "rebind");
                Err(err)
            }
        }
    }

    pub fn canonical_name(&self) -> Result<CanonicalName> {
        self.resolver
            .resolve_for(self.backend.kind(), &self.user_id, &self.server_name)
    }

    /// Log stream of the current object.
    pub async fn logs(&self) -> Result<LogStream> {
        let target = {
            let snapshot = self.snapshot();
            snapshot
                .object
                .engine_object_id
                .clone()
                .unwrap_or_else(|| snapshot.object.name.clone())
        };
        Ok(self.backend.logs(&target).await?)
    }

    fn snapshot(&self) -> MutexGuard<'_, Snapshot> {
        lock(&self.snapshot)
    }

    fn set_state(&self, state: SpawnerState) {
        let mut snapshot = self.snapshot();
        if snapshot.state != state {
            debug!(user = %self.user_id, server = %self.server_name, from = ?snapshot.state, to = ?state, "State transition");
        }
        snapshot.state = state;
    }

    fn fail(&self, err: &SpawnerError, during: &str) {
        error!(user = %self.user_id, server = %self.server_name, error = %err, "{during} failed");
        let mut snapshot = self.snapshot();
        snapshot.state = SpawnerState::Error(err.kind());
        snapshot.object.status = ObjectStatus::Error;
        snapshot.object.endpoint = None;
    }

    fn build_request(&self) -> Result<SpawnRequest> {
        let options = lock(&self.user_options).clone();
        let image = match options.image {
            Some(image) if image != self.config.image => {
                if !self.config.allowed_images.contains(&image) {
                    return Err(SpawnerError::ImageNotAllowed { image });
                }
                image
            }
            _ => self.config.image.clone(),
        };

        let mut environment = self.config.environment.clone();
        environment.extend(lock(&self.hub_env).clone());
        environment.extend(options.environment);
        environment.insert("JUPYTERHUB_USER".to_string(), self.user_id.clone());
        environment.insert(
            "JUPYTERHUB_SERVER_NAME".to_string(),
            self.server_name.clone(),
        );

        let template = |t: &str| {
            self.resolver
                .format_template(t, &self.user_id, &self.server_name)
        };
        let mut mounts: Vec<MountSpec> = self
            .config
            .volumes
            .iter()
            .map(|(source, target)| MountSpec::new(template(source), template(target), false))
            .collect();
        mounts.extend(
            self.config
                .read_only_volumes
                .iter()
                .map(|(source, target)| MountSpec::new(template(source), template(target), true)),
        );

        Ok(SpawnRequest {
            user_id: self.user_id.clone(),
            server_name: self.server_name.clone(),
            image,
            resources: self.config.resources()?,
            environment,
            network: NetworkSpec {
                name: self.config.network_name.clone(),
                use_internal_ip: self.config.use_internal_ip,
            },
            mounts,
        })
    }

    async fn start_inner(&self) -> Result<Endpoint> {
        let request = self.build_request()?;
        let name = self.canonical_name()?;
        let mut spec = self.backend.build_spec(&request, &name)?;
        // an object we are already bound to keeps its name, even if the
        // prefix or naming changed since it was created
        let attached = {
            let snapshot = self.snapshot();
            let bound = snapshot.object.engine_object_id.is_some();
            bound.then(|| snapshot.object.name.clone())
        };
        if let Some(attached) = attached.filter(|n| !n.is_empty() && *n != spec.name) {
            info!(object = %attached, canonical = %spec.name, "Reusing the name of the attached object");
            spec.name = attached;
        }
        self.backend.prepare(&spec).await?;

        let outcome = self.reconciler.reconcile(self.backend.as_ref(), &spec).await?;
        {
            let mut snapshot = self.snapshot();
            snapshot.object.engine_object_id = Some(outcome.object_id.clone());
            snapshot.object.name = spec.name.clone();
            snapshot.object.status = ObjectStatus::Starting;
        }
        info!(object = %spec.name, object_id = %outcome.object_id, action = ?outcome.action, "Object reconciled, waiting for it to come up");

        match self.wait_ready(&spec.name, &outcome).await {
            Ok(endpoint) => Ok(endpoint),
            Err(err) => {
                if outcome.created {
                    if let Err(cleanup) = self.backend.remove(&outcome.object_id).await {
                        warn!(object_id = %outcome.object_id, error = %cleanup, "Could not remove object after failed start");
                    } else {
                        self.snapshot().object.engine_object_id = None;
                    }
                }
                Err(err)
            }
        }
    }

    async fn wait_ready(&self, name: &str, outcome: &ReconcileOutcome) -> Result<Endpoint> {
        let deadline = Instant::now() + self.config.start_timeout();
        loop {
            let observed = self
                .backend
                .inspect(&outcome.object_id)
                .await?
                .ok_or_else(|| {
                    EngineError::NotFound(format!("{name} disappeared while starting"))
                })?;

            if observed.running {
                if let Some(endpoint) = self.backend.endpoint(&observed) {
                    return Ok(endpoint);
                }
            } else if has_terminated(&observed) {
                let status = ExitStatus::from_observation(&observed);
                return Err(EngineError::Unknown(format!(
                    "{name} exited while starting: {status}"
                ))
                .into());
            }

            if Instant::now() >= deadline {
                return Err(SpawnerError::StartTimeout {
                    name: name.to_string(),
                    timeout_secs: self.config.start_timeout_secs,
                });
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Find the object when no id is known: by canonical name, then by owner labels.
    async fn recover(&self) -> Result<Option<EngineObservation>> {
        let name = self.canonical_name()?;
        if let Some(observed) = self.backend.inspect(&name.name).await? {
            return Ok(Some(observed));
        }
        let found = self.backend.find_by_labels(&name.selector()).await?;
        if let Some(observed) = &found {
            info!(object = %observed.name, object_id = %observed.id, "Recovered object by owner labels");
        }
        Ok(found)
    }

    async fn observe_current(&self) -> Result<Option<EngineObservation>> {
        let known_id = self.snapshot().object.engine_object_id.clone();
        match known_id {
            Some(id) => Ok(self.backend.inspect(&id).await?),
            None => self.recover().await,
        }
    }

    fn attach(&self, observed: &EngineObservation) {
        let mut snapshot = self.snapshot();
        snapshot.object.engine_object_id = Some(observed.id.clone());
        if !observed.name.is_empty() {
            snapshot.object.name = observed.name.clone();
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn has_terminated(observed: &EngineObservation) -> bool {
    observed.exit_code.is_some()
        || matches!(
            observed.status.as_str(),
            "exited" | "dead" | "complete" | "failed" | "rejected" | "shutdown" | "orphaned"
        )
}

#[async_trait]
impl HubSpawner for Spawner {
    #[instrument(skip(self), fields(user = %self.user_id, server = %self.server_name))]
    async fn start(&self) -> Result<Endpoint> {
        let _op = self.lifecycle.lock().await;
        self.set_state(SpawnerState::Starting);
        match self.start_inner().await {
            Ok(endpoint) => {
                {
                    let mut snapshot = self.snapshot();
                    snapshot.state = SpawnerState::Running;
                    snapshot.object.status = ObjectStatus::Running;
                    snapshot.object.endpoint = Some(endpoint.clone());
                }
                info!(%endpoint, "Server running");
                Ok(endpoint)
            }
            Err(err) => {
                self.fail(&err, "start");
                Err(err)
            }
        }
    }

    #[instrument(skip(self), fields(user = %self.user_id, server = %self.server_name))]
    async fn stop(&self, now: bool) -> Result<()> {
        let _op = self.lifecycle.lock().await;

        let known_id = self.snapshot().object.engine_object_id.clone();
        let target = match known_id {
            Some(id) => Some(id),
            None => match self.recover().await {
                Ok(found) => found.map(|obs| {
                    self.attach(&obs);
                    obs.id
                }),
                Err(err) => {
                    self.fail(&err, "stop");
                    return Err(err);
                }
            },
        };
        let Some(id) = target else {
            debug!("Nothing to stop");
            let mut snapshot = self.snapshot();
            snapshot.state = SpawnerState::Stopped;
            snapshot.object.endpoint = None;
            return Ok(());
        };

        self.set_state(SpawnerState::Stopping);
        let grace = if now {
            std::time::Duration::ZERO
        } else {
            self.config.stop_grace()
        };

        let mut removed = false;
        match self.backend.stop(&id, grace).await {
            Ok(()) => {}
            Err(EngineError::NotFound(_)) => {
                debug!(object_id = %id, "Object already gone");
                removed = true;
            }
            Err(err) => {
                let err = err.into();
                self.fail(&err, "stop");
                return Err(err);
            }
        }

        if self.config.remove && !removed {
            match self.backend.remove(&id).await {
                Ok(()) | Err(EngineError::NotFound(_)) => removed = true,
                Err(err) => {
                    let err = err.into();
                    self.fail(&err, "remove");
                    return Err(err);
                }
            }
        }

        let mut snapshot = self.snapshot();
        snapshot.state = SpawnerState::Stopped;
        snapshot.object.endpoint = None;
        if removed {
            snapshot.object.engine_object_id = None;
            snapshot.object.status = ObjectStatus::Removed;
        } else {
            snapshot.object.status = ObjectStatus::Stopped;
        }
        info!(object_id = %id, removed, "Server stopped");
        Ok(())
    }

    #[instrument(skip(self), fields(user = %self.user_id, server = %self.server_name))]
    async fn poll(&self) -> Result<Option<ExitStatus>> {
        let _op = self.lifecycle.lock().await;

        let observed = match self.observe_current().await {
            Ok(observed) => observed,
            Err(err) => {
                // a failed observation says nothing about the server
                warn!(user = %self.user_id, error = %err, "Poll could not reach the engine");
                return Err(err);
            }
        };

        let Some(observed) = observed else {
            let mut snapshot = self.snapshot();
            let name = snapshot.object.name.clone();
            snapshot.state = SpawnerState::Stopped;
            snapshot.object.engine_object_id = None;
            snapshot.object.status = ObjectStatus::Absent;
            snapshot.object.endpoint = None;
            return Ok(Some(ExitStatus::vanished(&name)));
        };
        self.attach(&observed);

        if observed.running {
            let endpoint = self.backend.endpoint(&observed);
            let mut snapshot = self.snapshot();
            snapshot.state = SpawnerState::Running;
            snapshot.object.status = ObjectStatus::Running;
            snapshot.object.endpoint = endpoint;
            return Ok(None);
        }

        let status = ExitStatus::from_observation(&observed);
        debug!(object = %observed.name, %status, "Server not running");
        let mut snapshot = self.snapshot();
        snapshot.state = SpawnerState::Stopped;
        snapshot.object.status = ObjectStatus::Stopped;
        snapshot.object.endpoint = None;
        Ok(Some(status))
    }

    fn get_state(&self) -> PersistedState {
        let snapshot = self.snapshot();
        match &snapshot.object.engine_object_id {
            Some(id) => PersistedState {
                object_id: Some(id.clone()),
                object_name: Some(snapshot.object.name.clone()),
                kind: Some(snapshot.object.kind),
            },
            None => PersistedState::default(),
        }
    }

    fn load_state(&self, state: PersistedState) {
        let mut snapshot = self.snapshot();
        if let Some(kind) = state.kind {
            if kind != snapshot.object.kind {
                warn!(persisted = %kind, configured = %snapshot.object.kind, "Persisted object kind differs from the configured variant, ignoring state");
                return;
            }
        }
        snapshot.object.engine_object_id = state.object_id;
        if let Some(name) = state.object_name {
            snapshot.object.name = name;
        }
        // the persisted status is never trusted; the next poll classifies
        snapshot.object.status = ObjectStatus::Absent;
        snapshot.object.endpoint = None;
    }

    fn clear_state(&self) {
        let mut snapshot = self.snapshot();
        snapshot.object.engine_object_id = None;
        snapshot.object.endpoint = None;
    }
}
