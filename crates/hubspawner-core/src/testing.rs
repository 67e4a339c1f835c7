//! In-memory [`EngineClient`] for exercising spawners without a Docker daemon.
//!
//! Keeps per-operation call counters, can inject failures into the next N
//! calls of an operation and can add latency to every call so that
//! concurrent callers genuinely interleave.

use async_trait::async_trait;
use futures::stream;
use hubspawner_common::{
    EngineClient, EngineError, EngineObservation, EngineResult, LogStream, ObjectKind, ObjectSpec,
    PullPolicy, ResourceLimits,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Start,
    Stop,
    Remove,
    Inspect,
    List,
    Logs,
    Update,
    Pull,
}

#[derive(Debug, Clone)]
struct MemoryObject {
    id: String,
    spec: ObjectSpec,
    running: bool,
    status: String,
    exit_code: Option<i64>,
    ip_address: Option<String>,
    host_port: Option<u16>,
    resources: ResourceLimits,
    logs: Vec<Vec<u8>>,
}

impl MemoryObject {
    fn observe(&self) -> EngineObservation {
        EngineObservation {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            kind: Some(self.spec.kind),
            running: self.running,
            status: self.status.clone(),
            exit_code: self.exit_code,
            error: None,
            ip_address: self.ip_address.clone(),
            host_port: self.host_port,
            labels: self.spec.labels.clone(),
            image: Some(self.spec.image.clone()),
            resources: self.resources,
        }
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, MemoryObject>,
    failures: HashMap<Op, VecDeque<EngineError>>,
    calls: HashMap<Op, usize>,
    images: HashSet<String>,
    unpullable: HashSet<String>,
    latency: Duration,
    crash_on_start: Option<i64>,
    stall_on_start: bool,
    next_address: u32,
}

#[derive(Default)]
pub struct MemoryEngine {
    state: Mutex<State>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // a panicking test thread must not hide the engine from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next call of `op` fail with `error`. Queued errors are used in order.
    pub fn fail_next(&self, op: Op, error: EngineError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// Delay applied to every call before it touches state.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Objects exit with `code` right after being started.
    pub fn crash_on_start(&self, code: Option<i64>) {
        self.lock().crash_on_start = code;
    }

    /// Started objects stay in `restarting` and never become reachable.
    pub fn stall_on_start(&self, stall: bool) {
        self.lock().stall_on_start = stall;
    }

    pub fn add_image(&self, image: &str) {
        self.lock().images.insert(image.to_string());
    }

    pub fn mark_unpullable(&self, image: &str) {
        self.lock().unpullable.insert(image.to_string());
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.lock().images.contains(image)
    }

    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn observations(&self) -> Vec<EngineObservation> {
        self.lock().objects.values().map(MemoryObject::observe).collect()
    }

    /// Observation by id or name without counting as an engine call.
    pub fn peek(&self, id_or_name: &str) -> Option<EngineObservation> {
        let state = self.lock();
        find(&state, id_or_name).map(|id| state.objects[&id].observe())
    }

    /// Simulate the workload exiting on its own.
    pub fn exit(&self, id_or_name: &str, code: i64) {
        let mut state = self.lock();
        if let Some(id) = find(&state, id_or_name) {
            if let Some(obj) = state.objects.get_mut(&id) {
                obj.running = false;
                obj.status = "exited".to_string();
                obj.exit_code = Some(code);
            }
        }
    }

    /// Simulate someone removing the object behind the spawner's back.
    pub fn vanish(&self, id_or_name: &str) {
        let mut state = self.lock();
        if let Some(id) = find(&state, id_or_name) {
            state.objects.remove(&id);
        }
    }

    pub fn push_log(&self, id_or_name: &str, chunk: &[u8]) {
        let mut state = self.lock();
        if let Some(id) = find(&state, id_or_name) {
            if let Some(obj) = state.objects.get_mut(&id) {
                obj.logs.push(chunk.to_vec());
            }
        }
    }

    async fn enter(&self, op: Op) -> EngineResult<()> {
        let latency = {
            let mut state = self.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            state.latency
        };
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        match state.failures.get_mut(&op).and_then(|queue| queue.pop_front()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn find(state: &State, id_or_name: &str) -> Option<String> {
    if state.objects.contains_key(id_or_name) {
        return Some(id_or_name.to_string());
    }
    state
        .objects
        .values()
        .find(|o| o.spec.name == id_or_name)
        .map(|o| o.id.clone())
}

fn not_found(kind: ObjectKind, id: &str) -> EngineError {
    EngineError::NotFound(format!("no such {kind}: {id}"))
}

#[async_trait]
impl EngineClient for MemoryEngine {
    async fn create(&self, spec: &ObjectSpec) -> EngineResult<String> {
        self.enter(Op::Create).await?;
        let mut state = self.lock();
        if state.objects.values().any(|o| o.spec.name == spec.name) {
            return Err(EngineError::Conflict(format!(
                "name {} is already in use",
                spec.name
            )));
        }
        state.next_address += 1;
        let n = state.next_address;
        let id = Uuid::new_v4().simple().to_string();
        let host_port = (!spec.network.use_internal_ip).then(|| 49152 + n as u16);
        state.objects.insert(
            id.clone(),
            MemoryObject {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                status: "created".to_string(),
                exit_code: None,
                ip_address: None,
                host_port,
                resources: spec.resources,
                logs: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn start(&self, kind: ObjectKind, id: &str) -> EngineResult<()> {
        self.enter(Op::Start).await?;
        let mut state = self.lock();
        let crash = state.crash_on_start;
        let stall = state.stall_on_start;
        let key = find(&state, id).ok_or_else(|| not_found(kind, id))?;
        let obj = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| not_found(kind, id))?;
        if obj.running {
            return Ok(());
        }
        let octet = obj.host_port.map(|p| p - 49152).unwrap_or(1) % 250 + 2;
        obj.logs.push(format!("starting {}\n", obj.spec.name).into_bytes());
        if stall {
            obj.status = "restarting".to_string();
            return Ok(());
        }
        match crash {
            Some(code) => {
                obj.running = false;
                obj.status = "exited".to_string();
                obj.exit_code = Some(code);
            }
            None => {
                obj.running = true;
                obj.status = "running".to_string();
                obj.exit_code = None;
                obj.ip_address = Some(format!("172.17.0.{octet}"));
            }
        }
        Ok(())
    }

    async fn stop(&self, kind: ObjectKind, id: &str, _grace: Duration) -> EngineResult<()> {
        self.enter(Op::Stop).await?;
        let mut state = self.lock();
        let key = find(&state, id).ok_or_else(|| not_found(kind, id))?;
        let obj = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| not_found(kind, id))?;
        if obj.running {
            obj.running = false;
            obj.ip_address = None;
            match kind {
                ObjectKind::Container => {
                    obj.status = "exited".to_string();
                    obj.exit_code = Some(0);
                }
                ObjectKind::Service => obj.status = "scaled-down".to_string(),
            }
        }
        Ok(())
    }

    async fn remove(&self, kind: ObjectKind, id: &str, force: bool) -> EngineResult<()> {
        self.enter(Op::Remove).await?;
        let mut state = self.lock();
        let key = find(&state, id).ok_or_else(|| not_found(kind, id))?;
        if state.objects[&key].running && !force && kind == ObjectKind::Container {
            return Err(EngineError::Conflict(format!(
                "cannot remove running container {id}"
            )));
        }
        state.objects.remove(&key);
        Ok(())
    }

    async fn inspect(&self, kind: ObjectKind, id_or_name: &str) -> EngineResult<EngineObservation> {
        self.enter(Op::Inspect).await?;
        let state = self.lock();
        find(&state, id_or_name)
            .and_then(|id| state.objects.get(&id))
            .filter(|o| o.spec.kind == kind)
            .map(MemoryObject::observe)
            .ok_or_else(|| not_found(kind, id_or_name))
    }

    async fn list_by_label(
        &self,
        kind: ObjectKind,
        labels: &BTreeMap<String, String>,
    ) -> EngineResult<Vec<EngineObservation>> {
        self.enter(Op::List).await?;
        let state = self.lock();
        Ok(state
            .objects
            .values()
            .filter(|o| o.spec.kind == kind)
            .filter(|o| labels.iter().all(|(k, v)| o.spec.labels.get(k) == Some(v)))
            .map(MemoryObject::observe)
            .collect())
    }

    async fn logs(&self, kind: ObjectKind, id: &str) -> EngineResult<LogStream> {
        self.enter(Op::Logs).await?;
        let state = self.lock();
        let key = find(&state, id).ok_or_else(|| not_found(kind, id))?;
        let chunks: Vec<EngineResult<Vec<u8>>> =
            state.objects[&key].logs.iter().cloned().map(Ok).collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn update_resources(
        &self,
        kind: ObjectKind,
        id: &str,
        limits: &ResourceLimits,
    ) -> EngineResult<()> {
        self.enter(Op::Update).await?;
        let mut state = self.lock();
        let key = find(&state, id).ok_or_else(|| not_found(kind, id))?;
        if let Some(obj) = state.objects.get_mut(&key) {
            obj.resources = *limits;
        }
        Ok(())
    }

    async fn ensure_image(&self, image: &str, policy: PullPolicy) -> EngineResult<()> {
        let present = self.has_image(image);
        let pull = match policy {
            PullPolicy::Skip => false,
            PullPolicy::Always => true,
            PullPolicy::IfNotPresent => !present,
            PullPolicy::Never if present => false,
            PullPolicy::Never => {
                return Err(EngineError::NotFound(format!(
                    "image {image} is not present and pull policy is never"
                )))
            }
        };
        if !pull {
            return Ok(());
        }
        self.enter(Op::Pull).await?;
        let mut state = self.lock();
        if state.unpullable.contains(image) {
            return Err(EngineError::NotFound(format!("manifest for {image} not found")));
        }
        state.images.insert(image.to_string());
        Ok(())
    }
}
