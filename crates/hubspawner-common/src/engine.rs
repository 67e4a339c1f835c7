use crate::{EngineObservation, EngineResult, ObjectKind, ObjectSpec, PullPolicy, ResourceLimits};
use async_trait::async_trait;
use futures::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

/// Raw log chunks (stdout and stderr interleaved) as the engine returns them.
pub type LogStream = Pin<Box<dyn Stream<Item = EngineResult<Vec<u8>>> + Send>>;

/// Uniform async view of a container engine.
///
/// Implementations normalize their native failures into [`crate::EngineError`]
/// and never cache: every call reflects (or mutates) remote state.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Create the object described by `spec` and return its engine id.
    /// A name already in use yields `EngineError::Conflict`.
    async fn create(&self, spec: &ObjectSpec) -> EngineResult<String>;

    /// Start (containers) or scale up (services). Already running is success.
    async fn start(&self, kind: ObjectKind, id: &str) -> EngineResult<()>;

    /// Stop (containers) or scale to zero (services). Already stopped is success.
    async fn stop(&self, kind: ObjectKind, id: &str, grace: Duration) -> EngineResult<()>;

    async fn remove(&self, kind: ObjectKind, id: &str, force: bool) -> EngineResult<()>;

    /// Look up by id or name. Absent objects are `EngineError::NotFound`.
    async fn inspect(&self, kind: ObjectKind, id_or_name: &str) -> EngineResult<EngineObservation>;

    /// Every object (running or not) carrying all of `labels`.
    async fn list_by_label(
        &self,
        kind: ObjectKind,
        labels: &BTreeMap<String, String>,
    ) -> EngineResult<Vec<EngineObservation>>;

    async fn logs(&self, kind: ObjectKind, id: &str) -> EngineResult<LogStream>;

    /// Apply new resource limits without replacing the object.
    async fn update_resources(
        &self,
        kind: ObjectKind,
        id: &str,
        limits: &ResourceLimits,
    ) -> EngineResult<()>;

    /// Make `image` available locally according to `policy`.
    async fn ensure_image(&self, image: &str, policy: PullPolicy) -> EngineResult<()>;
}
