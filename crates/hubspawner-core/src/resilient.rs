//! Timeout and bounded-retry decorator for any [`EngineClient`].

use async_trait::async_trait;
use hubspawner_common::{
    EngineClient, EngineError, EngineObservation, EngineResult, EngineSettings, LogStream,
    ObjectKind, ObjectSpec, PullPolicy, ResourceLimits,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Wraps every call in a timeout and retries `Unavailable` with exponential
/// backoff. Any other error is returned on the first occurrence.
pub struct ResilientEngine<E> {
    inner: E,
    settings: EngineSettings,
}

impl<E: EngineClient> ResilientEngine<E> {
    pub fn new(inner: E, settings: EngineSettings) -> Self {
        Self { inner, settings }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    async fn call<T, F, Fut>(&self, op: &str, mut f: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let retry = &self.settings.retry;
        let timeout = self.settings.call_timeout();
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Unavailable(format!(
                    "{op} timed out after {}s",
                    timeout.as_secs_f64()
                ))),
            };
            match result {
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    let delay = retry.delay_for(attempt);
                    warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Engine call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        debug!(op, attempts = attempt, "Retries exhausted");
                    }
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

#[async_trait]
impl<E: EngineClient> EngineClient for ResilientEngine<E> {
    async fn create(&self, spec: &ObjectSpec) -> EngineResult<String> {
        self.call("create", || self.inner.create(spec)).await
    }

    async fn start(&self, kind: ObjectKind, id: &str) -> EngineResult<()> {
        self.call("start", || self.inner.start(kind, id)).await
    }

    async fn stop(&self, kind: ObjectKind, id: &str, grace: Duration) -> EngineResult<()> {
        self.call("stop", || self.inner.stop(kind, id, grace)).await
    }

    async fn remove(&self, kind: ObjectKind, id: &str, force: bool) -> EngineResult<()> {
        self.call("remove", || self.inner.remove(kind, id, force)).await
    }

    async fn inspect(&self, kind: ObjectKind, id_or_name: &str) -> EngineResult<EngineObservation> {
        self.call("inspect", || self.inner.inspect(kind, id_or_name)).await
    }

    async fn list_by_label(
        &self,
        kind: ObjectKind,
        labels: &BTreeMap<String, String>,
    ) -> EngineResult<Vec<EngineObservation>> {
        self.call("list", || self.inner.list_by_label(kind, labels)).await
    }

    async fn logs(&self, kind: ObjectKind, id: &str) -> EngineResult<LogStream> {
        self.call("logs", || self.inner.logs(kind, id)).await
    }

    async fn update_resources(
        &self,
        kind: ObjectKind,
        id: &str,
        limits: &ResourceLimits,
    ) -> EngineResult<()> {
        self.call("update", || self.inner.update_resources(kind, id, limits))
            .await
    }

    async fn ensure_image(&self, image: &str, policy: PullPolicy) -> EngineResult<()> {
        // Pulls can legitimately take far longer than one API call.
        let pull_timeout = self.settings.call_timeout() * 10;
        match tokio::time::timeout(pull_timeout, self.inner.ensure_image(image, policy)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Unavailable(format!(
                "pulling {image} timed out after {}s",
                pull_timeout.as_secs()
            ))),
        }
    }
}
