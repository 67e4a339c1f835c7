//! Decide and apply the single engine action that brings a user's object in
//! line with the desired spec.
//!
//! [`plan`] is pure: it compares the desired [`ObjectSpec`] with the latest
//! [`EngineObservation`] through the generation labels stamped at creation.
//! [`Reconciler::reconcile`] observes, plans and executes under a per-name
//! single-flight lock, so concurrent starts for one user produce one create.

use crate::backend::{
    Field, FieldPolicy, ObjectBackend, ReplacementPolicy, LABEL_GEN_IMAGE, LABEL_GEN_MOUNTS,
    LABEL_GEN_NETWORK, LABEL_GEN_USER,
};
use crate::single_flight::SingleFlight;
use hubspawner_common::{
    EngineError, EngineObservation, ObjectSpec, ResourceLimits, Result, SpawnerError,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Create(ObjectSpec),
    NoOp {
        id: String,
    },
    Start {
        id: String,
        resize: Option<ResourceLimits>,
    },
    Recreate {
        old_id: String,
        spec: ObjectSpec,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Create,
    NoOp,
    Start,
    Recreate,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Create(_) => ActionKind::Create,
            Action::NoOp { .. } => ActionKind::NoOp,
            Action::Start { .. } => ActionKind::Start,
            Action::Recreate { .. } => ActionKind::Recreate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub action: ActionKind,
    pub object_id: String,
    /// The object was created by this call.
    pub created: bool,
}

/// Fields of `observed` that no longer match `desired`.
pub fn divergence(desired: &ObjectSpec, observed: &EngineObservation) -> Vec<Field> {
    let marker_differs = |label: &str| match (desired.labels.get(label), observed.labels.get(label)) {
        (Some(want), Some(have)) => want != have,
        // objects created without markers are only compared where we can tell
        _ => false,
    };

    let mut fields = Vec::new();
    let image_differs = match observed.labels.get(LABEL_GEN_IMAGE) {
        Some(_) => marker_differs(LABEL_GEN_IMAGE),
        None => observed.image.as_deref().is_some_and(|img| img != desired.image),
    };
    if image_differs {
        fields.push(Field::Image);
    }
    if marker_differs(LABEL_GEN_MOUNTS) {
        fields.push(Field::Mounts);
    }
    if marker_differs(LABEL_GEN_NETWORK) {
        fields.push(Field::Network);
    }
    if marker_differs(LABEL_GEN_USER) {
        fields.push(Field::User);
    }
    if desired.resources != observed.resources {
        fields.push(Field::Resources);
    }
    fields
}

pub fn plan(
    desired: &ObjectSpec,
    observed: Option<&EngineObservation>,
    policy: &ReplacementPolicy,
) -> Action {
    let Some(observed) = observed else {
        return Action::Create(desired.clone());
    };

    let diverged = divergence(desired, observed);
    if observed.running {
        if !diverged.is_empty() {
            debug!(object = %desired.name, ?diverged, "Running object diverges, leaving it alone");
        }
        return Action::NoOp {
            id: observed.id.clone(),
        };
    }

    if diverged
        .iter()
        .any(|f| policy.for_field(*f) == FieldPolicy::Recreate)
    {
        return Action::Recreate {
            old_id: observed.id.clone(),
            spec: desired.clone(),
        };
    }

    let resize = (diverged.contains(&Field::Resources)
        && policy.resources == FieldPolicy::UpdateInPlace)
        .then_some(desired.resources);
    Action::Start {
        id: observed.id.clone(),
        resize,
    }
}

#[derive(Debug, Default, Clone)]
pub struct Reconciler {
    flights: Arc<SingleFlight>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flights(flights: Arc<SingleFlight>) -> Self {
        Self { flights }
    }

    pub fn flights(&self) -> &SingleFlight {
        &self.flights
    }

    #[instrument(skip_all, fields(object = %spec.name, kind = %spec.kind))]
    pub async fn reconcile(
        &self,
        backend: &dyn ObjectBackend,
        spec: &ObjectSpec,
    ) -> Result<ReconcileOutcome> {
        let _flight = self.flights.acquire(&spec.name).await;
        let policy = backend.policy();

        let observed = backend.inspect(&spec.name).await?;
        let mut action = plan(spec, observed.as_ref(), &policy);
        let mut conflict_seen = false;

        loop {
            debug!(action = ?action.kind(), "Applying reconcile action");
            match action {
                Action::Create(desired) => match backend.create(&desired).await {
                    Ok(id) => {
                        info!(object_id = %id, "Created object");
                        start_fresh(backend, &id).await?;
                        return Ok(ReconcileOutcome {
                            action: ActionKind::Create,
                            object_id: id,
                            created: true,
                        });
                    }
                    Err(EngineError::Conflict(msg)) if !conflict_seen => {
                        // created by someone outside this process; adopt it
                        warn!(%msg, "Name already taken, re-observing");
                        conflict_seen = true;
                        let observed = backend.inspect(&desired.name).await?;
                        if observed.is_none() {
                            return Err(EngineError::Conflict(msg).into());
                        }
                        action = plan(&desired, observed.as_ref(), &policy);
                    }
                    Err(e) => return Err(e.into()),
                },
                Action::NoOp { id } => {
                    return Ok(ReconcileOutcome {
                        action: ActionKind::NoOp,
                        object_id: id,
                        created: false,
                    })
                }
                Action::Start { id, resize } => {
                    if let Some(limits) = resize {
                        backend.update_resources(&id, &limits).await?;
                        info!(object_id = %id, ?limits, "Updated resource limits in place");
                    }
                    backend.start(&id).await?;
                    return Ok(ReconcileOutcome {
                        action: ActionKind::Start,
                        object_id: id,
                        created: false,
                    });
                }
                Action::Recreate { old_id, spec } => {
                    info!(old_id = %old_id, "Replacing diverged object");
                    match backend.remove(&old_id).await {
                        Ok(()) | Err(EngineError::NotFound(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                    let id = backend.create(&spec).await?;
                    start_fresh(backend, &id).await?;
                    return Ok(ReconcileOutcome {
                        action: ActionKind::Recreate,
                        object_id: id,
                        created: true,
                    });
                }
            }
        }
    }
}

/// Start an object created moments ago; remove it again if the start fails.
async fn start_fresh(backend: &dyn ObjectBackend, id: &str) -> Result<()> {
    if let Err(start_err) = backend.start(id).await {
        warn!(object_id = %id, error = %start_err, "Start of new object failed, removing it");
        if let Err(remove_err) = backend.remove(id).await {
            warn!(object_id = %id, error = %remove_err, "Cleanup after failed start failed");
        }
        return Err(SpawnerError::Engine(start_err));
    }
    Ok(())
}
