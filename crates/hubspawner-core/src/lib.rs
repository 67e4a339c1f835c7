//! Spawner core: names, engine adapters, reconciliation and the per-server
//! lifecycle state machine.

pub mod backend;
pub mod docker;
pub mod naming;
pub mod reconciler;
pub mod resilient;
pub mod single_flight;
pub mod spawner;
pub mod test_utils;
pub mod testing;

// Re-export dependencies potentially needed by consumers (like the CLI)
pub use bollard;
pub use hubspawner_common as common;

pub use backend::{backend_for, ObjectBackend, ReplacementPolicy, Variant};
pub use docker::DockerEngine;
pub use naming::{CanonicalName, NameResolver};
pub use reconciler::{Action, ActionKind, ReconcileOutcome, Reconciler};
pub use resilient::ResilientEngine;
pub use single_flight::SingleFlight;
pub use spawner::{HubSpawner, Spawner, SpawnerState};
