// Shared types for the hub spawner: data model, error taxonomy, configuration
// and the engine capability trait consumed by the core crate.

pub mod config;
pub mod engine;
pub mod error;
pub mod types;

pub use config::{EngineSettings, RetrySettings, SpawnerConfig, SystemUserSettings};
pub use engine::{EngineClient, LogStream};
pub use error::{EngineError, EngineResult, ErrorKind, Result, SpawnerError};
pub use types::*;

// Re-export dependencies used in public interfaces of common types
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
pub use serde_json;
