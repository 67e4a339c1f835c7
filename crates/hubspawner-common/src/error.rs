use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Normalized engine failure. Every adapter maps its native errors onto these
/// five cases; callers branch on the case, never on engine-specific text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Name or id already in use: {0}")]
    Conflict(String),

    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    #[error("Forbidden by engine: {0}")]
    Forbidden(String),

    #[error("Engine error: {0}")]
    Unknown(String),
}

impl EngineError {
    /// Only transport-level failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Unavailable(_) => ErrorKind::Unavailable,
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

#[derive(Error, Debug)]
pub enum SpawnerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Invalid object name: {0}")]
    InvalidName(String),

    #[error("Image '{image}' is not in the allowed image list")]
    ImageNotAllowed { image: String },

    #[error("Object {name} did not become ready within {timeout_secs}s")]
    StartTimeout { name: String, timeout_secs: u64 },

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Invalid spawner state: {0}")]
    State(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnerError {
    /// Flat classification attached to a spawner's `Error` state.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SpawnerError::Engine(e) => e.kind(),
            SpawnerError::InvalidName(_) => ErrorKind::InvalidName,
            SpawnerError::ImageNotAllowed { .. } => ErrorKind::Forbidden,
            SpawnerError::StartTimeout { .. } => ErrorKind::Unavailable,
            SpawnerError::Config(_) => ErrorKind::Config,
            SpawnerError::State(_) | SpawnerError::Io(_) => ErrorKind::Unknown,
        }
    }
}

impl From<serde_yaml::Error> for SpawnerError {
    fn from(err: serde_yaml::Error) -> Self {
        SpawnerError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for SpawnerError {
    fn from(err: serde_json::Error) -> Self {
        SpawnerError::Config(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Unavailable,
    Forbidden,
    Unknown,
    InvalidName,
    Config,
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

pub type Result<T> = std::result::Result<T, SpawnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_transient() {
        assert!(EngineError::Unavailable("socket".into()).is_transient());
        assert!(!EngineError::Conflict("name".into()).is_transient());
        assert!(!EngineError::Forbidden("denied".into()).is_transient());
        assert!(!EngineError::Unknown("boom".into()).is_transient());
    }

    #[test]
    fn spawner_error_kind_follows_engine_kind() {
        let err = SpawnerError::from(EngineError::Forbidden("no".into()));
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let err = SpawnerError::ImageNotAllowed {
            image: "evil:latest".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert!(err.to_string().contains("evil:latest"));
    }
}
