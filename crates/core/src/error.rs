//! Error taxonomy.
//!
//! - [`ConfigurationError`]: the registry itself is unusable. Fatal at load.
//! - [`FetchError`]: a remote read failed. Recovered locally by callers.
//! - [`ListenerError`]: an event subscriber failed. Isolated by the bus.

use thiserror::Error;

use crate::id::ModuleId;

/// Result type used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// An identifier failed to parse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid module id '{0}'")]
    Module(String),

    #[error("invalid user id: {0}")]
    User(String),
}

/// The module registry cannot be used.
///
/// Raised while loading or validating a registry and must stop the engine from
/// starting with it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("dependency cycle detected: {}", render_path(.path))]
    CyclicDependency { path: Vec<ModuleId> },

    #[error("module '{0}' is declared more than once")]
    DuplicateModule(ModuleId),

    #[error("module '{module}' depends on unknown module '{dependency}'")]
    UnknownDependency { module: ModuleId, dependency: ModuleId },

    #[error("malformed module id '{0}'")]
    InvalidModuleId(String),

    #[error("module '{module}' requires malformed permission '{permission}'")]
    InvalidPermission { module: ModuleId, permission: String },

    #[error("registry could not be parsed: {0}")]
    Parse(String),
}

fn render_path(path: &[ModuleId]) -> String {
    path.iter()
        .map(ModuleId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A remote read (module overlay or permission list) failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("response could not be parsed: {0}")]
    Parse(String),

    /// The bearer token was rejected (HTTP 401). Never retried.
    #[error("unauthorized")]
    Unauthorized,
}

impl FetchError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) => true,
            FetchError::Status(code) => *code >= 500 || *code == 408 || *code == 429,
            FetchError::Parse(_) | FetchError::Unauthorized => false,
        }
    }
}

/// A subscriber reported a failure while handling an event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("listener failed: {0}")]
pub struct ListenerError(String);

impl ListenerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Umbrella error for engine entry points.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The reconciler driver is no longer running.
    #[error("reconciler has shut down")]
    ShutDown,
}
