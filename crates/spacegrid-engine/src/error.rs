//! Engine error types.

use thiserror::Error;

use spacegrid_capability::CapabilityError;
use spacegrid_eventhub::{EventHubError, RuleError};
use spacegrid_router::RouteError;
use spacegrid_state::StateError;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("package install failed: {0}")]
    Install(String),

    #[error("state store error: {0}")]
    State(StateError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    EventHub(#[from] EventHubError),

    #[error("runtime error: {0}")]
    Runtime(#[from] anyhow::Error),
}

impl From<StateError> for EngineError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(what) => EngineError::NotFound(what),
            StateError::Conflict(what) => EngineError::Conflict(what),
            other => EngineError::State(other),
        }
    }
}

impl From<RuleError> for EngineError {
    fn from(e: RuleError) -> Self {
        EngineError::Validation(e.to_string())
    }
}

impl From<zip::result::ZipError> for EngineError {
    fn from(e: zip::result::ZipError) -> Self {
        EngineError::Install(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
