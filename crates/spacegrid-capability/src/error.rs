use spacegrid_state::StateError;

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("capability not found: {0}")]
    NotFound(String),

    #[error("no builder registered for {0}")]
    UnknownCapability(String),

    #[error("{capability} has no method {method}")]
    UnknownMethod { capability: String, method: String },

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("connection {0} already in room")]
    DuplicateConn(String),

    #[error("room {0} is closed")]
    RoomClosed(String),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

impl From<serde_json::Error> for CapabilityError {
    fn from(e: serde_json::Error) -> Self {
        CapabilityError::InvalidParams(e.to_string())
    }
}

pub type CapabilityResult<T> = Result<T, CapabilityError>;
