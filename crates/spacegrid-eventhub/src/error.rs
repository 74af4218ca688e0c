use spacegrid_state::StateError;

#[derive(Debug, thiserror::Error)]
pub enum EventHubError {
    #[error("event not found: {0}")]
    EventNotFound(i64),

    #[error("event hub already started")]
    AlreadyStarted,

    #[error("event queue closed")]
    QueueClosed,

    #[error("state error: {0}")]
    State(#[from] StateError),
}

pub type EventHubResult<T> = Result<T, EventHubError>;
