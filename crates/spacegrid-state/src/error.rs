//! Failure modes of the SpaceGrid state store.
//!
//! Storage failures carry redb's message verbatim. `NotFound` and
//! `Conflict` are the two domain outcomes callers branch on: the engine
//! maps them to 404 and 409.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// The database file could not be created or opened.
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("failed to encode record: {0}")]
    Serialize(String),

    /// A stored record no longer matches its type, e.g. after a schema change.
    #[error("failed to decode record: {0}")]
    Deserialize(String),

    /// A referenced package version, event, or target does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness rule was violated: a namespace key already has an
    /// owning space, or a capability name is already enabled on the space.
    #[error("conflict: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_names_the_clash() {
        let err = StateError::Conflict("namespace blog already owned by space 3".to_string());
        assert_eq!(err.to_string(), "conflict: namespace blog already owned by space 3");
    }
}
