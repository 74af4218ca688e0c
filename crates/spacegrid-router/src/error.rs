use spacegrid_state::StateError;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("route not found: {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("template {name} failed to render: {reason}")]
    Render { name: String, reason: String },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("handler failed: {0}")]
    Handler(#[from] anyhow::Error),
}

pub type RouteResult<T> = Result<T, RouteError>;
