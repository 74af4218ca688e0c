//! API error type and its JSON rendering.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use spacegrid_capability::CapabilityError;
use spacegrid_engine::EngineError;
use spacegrid_router::RouteError;

use crate::handlers::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid credentials")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<CapabilityError> for ApiError {
    fn from(e: CapabilityError) -> Self {
        ApiError::Engine(EngineError::Capability(e))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(e) => engine_status(e),
        }
    }
}

fn engine_status(e: &EngineError) -> StatusCode {
    match e {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Validation(_) | EngineError::Install(_) => StatusCode::BAD_REQUEST,
        EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
        EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::Route(
            RouteError::RouteNotFound { .. } | RouteError::FileNotFound(_) | RouteError::TemplateNotFound(_),
        ) => StatusCode::NOT_FOUND,
        EngineError::Route(RouteError::InvalidPath(_)) => StatusCode::BAD_REQUEST,
        EngineError::Capability(CapabilityError::NotFound(_) | CapabilityError::UnknownCapability(_)) => {
            StatusCode::NOT_FOUND
        }
        EngineError::Capability(CapabilityError::UnknownMethod { .. } | CapabilityError::InvalidParams(_)) => {
            StatusCode::BAD_REQUEST
        }
        EngineError::Capability(CapabilityError::DuplicateConn(_)) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (
            status,
            Json(ApiResponse::<()> {
                success: false,
                data: None,
                error: Some(self.to_string()),
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_error_kind() {
        let cases = [
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED),
            (EngineError::NotFound("x".into()).into(), StatusCode::NOT_FOUND),
            (EngineError::Validation("x".into()).into(), StatusCode::BAD_REQUEST),
            (EngineError::Forbidden("x".into()).into(), StatusCode::FORBIDDEN),
            (
                EngineError::Route(RouteError::FileNotFound("a".into())).into(),
                StatusCode::NOT_FOUND,
            ),
            (
                CapabilityError::UnknownMethod {
                    capability: "kv".into(),
                    method: "x".into(),
                }
                .into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                EngineError::Runtime(anyhow::anyhow!("boom")).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{err}");
        }
    }
}
