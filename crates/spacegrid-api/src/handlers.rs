//! REST and space-serving handlers.
//!
//! JSON endpoints answer with the `ApiResponse` envelope; space requests
//! answer with whatever the space produced.

use std::collections::HashMap;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use spacegrid_core::{HttpContext, InstallId, LazyData, SpaceId, SpaceResponse, SubscriptionId};
use spacegrid_engine::{SpaceSpec, SubscriptionSpec};

use crate::ApiState;
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

// ── Space serving ──────────────────────────────────────────────

/// ANY /z/{namespace}
pub async fn serve_space_root(
    State(state): State<ApiState>,
    Path(namespace): Path<String>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    serve_space(state, namespace, String::new(), method, query, headers, body).await
}

/// ANY /z/{namespace}/{*path}
pub async fn serve_space_path(
    State(state): State<ApiState>,
    Path((namespace, path)): Path<(String, String)>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    serve_space(state, namespace, path, method, query, headers, body).await
}

async fn serve_space(
    state: ApiState,
    namespace: String,
    path: String,
    method: Method,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let mut ctx = HttpContext::new(method.as_str(), &path);
    ctx.query = query;
    ctx.headers = headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect();
    ctx.body = body;

    let reply = state.engine.serve_space_file(&namespace, &mut ctx).await?;
    Ok(space_response(reply))
}

fn space_response(reply: SpaceResponse) -> Response {
    let mut builder = Response::builder().status(reply.status);
    for (name, value) in &reply.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::from(reply.body))
        .unwrap_or_else(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response())
}

// ── Spaces & capabilities ──────────────────────────────────────

/// POST /api/v1/spaces
pub async fn create_space(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Json(spec): Json<SpaceSpec>,
) -> ApiResult<Response> {
    let space = state.engine.create_space(claims.user_id, &spec)?;
    Ok((StatusCode::CREATED, ApiResponse::ok(space)).into_response())
}

/// POST /api/v1/spaces/{space_id}/capabilities/{name}
///
/// The body, if any, is the capability's JSON options.
pub async fn enable_capability(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Path((space_id, name)): Path<(SpaceId, String)>,
    body: Bytes,
) -> ApiResult<Response> {
    let options = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(format!("invalid options: {e}")))?
    };
    let capability = state
        .engine
        .enable_capability(claims.user_id, space_id, &name, options)?;
    Ok((StatusCode::CREATED, ApiResponse::ok(capability)).into_response())
}

/// DELETE /api/v1/spaces/{space_id}/capabilities/{name}
pub async fn disable_capability(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Path((space_id, name)): Path<(SpaceId, String)>,
) -> ApiResult<Response> {
    state
        .engine
        .disable_capability(claims.user_id, space_id, &name)
        .await?;
    Ok(ApiResponse::ok("disabled").into_response())
}

/// POST /api/v1/spaces/{space_id}/capabilities/{name}/{method}
pub async fn execute_capability(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Path((space_id, name, method)): Path<(SpaceId, String, String)>,
    body: Bytes,
) -> ApiResult<Response> {
    let result = state
        .engine
        .execute_capability(claims.user_id, space_id, &name, &method, LazyData::from_bytes(body))
        .await?;
    Ok(ApiResponse::ok(result).into_response())
}

// ── Packages ───────────────────────────────────────────────────

/// POST /api/v1/packages (zip body)
pub async fn upload_package(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    body: Bytes,
) -> ApiResult<Response> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("empty package body".to_string()));
    }
    let install = state.engine.install_package_by_file(claims.user_id, &body)?;
    Ok((StatusCode::CREATED, ApiResponse::ok(install)).into_response())
}

#[derive(Deserialize)]
pub struct PackageUrlRequest {
    pub url: String,
}

/// POST /api/v1/packages/url
pub async fn install_package_url(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Json(req): Json<PackageUrlRequest>,
) -> ApiResult<Response> {
    let install = state
        .engine
        .install_package_by_url(claims.user_id, &req.url)
        .await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(install)).into_response())
}

// ── Subscriptions ──────────────────────────────────────────────

/// GET /api/v1/installs/{install_id}/subscriptions
pub async fn list_subscriptions(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Path(install_id): Path<InstallId>,
) -> ApiResult<Response> {
    let subs = state.engine.list_subscriptions(claims.user_id, install_id)?;
    Ok(ApiResponse::ok(subs).into_response())
}

/// POST /api/v1/installs/{install_id}/subscriptions
pub async fn create_subscription(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Path(install_id): Path<InstallId>,
    Json(spec): Json<SubscriptionSpec>,
) -> ApiResult<Response> {
    let sub = state
        .engine
        .create_subscription(claims.user_id, install_id, spec)?;
    Ok((StatusCode::CREATED, ApiResponse::ok(sub)).into_response())
}

/// DELETE /api/v1/installs/{install_id}/subscriptions/{id}
pub async fn delete_subscription(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Path((install_id, id)): Path<(InstallId, SubscriptionId)>,
) -> ApiResult<Response> {
    state
        .engine
        .delete_subscription(claims.user_id, install_id, id)?;
    Ok(ApiResponse::ok("deleted").into_response())
}

// ── Events ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PublishRequest {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

/// POST /api/v1/installs/{install_id}/events
///
/// `event_id` is null when no enabled subscription listens for the event.
pub async fn publish_event(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Path(install_id): Path<InstallId>,
    Json(req): Json<PublishRequest>,
) -> ApiResult<Response> {
    let payload = match req.payload {
        Value::Null => Bytes::new(),
        other => Bytes::from(other.to_string()),
    };
    let event_id = state
        .engine
        .publish_event(claims.user_id, install_id, &req.name, payload)
        .await?;
    Ok(ApiResponse::ok(serde_json::json!({ "event_id": event_id })).into_response())
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({
        "status": "ok",
        "spaces": state.engine.index().len(),
    }))
}
