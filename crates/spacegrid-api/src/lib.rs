//! spacegrid-api — HTTP surface for SpaceGrid.
//!
//! Serves spaces under `/z/`, bridges WebSockets into capability rooms,
//! and exposes the tenant REST API.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | ANY | `/z/{namespace}/{*path}` | Serve a space |
//! | GET | `/ws/{space_id}/{capability}` | WebSocket into a capability room |
//! | POST | `/api/v1/spaces` | Create a space |
//! | POST, DELETE | `/api/v1/spaces/{space_id}/capabilities/{name}` | Enable / disable a capability |
//! | POST | `/api/v1/spaces/{space_id}/capabilities/{name}/{method}` | Execute a capability method |
//! | POST | `/api/v1/packages` | Upload and install a zip package |
//! | POST | `/api/v1/packages/url` | Install a package from a URL |
//! | GET, POST | `/api/v1/installs/{install_id}/subscriptions` | List / create subscriptions |
//! | DELETE | `/api/v1/installs/{install_id}/subscriptions/{id}` | Delete a subscription |
//! | POST | `/api/v1/installs/{install_id}/events` | Publish an event |
//! | GET | `/healthz` | Liveness |

pub mod auth;
pub mod error;
pub mod handlers;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{any, delete, get, post};

use spacegrid_engine::Engine;

pub use auth::{AuthUser, Claims, Signer, StaticTokenSigner};
pub use error::{ApiError, ApiResult};

/// Largest accepted package upload.
const MAX_PACKAGE_BYTES: usize = 64 * 1024 * 1024;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
    pub signer: Arc<dyn Signer>,
}

/// Build the complete router (spaces + sockets + REST).
pub fn build_router(engine: Arc<Engine>, signer: Arc<dyn Signer>) -> Router {
    let state = ApiState { engine, signer };

    let api_routes = Router::new()
        .route("/spaces", post(handlers::create_space))
        .route(
            "/spaces/{space_id}/capabilities/{name}",
            post(handlers::enable_capability).delete(handlers::disable_capability),
        )
        .route(
            "/spaces/{space_id}/capabilities/{name}/{method}",
            post(handlers::execute_capability),
        )
        .route(
            "/packages",
            post(handlers::upload_package).layer(DefaultBodyLimit::max(MAX_PACKAGE_BYTES)),
        )
        .route("/packages/url", post(handlers::install_package_url))
        .route(
            "/installs/{install_id}/subscriptions",
            get(handlers::list_subscriptions).post(handlers::create_subscription),
        )
        .route(
            "/installs/{install_id}/subscriptions/{id}",
            delete(handlers::delete_subscription),
        )
        .route("/installs/{install_id}/events", post(handlers::publish_event));

    Router::new()
        .route("/z/{namespace}", any(handlers::serve_space_root))
        .route("/z/{namespace}/{*path}", any(handlers::serve_space_path))
        .route("/ws/{space_id}/{capability}", get(ws::connect))
        .route("/healthz", get(handlers::healthz))
        .nest("/api/v1", api_routes)
        .with_state(state)
}
