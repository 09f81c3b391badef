//! Prekey repository + message relay HTTP service (§4.7, §4.8). Built as a
//! library so the integration suite under `tests/` can drive the router
//! in-process via `tower::ServiceExt::oneshot`, the idiomatic axum
//! counterpart to the teacher's "spin up the server, POST /reset" pattern.

pub mod config;
pub mod db;
pub mod error;
pub mod prekeys;
pub mod relay;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use config::ServerConfig;
pub use db::RelayDb;
pub use state::{AppState, SharedState};

/// Build the axum router over `state`. Used by both `main.rs` and the
/// integration tests.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/users/{userId}/prekeys", get(prekeys::get_bundle))
        .route("/users/prekeys", post(prekeys::upload_bundle))
        .route("/relay/messages", post(relay::send_message))
        .route("/relay/messages/{userId}", get(relay::poll_messages))
        .route("/relay/messages/{id}/ack", post(relay::ack_message))
        .route("/health", get(|| async { "ok" }))
        .layer(cors)
        .with_state(state)
}
