mod facts;
mod routes;
mod state;
mod ws;

pub use routes::chat_blocking;
pub use state::AppState;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;

/// The full application router: JSON endpoints plus the two WebSocket
/// channels (push and chat).
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/state/{thread_id}", get(routes::state_snapshot))
        .route("/chat", post(routes::chat))
        .route("/tick", post(routes::tick))
        .route("/skills", post(routes::skills))
        .route("/policy/apply", post(routes::policy_apply))
        .route("/knowledge/ingest", post(routes::knowledge_ingest))
        .route("/initiative", post(routes::initiative_add))
        .route("/ws/chat/{thread_id}", get(ws::ws_chat))
        .route("/ws/{thread_id}", get(ws::ws_push))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
