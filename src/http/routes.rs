use super::handlers;
use super::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Largest clip accepted by the clips endpoint
const MAX_CLIP_BYTES: usize = 32 * 1024 * 1024;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Reference clock
        .route("/time", get(handlers::reference_time))
        // Session documents
        .route("/sessions", post(handlers::create_session))
        .route("/sessions/:id", get(handlers::get_session))
        .route("/sessions/:id/schedule", post(handlers::schedule_session))
        .route("/sessions/:id/rearm", post(handlers::rearm_session))
        // Local participant
        .route("/sessions/:id/join", post(handlers::join_session))
        .route("/sessions/:id/trigger", post(handlers::trigger_session))
        .route("/sessions/:id/leave", post(handlers::leave_session))
        .route("/sessions/:id/status", get(handlers::session_status))
        // Clips recorded on other devices
        .route(
            "/sessions/:id/clips",
            post(handlers::upload_clip).layer(DefaultBodyLimit::max(MAX_CLIP_BYTES)),
        )
        // Browser participants fetch /time and post clips cross-origin
        .layer(CorsLayer::permissive())
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
