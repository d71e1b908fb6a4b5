//! HTTP API for session control and clip intake
//!
//! - GET /health - Health check
//! - GET /time - Reference clock (`{ "now": epoch_ms }`)
//! - POST /sessions - Create a session
//! - GET /sessions/:id - Session document
//! - POST /sessions/:id/schedule - Set the start for the current generation
//! - POST /sessions/:id/rearm - Begin a new generation
//! - POST /sessions/:id/join - Run a local participant
//! - POST /sessions/:id/trigger - Manual trigger for the local participant
//! - POST /sessions/:id/leave - Tear down the local participant
//! - GET /sessions/:id/status - Local participant status
//! - POST /sessions/:id/clips?participant= - Upload a clip recorded elsewhere

mod handlers;
mod routes;
mod state;

pub use handlers::ApiError;
pub use routes::create_router;
pub use state::AppState;
