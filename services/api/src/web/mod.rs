pub mod middleware;
pub mod protocol;
pub mod rest;
pub mod state;
pub mod stream;


use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub use middleware::require_user;
pub use state::AppState;

/// Builds the router for every learning-session endpoint. Every route
/// requires the caller identity header.
pub fn router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/documents/{document_id}/session", post(rest::start_session_handler))
        .route("/sessions/{session_id}", get(rest::get_session_handler))
        .route("/sessions/{session_id}/pause", post(rest::pause_session_handler))
        .route(
            "/sessions/{session_id}/sub-topics/{sub_topic_id}/explanation",
            get(stream::explanation_stream_handler),
        )
        .route(
            "/sessions/{session_id}/sub-topics/{sub_topic_id}/re-explain",
            post(stream::reexplain_stream_handler),
        )
        .route("/sessions/{session_id}/confirm", post(rest::confirm_handler))
        .route("/sessions/{session_id}/quiz", get(rest::get_quiz_handler))
        .route("/sessions/{session_id}/answer", post(rest::answer_handler))
        .route("/sessions/{session_id}/skip", post(rest::skip_handler))
        .route(
            "/sessions/{session_id}/complete-topic",
            post(rest::complete_topic_handler),
        )
        .route("/quota/{bucket}", get(rest::quota_handler))
        .layer(axum_middleware::from_fn(require_user))
        .with_state(app_state)
}
