//! services/api/src/web/middleware.rs
//!
//! Caller identity middleware for protecting routes.

use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use tracing::debug;
use uuid::Uuid;

/// The header carrying the authenticated caller's id, set by the gateway in front of this service.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Middleware that extracts the caller's user_id.
///
/// If valid, inserts the user_id into request extensions for handlers to use.
/// If invalid or missing, returns 401 Unauthorized.
pub async fn require_user(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let user_id = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or_else(|| {
            debug!("Rejecting request without a valid {} header", USER_ID_HEADER);
            StatusCode::UNAUTHORIZED
        })?;

    req.extensions_mut().insert(user_id);
    Ok(next.run(req).await)
}
