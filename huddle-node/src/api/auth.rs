//! Session middleware
//!
//! Identity comes from the external auth layer as a session id in
//! `X-Session-Id`. Each authenticated request refreshes the session and hands
//! the caller to handlers as an [`Extension<Caller>`](axum::Extension).

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use huddle_common::ids::{TenantId, UserId};

use super::error::ApiError;
use crate::AppState;

/// Session header
pub const SESSION_HEADER: &str = "x-session-id";

/// Authenticated caller of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub session_id: String,
    pub tenant_id: TenantId,
    pub user_id: UserId,
}

pub async fn session_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let session_id = request
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("missing X-Session-Id header".into()))?
        .to_string();

    let session = match state.sessions.touch(&session_id).await {
        Ok(session) => session,
        Err(huddle_common::Error::NotFound(_)) => {
            debug!("Rejected request with unknown or expired session");
            return Err(ApiError::Unauthorized("session expired or unknown".into()));
        }
        Err(e) => return Err(e.into()),
    };

    request.extensions_mut().insert(Caller {
        session_id,
        tenant_id: session.tenant_id,
        user_id: session.user_id,
    });
    Ok(next.run(request).await)
}
