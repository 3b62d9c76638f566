//! HTTP API handlers

pub mod auth;
pub mod connections;
pub mod context;
pub mod conversations;
pub mod error;
pub mod events;
pub mod health;
pub mod inconsistencies;
pub mod publish;
pub mod sessions;
pub mod updates;

pub use auth::{session_middleware, Caller};
pub use connections::connection_routes;
pub use context::context_routes;
pub use conversations::conversation_routes;
pub use error::{ApiError, ApiResult};
pub use health::health_routes;
pub use inconsistencies::inconsistency_routes;
pub use publish::publish_routes;
pub use sessions::{login_routes, session_routes};
pub use updates::delivery_routes;

use huddle_common::ids::ConnectionId;
use uuid::Uuid;

use crate::transport::ConnectionKey;

/// Key of one of the caller's own connections
///
/// Connections are scoped to the caller, so another user's id is simply
/// not found.
pub(crate) fn connection_key(caller: &Caller, raw: &str) -> ApiResult<ConnectionKey> {
    let connection_id = ConnectionId::parse(raw.trim())
        .map_err(|_| ApiError::BadRequest(format!("invalid connection id: {raw}")))?;
    Ok(ConnectionKey::new(
        caller.tenant_id.clone(),
        caller.user_id.clone(),
        connection_id,
    ))
}

pub(crate) fn parse_uuid(raw: &str, what: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::BadRequest(format!("invalid {what} id: {raw}")))
}
