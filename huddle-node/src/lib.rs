//! huddle-node library - realtime collaboration node
//!
//! One stateless application node: event log and fan-out, transport
//! negotiation, context retrieval, inconsistency workflow, sessions and
//! conversations, plus the HTTP surface over all of them. Every node is
//! interchangeable; authoritative state lives in the shared store.

use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use huddle_common::config::HuddleConfig;
use huddle_common::store::Stores;

pub mod api;
pub mod context;
pub mod conversations;
pub mod eventlog;
pub mod inconsistency;
pub mod maintenance;
pub mod sessions;
pub mod transport;

use context::ContextEngine;
use conversations::ConversationService;
use eventlog::EventLog;
use inconsistency::InconsistencyService;
use sessions::SessionService;
use transport::{ConnectionRegistry, Negotiator, PollRateLimiter};

/// Application state shared across HTTP handlers and background tasks
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HuddleConfig>,
    /// Stamped on every event this node authors
    pub node_id: String,
    pub stores: Stores,
    pub events: Arc<EventLog>,
    pub sessions: Arc<SessionService>,
    pub conversations: Arc<ConversationService>,
    pub negotiator: Arc<Negotiator>,
    pub poll_limiter: Arc<PollRateLimiter>,
    pub context: Arc<ContextEngine>,
    pub inconsistencies: Arc<InconsistencyService>,
    /// Cancelled once at shutdown; ends push streams and background loops
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire every service of a node onto the given stores
    pub fn new(config: HuddleConfig, node_id: String, stores: Stores) -> Self {
        let shutdown = CancellationToken::new();
        let events = Arc::new(EventLog::new(
            stores.log.clone(),
            &config.event_log,
            node_id.clone(),
        ));
        let registry = Arc::new(ConnectionRegistry::new(
            stores.state.clone(),
            events.clone(),
            config.transport.registration_ttl(),
        ));
        let negotiator = Arc::new(Negotiator::new(
            registry,
            config.transport.clone(),
            shutdown.clone(),
        ));
        let poll_limiter = Arc::new(PollRateLimiter::new(
            config.transport.short_poll_rate_per_sec,
            config.transport.short_poll_burst,
        ));
        let sessions = Arc::new(SessionService::new(
            stores.state.clone(),
            config.sessions.session_ttl(),
        ));
        let conversations = Arc::new(ConversationService::new(
            stores.state.clone(),
            events.clone(),
            config.sessions.conversation_ttl(),
        ));
        let context = Arc::new(ContextEngine::with_hashing(
            stores.state.clone(),
            config.context.clone(),
        ));
        let inconsistencies = Arc::new(InconsistencyService::new(
            stores.state.clone(),
            events.clone(),
        ));

        Self {
            config: Arc::new(config),
            node_id,
            stores,
            events,
            sessions,
            conversations,
            negotiator,
            poll_limiter,
            context,
            inconsistencies,
            shutdown,
        }
    }
}

/// Build application router
///
/// `/health` and session creation are public; everything else requires a
/// live session in `X-Session-Id`.
pub fn build_router(state: AppState) -> Router {
    use axum::middleware;

    let protected = Router::new()
        .merge(api::session_routes())
        .merge(api::connection_routes())
        .merge(api::delivery_routes())
        .merge(api::publish_routes())
        .merge(api::conversation_routes())
        .merge(api::context_routes())
        .merge(api::inconsistency_routes())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::session_middleware,
        ));

    let public = Router::new()
        .merge(api::health_routes())
        .merge(api::login_routes());

    Router::new()
        .merge(protected)
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
