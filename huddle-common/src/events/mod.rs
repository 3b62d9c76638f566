//! Event types for the huddle event system
//!
//! Provides the immutable [`Event`] record stored in per-user logs, the typed
//! [`CollabEvent`] payloads produced by in-process services, and the
//! [`EventBus`] used for node-local fan-out.

mod conflict_types;
mod conversation_types;

pub use conflict_types::{InconsistencyKind, InconsistencyStatus, Severity};
pub use conversation_types::{ConversationStatus, PresenceStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ids::{TenantId, UserId};

/// Per-user log address: every event lives in exactly one (tenant, user) log
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub tenant_id: TenantId,
    pub user_id: UserId,
}

impl Topic {
    pub fn new(tenant_id: TenantId, user_id: UserId) -> Self {
        Self { tenant_id, user_id }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.user_id)
    }
}

/// Immutable fact appended to a user's log
///
/// `id` is strictly increasing within one log and is the client-visible cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub origin_node: String,
    pub timestamp: DateTime<Utc>,
}

/// Event content before the log assigns an id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Typed events emitted by huddle's own services
///
/// External producers (chat handler, AI pipeline) publish free-form
/// [`NewEvent`]s; these variants cover what the core emits itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum CollabEvent {
    /// Chat message appended to a conversation
    ChatMessage {
        conversation_id: Uuid,
        message_id: Uuid,
        author_id: UserId,
        body: String,
    },

    /// Participant joined a conversation
    ParticipantJoined {
        conversation_id: Uuid,
        user_id: UserId,
    },

    /// Participant left a conversation
    ParticipantLeft {
        conversation_id: Uuid,
        user_id: UserId,
    },

    /// User came online (first connection) or went offline (last connection gone)
    PresenceChanged {
        user_id: UserId,
        status: PresenceStatus,
    },

    /// Conversation lifecycle transition
    ConversationStatusChanged {
        conversation_id: Uuid,
        old_status: ConversationStatus,
        new_status: ConversationStatus,
    },

    /// Conversation expiry moved forward
    ConversationExtended {
        conversation_id: Uuid,
        expires_at: DateTime<Utc>,
    },

    /// Conversation context version bumped
    ContextVersionBumped {
        conversation_id: Uuid,
        context_version: u64,
    },

    /// Requirement conflict detected
    InconsistencyOpened {
        inconsistency_id: Uuid,
        kind: InconsistencyKind,
        severity: Severity,
        summary: String,
    },

    /// Requirement conflict moved through its workflow
    InconsistencyStatusChanged {
        inconsistency_id: Uuid,
        old_status: InconsistencyStatus,
        new_status: InconsistencyStatus,
        resolution: Option<String>,
        rationale: Option<String>,
    },
}

impl CollabEvent {
    /// Get event type as string for filtering and SSE `event:` fields
    pub fn event_type(&self) -> &'static str {
        match self {
            CollabEvent::ChatMessage { .. } => "ChatMessage",
            CollabEvent::ParticipantJoined { .. } => "ParticipantJoined",
            CollabEvent::ParticipantLeft { .. } => "ParticipantLeft",
            CollabEvent::PresenceChanged { .. } => "PresenceChanged",
            CollabEvent::ConversationStatusChanged { .. } => "ConversationStatusChanged",
            CollabEvent::ConversationExtended { .. } => "ConversationExtended",
            CollabEvent::ContextVersionBumped { .. } => "ContextVersionBumped",
            CollabEvent::InconsistencyOpened { .. } => "InconsistencyOpened",
            CollabEvent::InconsistencyStatusChanged { .. } => "InconsistencyStatusChanged",
        }
    }

    /// Convert into a log entry; the payload keeps the `type` tag
    pub fn to_new_event(&self) -> crate::Result<NewEvent> {
        Ok(NewEvent::new(self.event_type(), serde_json::to_value(self)?))
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Node-local event distribution channel
///
/// Wraps `tokio::broadcast`, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
///
/// One bus exists per active topic on a node; the bus is an ephemeral,
/// reconstructable cache and never the source of truth (the log is).
///
/// # Examples
///
/// ```
/// use huddle_common::events::{Event, EventBus};
///
/// let bus = EventBus::new(16);
/// let mut rx = bus.subscribe();
/// bus.emit_lossy(Event {
///     id: 1,
///     event_type: "ChatMessage".into(),
///     payload: serde_json::json!({}),
///     origin_node: "node-a".into(),
///     timestamp: chrono::Utc::now(),
/// });
/// assert_eq!(rx.try_recv().unwrap().id, 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: Event) -> Result<usize, broadcast::error::SendError<Event>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
