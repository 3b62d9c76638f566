//! Conversation and presence enums shared by events and records

use serde::{Deserialize, Serialize};

/// Lifecycle of an AI-assisted discussion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationStatus {
    Active,
    Paused,
    Completed,
    Expired,
}

impl ConversationStatus {
    /// Completed and Expired conversations accept no further mutation
    pub fn is_terminal(self) -> bool {
        matches!(self, ConversationStatus::Completed | ConversationStatus::Expired)
    }

    /// Explicit status changes a caller may request
    ///
    /// Expiry is only ever applied by the sweeper.
    pub fn can_transition_to(self, next: ConversationStatus) -> bool {
        use ConversationStatus::*;
        matches!(
            (self, next),
            (Active, Paused) | (Paused, Active) | (Active, Completed) | (Paused, Completed)
        )
    }
}

/// Online state derived from connection registrations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Online,
    Offline,
}
