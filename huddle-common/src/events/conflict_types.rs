//! Inconsistency workflow enums shared by events and records

use serde::{Deserialize, Serialize};

/// Kind of requirement conflict reported by the analysis layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InconsistencyKind {
    Contradiction,
    Ambiguity,
    MissingInfo,
}

/// Severity; Critical conflicts block the external approval gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Workflow position: `Open → InReview → {Resolved, Dismissed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InconsistencyStatus {
    Open,
    InReview,
    Resolved,
    Dismissed,
}

impl InconsistencyStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InconsistencyStatus::Resolved | InconsistencyStatus::Dismissed
        )
    }

    /// Single-step transitions; nothing may skip InReview
    pub fn can_transition_to(self, next: InconsistencyStatus) -> bool {
        use InconsistencyStatus::*;
        matches!(
            (self, next),
            (Open, InReview) | (InReview, Resolved) | (InReview, Dismissed)
        )
    }
}
