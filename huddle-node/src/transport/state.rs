//! Per-connection transport state machine
//!
//! `Negotiating → {Pushing, LongPolling, ShortPolling}`, then only downgrades
//! (`Pushing → LongPolling → ShortPolling`) or `Closed`. A connection never
//! upgrades; that takes a fresh negotiation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Negotiating,
    Pushing,
    LongPolling,
    ShortPolling,
    Closed,
}

impl ConnectionState {
    fn rank(self) -> u8 {
        match self {
            ConnectionState::Negotiating => 0,
            ConnectionState::Pushing => 1,
            ConnectionState::LongPolling => 2,
            ConnectionState::ShortPolling => 3,
            ConnectionState::Closed => 4,
        }
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Negotiating, Negotiating) => false,
            (Negotiating, _) => true,
            // Downgrade only, one or more steps
            (current, next) => next.rank() > current.rank(),
        }
    }

    /// Next mode after a client-observed failure; `None` when nothing is left
    pub fn downgrade(self) -> Option<ConnectionState> {
        match self {
            ConnectionState::Negotiating | ConnectionState::Pushing => {
                Some(ConnectionState::LongPolling)
            }
            ConnectionState::LongPolling => Some(ConnectionState::ShortPolling),
            ConnectionState::ShortPolling | ConnectionState::Closed => None,
        }
    }

    pub fn is_polling(self) -> bool {
        matches!(
            self,
            ConnectionState::LongPolling | ConnectionState::ShortPolling
        )
    }
}

/// Transports a client says it can use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default = "default_true")]
    pub supports_push: bool,
    #[serde(default = "default_true")]
    pub supports_long_poll: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_push: true,
            supports_long_poll: true,
        }
    }
}

impl Capabilities {
    /// Starting state for a new connection
    pub fn initial_state(self) -> ConnectionState {
        if self.supports_push {
            ConnectionState::Negotiating
        } else if self.supports_long_poll {
            ConnectionState::LongPolling
        } else {
            ConnectionState::ShortPolling
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_negotiation_outcomes() {
        assert!(Negotiating.can_transition_to(Pushing));
        assert!(Negotiating.can_transition_to(LongPolling));
        assert!(Negotiating.can_transition_to(ShortPolling));
        assert!(Negotiating.can_transition_to(Closed));
    }

    #[test]
    fn test_no_upgrades() {
        assert!(!LongPolling.can_transition_to(Pushing));
        assert!(!ShortPolling.can_transition_to(LongPolling));
        assert!(!Pushing.can_transition_to(Negotiating));
        assert!(!Closed.can_transition_to(Pushing));
    }

    #[test]
    fn test_downgrade_chain() {
        assert_eq!(Pushing.downgrade(), Some(LongPolling));
        assert_eq!(LongPolling.downgrade(), Some(ShortPolling));
        assert_eq!(ShortPolling.downgrade(), None);
        assert!(Pushing.can_transition_to(LongPolling));
        assert!(LongPolling.can_transition_to(ShortPolling));
        assert!(ShortPolling.can_transition_to(Closed));
    }

    #[test]
    fn test_initial_state_from_capabilities() {
        assert_eq!(Capabilities::default().initial_state(), Negotiating);
        let no_push = Capabilities {
            supports_push: false,
            supports_long_poll: true,
        };
        assert_eq!(no_push.initial_state(), LongPolling);
        let nothing = Capabilities {
            supports_push: false,
            supports_long_poll: false,
        };
        assert_eq!(nothing.initial_state(), ShortPolling);
    }
}
