//! Identifier newtypes
//!
//! Tenant, user and product ids come from the out-of-scope administration
//! layer and are opaque strings. Connection ids are minted here.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Isolated customer organization
    TenantId
);
string_id!(
    /// End user within a tenant
    UserId
);
string_id!(
    /// Product a conversation or context corpus belongs to
    ProductId
);

/// One live client connection (a browser tab)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Key segments must not contain the namespace separator.
pub fn is_valid_segment(value: &str) -> bool {
    !value.is_empty() && !value.contains('/') && value.len() <= 128
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_id_serializes_transparently() {
        let tenant = TenantId::new("acme");
        assert_eq!(serde_json::to_string(&tenant).unwrap(), "\"acme\"");
        let back: TenantId = serde_json::from_str("\"acme\"").unwrap();
        assert_eq!(back, tenant);
    }

    #[test]
    fn test_connection_id_roundtrip_through_string() {
        let id = ConnectionId::generate();
        let parsed = ConnectionId::parse(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
        assert!(ConnectionId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_segment_validation() {
        assert!(is_valid_segment("user-1"));
        assert!(!is_valid_segment(""));
        assert!(!is_valid_segment("a/b"));
    }
}
