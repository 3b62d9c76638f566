//! Key namespaces
//!
//! Every tenant-scoped key starts with `t/{tenant}/` so no scan can cross a
//! tenant boundary. Segments come from [`crate::ids`] types, validated with
//! [`crate::ids::is_valid_segment`] at the API edge.

use std::fmt::Display;

use crate::ids::{ConnectionId, ProductId, TenantId, UserId};

/// Tenant discovery index used by the background sweepers
pub const TENANT_REGISTRY_PREFIX: &str = "registry/tenant/";

pub fn tenant_registry_key(tenant: &TenantId) -> String {
    format!("{TENANT_REGISTRY_PREFIX}{tenant}")
}

pub fn tenant_prefix(tenant: &TenantId) -> String {
    format!("t/{tenant}/")
}

/// Sessions are addressed by their opaque id alone; the record names its tenant
pub fn session_key(session_id: &str) -> String {
    format!("session/{session_id}")
}

pub fn conversation_key(tenant: &TenantId, conversation_id: impl Display) -> String {
    format!("t/{tenant}/conversation/{conversation_id}")
}

pub fn conversation_prefix(tenant: &TenantId) -> String {
    format!("t/{tenant}/conversation/")
}

pub fn connection_key(tenant: &TenantId, user: &UserId, connection: &ConnectionId) -> String {
    format!("t/{tenant}/conn/{user}/{connection}")
}

/// Every registration in a tenant, for presence audiences
pub fn tenant_connection_prefix(tenant: &TenantId) -> String {
    format!("t/{tenant}/conn/")
}

pub fn connection_prefix(tenant: &TenantId, user: &UserId) -> String {
    format!("t/{tenant}/conn/{user}/")
}

/// Marks the single in-flight long-poll of a connection
pub fn long_poll_lease_key(tenant: &TenantId, connection: &ConnectionId) -> String {
    format!("t/{tenant}/lease/longpoll/{connection}")
}

pub fn inconsistency_key(tenant: &TenantId, inconsistency_id: impl Display) -> String {
    format!("t/{tenant}/inconsistency/{inconsistency_id}")
}

pub fn inconsistency_prefix(tenant: &TenantId) -> String {
    format!("t/{tenant}/inconsistency/")
}

pub fn fragment_key(tenant: &TenantId, product: &ProductId, fragment_id: impl Display) -> String {
    format!("t/{tenant}/ctx/{product}/{fragment_id}")
}

pub fn fragment_prefix(tenant: &TenantId, product: &ProductId) -> String {
    format!("t/{tenant}/ctx/{product}/")
}

/// Every context scope of a tenant, for the eviction scheduler
pub fn context_prefix(tenant: &TenantId) -> String {
    format!("t/{tenant}/ctx/")
}

/// Extract the product segment from a fragment key
pub fn product_of_fragment_key<'a>(tenant: &TenantId, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(&context_prefix(tenant))?;
    rest.split_once('/').map(|(product, _)| product)
}

/// Exclusive upper bound for a prefix range scan
pub fn prefix_upper_bound(prefix: &str) -> String {
    format!("{prefix}{}", char::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_tenant_scoped() {
        let tenant = TenantId::new("acme");
        let user = UserId::new("alice");
        let conn = ConnectionId::generate();

        assert!(connection_key(&tenant, &user, &conn).starts_with(&tenant_prefix(&tenant)));
        assert!(connection_key(&tenant, &user, &conn).starts_with(&connection_prefix(&tenant, &user)));
        assert_eq!(session_key("s1"), "session/s1");
        assert!(!conversation_key(&TenantId::new("acme2"), 1).starts_with(&tenant_prefix(&tenant)));
    }

    #[test]
    fn test_product_of_fragment_key() {
        let tenant = TenantId::new("acme");
        let key = fragment_key(&tenant, &ProductId::new("p1"), "f1");
        assert_eq!(product_of_fragment_key(&tenant, &key), Some("p1"));
        assert_eq!(product_of_fragment_key(&tenant, "t/acme/session/x"), None);
    }

    #[test]
    fn test_prefix_upper_bound_orders_after_children() {
        let upper = prefix_upper_bound("t/acme/");
        assert!("t/acme/zzzz".to_string() < upper);
        assert!("t/acme0".to_string() > upper);
    }
}
