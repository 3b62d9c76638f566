//! Connection registrations in the shared store
//!
//! One document per (user, connection) under `t/{tenant}/conn/{user}/`, with a
//! short TTL refreshed on every delivery, heartbeat and poll. If a node dies
//! its registrations simply lapse.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use huddle_common::events::{CollabEvent, PresenceStatus, Topic};
use huddle_common::ids::{ConnectionId, TenantId, UserId};
use huddle_common::store::{self, keys, StateStore};
use huddle_common::{Error, Result};

use super::state::{Capabilities, ConnectionState};
use crate::eventlog::EventLog;

/// Addresses one registration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub connection_id: ConnectionId,
}

impl ConnectionKey {
    pub fn new(tenant_id: TenantId, user_id: UserId, connection_id: ConnectionId) -> Self {
        Self {
            tenant_id,
            user_id,
            connection_id,
        }
    }

    pub fn store_key(&self) -> String {
        keys::connection_key(&self.tenant_id, &self.user_id, &self.connection_id)
    }

    pub fn topic(&self) -> Topic {
        Topic::new(self.tenant_id.clone(), self.user_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRegistration {
    pub connection_id: ConnectionId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    /// Node that accepted the connection
    pub node_id: String,
    pub state: ConnectionState,
    /// Highest event id the client acknowledged or was handed
    pub cursor: u64,
    pub capabilities: Capabilities,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Last suggested short-poll interval
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

impl ConnectionRegistration {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(
            self.tenant_id.clone(),
            self.user_id.clone(),
            self.connection_id,
        )
    }
}

pub struct ConnectionRegistry {
    store: Arc<dyn StateStore>,
    events: Arc<EventLog>,
    ttl: Duration,
}

fn missing(key: &ConnectionKey) -> Error {
    Error::NotFound(format!("connection {}", key.connection_id))
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn StateStore>, events: Arc<EventLog>, ttl: Duration) -> Self {
        Self { store, events, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn register(
        &self,
        tenant: &TenantId,
        user: &UserId,
        capabilities: Capabilities,
    ) -> Result<ConnectionRegistration> {
        let was_online = !self.list(tenant, user).await?.is_empty();

        let now = Utc::now();
        let registration = ConnectionRegistration {
            connection_id: ConnectionId::generate(),
            tenant_id: tenant.clone(),
            user_id: user.clone(),
            node_id: self.events.node_id().to_string(),
            state: capabilities.initial_state(),
            cursor: 0,
            capabilities,
            created_at: now,
            last_seen: now,
            poll_interval_ms: None,
        };
        store::insert_typed(
            self.store.as_ref(),
            &registration.key().store_key(),
            &registration,
            Some(self.ttl),
        )
        .await?;

        info!(
            tenant = %tenant,
            user = %user,
            connection = %registration.connection_id,
            state = ?registration.state,
            "Connection registered"
        );
        if !was_online {
            self.announce(tenant, user, PresenceStatus::Online).await;
        }
        Ok(registration)
    }

    pub async fn get(&self, key: &ConnectionKey) -> Result<Option<ConnectionRegistration>> {
        Ok(
            store::get_typed::<ConnectionRegistration>(self.store.as_ref(), &key.store_key())
                .await?
                .map(|doc| doc.value),
        )
    }

    pub async fn require(&self, key: &ConnectionKey) -> Result<ConnectionRegistration> {
        self.get(key).await?.ok_or_else(|| missing(key))
    }

    /// Move to `next`; `Conflict` if the state machine forbids it
    pub async fn transition(
        &self,
        key: &ConnectionKey,
        next: ConnectionState,
    ) -> Result<ConnectionRegistration> {
        self.transition_from(key, None, next).await
    }

    /// Move to `next` only if the current state is `from` (when given)
    pub async fn transition_from(
        &self,
        key: &ConnectionKey,
        from: Option<ConnectionState>,
        next: ConnectionState,
    ) -> Result<ConnectionRegistration> {
        let mut previous = None;
        let doc = store::update_typed(
            self.store.as_ref(),
            &key.store_key(),
            Some(self.ttl),
            |current: Option<ConnectionRegistration>| {
                let mut reg = current.ok_or_else(|| missing(key))?;
                if from.is_some_and(|expected| expected != reg.state) {
                    return Err(Error::Conflict(format!(
                        "connection is {:?}, expected {:?}",
                        reg.state, from
                    )));
                }
                if !reg.state.can_transition_to(next) {
                    return Err(Error::Conflict(format!(
                        "cannot move connection from {:?} to {:?}",
                        reg.state, next
                    )));
                }
                previous = Some(reg.state);
                reg.state = next;
                reg.last_seen = Utc::now();
                Ok(reg)
            },
        )
        .await?;
        info!(
            connection = %key.connection_id,
            from = ?previous,
            to = ?next,
            "Transport state changed"
        );
        Ok(doc.value)
    }

    /// Refresh the TTL and advance the cursor monotonically
    ///
    /// Stale or repeated cursors are no-ops.
    pub async fn observe(
        &self,
        key: &ConnectionKey,
        cursor: Option<u64>,
    ) -> Result<ConnectionRegistration> {
        let doc = store::update_typed(
            self.store.as_ref(),
            &key.store_key(),
            Some(self.ttl),
            |current: Option<ConnectionRegistration>| {
                let mut reg = current.ok_or_else(|| missing(key))?;
                if reg.state == ConnectionState::Closed {
                    return Err(missing(key));
                }
                if let Some(cursor) = cursor {
                    reg.cursor = reg.cursor.max(cursor);
                }
                reg.last_seen = Utc::now();
                Ok(reg)
            },
        )
        .await?;
        debug!(connection = %key.connection_id, cursor = doc.value.cursor, "Connection observed");
        Ok(doc.value)
    }

    pub async fn set_poll_interval(&self, key: &ConnectionKey, interval: Duration) -> Result<()> {
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        store::update_typed(
            self.store.as_ref(),
            &key.store_key(),
            Some(self.ttl),
            |current: Option<ConnectionRegistration>| {
                let mut reg = current.ok_or_else(|| missing(key))?;
                reg.poll_interval_ms = Some(interval_ms);
                Ok(reg)
            },
        )
        .await?;
        Ok(())
    }

    /// Delete the registration; announces Offline when it was the user's last
    pub async fn remove(&self, key: &ConnectionKey) -> Result<bool> {
        let removed = self.store.delete(&key.store_key()).await?;
        if removed {
            info!(connection = %key.connection_id, "Connection removed");
            if self.list(&key.tenant_id, &key.user_id).await?.is_empty() {
                self.announce(&key.tenant_id, &key.user_id, PresenceStatus::Offline)
                    .await;
            }
        }
        Ok(removed)
    }

    pub async fn list(&self, tenant: &TenantId, user: &UserId) -> Result<Vec<ConnectionRegistration>> {
        Ok(store::scan_typed::<ConnectionRegistration>(
            self.store.as_ref(),
            &keys::connection_prefix(tenant, user),
        )
        .await?
        .into_iter()
        .map(|(_, doc)| doc.value)
        .collect())
    }

    /// Users with at least one live registration in the tenant
    pub async fn online_users(&self, tenant: &TenantId) -> Result<BTreeSet<UserId>> {
        Ok(store::scan_typed::<ConnectionRegistration>(
            self.store.as_ref(),
            &keys::tenant_connection_prefix(tenant),
        )
        .await?
        .into_iter()
        .map(|(_, doc)| doc.value.user_id)
        .collect())
    }

    /// Presence goes to everyone online in the tenant, and to the user
    async fn announce(&self, tenant: &TenantId, user: &UserId, status: PresenceStatus) {
        let mut audience = match self.online_users(tenant).await {
            Ok(users) => users,
            Err(e) => {
                tracing::warn!("Presence audience unavailable: {}", e);
                BTreeSet::new()
            }
        };
        audience.insert(user.clone());
        self.events
            .notify(
                tenant,
                audience.iter(),
                &CollabEvent::PresenceChanged {
                    user_id: user.clone(),
                    status,
                },
            )
            .await;
    }
}
