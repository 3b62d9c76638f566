//! Transport negotiation
//!
//! Opens connections, watches the push handshake deadline, applies
//! client-observed fallbacks and closes connections. All durable state lives
//! in the registration; the only node-local state is the cancellation token
//! of each push stream this node is serving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use huddle_common::config::TransportConfig;
use huddle_common::ids::{ConnectionId, TenantId, UserId};
use huddle_common::{Error, Result};

use super::registry::{ConnectionKey, ConnectionRegistration, ConnectionRegistry};
use super::state::{Capabilities, ConnectionState};

/// Result of a client-observed failure
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackOutcome {
    /// The connection continues in a lesser mode
    Degraded(ConnectionRegistration),
    /// No mode left; the client must offer a manual refresh
    Exhausted,
}

/// A push stream attached to this node
pub struct PushAttachment {
    pub registration: ConnectionRegistration,
    /// Cancelled by close, fallback, re-attach or shutdown
    pub token: CancellationToken,
    generation: u64,
}

pub struct Negotiator {
    registry: Arc<ConnectionRegistry>,
    config: TransportConfig,
    push_streams: Mutex<HashMap<ConnectionId, (u64, CancellationToken)>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl Negotiator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        config: TransportConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            config,
            push_streams: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Register a connection and start its handshake deadline
    pub async fn open(
        &self,
        tenant: &TenantId,
        user: &UserId,
        capabilities: Capabilities,
    ) -> Result<ConnectionRegistration> {
        let registration = self.registry.register(tenant, user, capabilities).await?;
        if registration.state == ConnectionState::Negotiating {
            self.spawn_handshake_deadline(registration.key());
        }
        Ok(registration)
    }

    fn spawn_handshake_deadline(&self, key: ConnectionKey) {
        let registry = self.registry.clone();
        let deadline = self.config.handshake_timeout();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {}
                _ = shutdown.cancelled() => return,
            }
            match registry
                .transition_from(
                    &key,
                    Some(ConnectionState::Negotiating),
                    ConnectionState::LongPolling,
                )
                .await
            {
                Ok(_) => info!(
                    connection = %key.connection_id,
                    "Push handshake not completed in time, falling back to long polling"
                ),
                // Attached, closed or already degraded
                Err(Error::Conflict(_)) | Err(Error::NotFound(_)) => {
                    debug!(connection = %key.connection_id, "Handshake settled before deadline")
                }
                Err(e) => warn!(
                    connection = %key.connection_id,
                    "Handshake deadline could not update registration: {}", e
                ),
            }
        });
    }

    /// Attach the push stream, completing the handshake
    ///
    /// A connection already in `Pushing` may re-attach (client reconnect);
    /// the previous stream on this node is cancelled. Degraded connections
    /// must renegotiate.
    pub async fn attach_push(&self, key: &ConnectionKey) -> Result<PushAttachment> {
        let current = self.registry.require(key).await?;
        let registration = match current.state {
            ConnectionState::Negotiating => {
                self.registry
                    .transition_from(
                        key,
                        Some(ConnectionState::Negotiating),
                        ConnectionState::Pushing,
                    )
                    .await?
            }
            ConnectionState::Pushing => self.registry.observe(key, None).await?,
            ConnectionState::Closed => {
                return Err(Error::NotFound(format!("connection {}", key.connection_id)))
            }
            state => {
                return Err(Error::Conflict(format!(
                    "connection is {:?}; push requires a fresh negotiation",
                    state
                )))
            }
        };

        let token = self.shutdown.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .streams()
            .insert(key.connection_id, (generation, token.clone()));
        if let Some((_, old)) = previous {
            debug!(connection = %key.connection_id, "Replacing existing push stream");
            old.cancel();
        }
        Ok(PushAttachment {
            registration,
            token,
            generation,
        })
    }

    /// Forget a finished push stream unless a newer one replaced it
    ///
    /// Returns whether this attachment was still the live one.
    pub fn release_push(&self, connection: &ConnectionId, attachment: &PushAttachment) -> bool {
        let mut streams = self.streams();
        let current = streams
            .get(connection)
            .is_some_and(|(generation, _)| *generation == attachment.generation);
        if current {
            streams.remove(connection);
        }
        current
    }

    fn cancel_push(&self, connection: &ConnectionId) {
        if let Some((_, token)) = self.streams().remove(connection) {
            token.cancel();
        }
    }

    fn streams(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, (u64, CancellationToken)>> {
        // A poisoned map only holds tokens; keep using it
        self.push_streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Push streams this node is serving
    pub fn local_push_streams(&self) -> usize {
        self.streams().len()
    }

    /// Apply a client-observed failure of the current mode
    pub async fn fallback(&self, key: &ConnectionKey, reason: &str) -> Result<FallbackOutcome> {
        let current = self.registry.require(key).await?;
        match current.state.downgrade() {
            Some(next) => {
                self.cancel_push(&key.connection_id);
                let registration = self
                    .registry
                    .transition_from(key, Some(current.state), next)
                    .await?;
                warn!(
                    connection = %key.connection_id,
                    from = ?current.state,
                    to = ?next,
                    reason,
                    "Transport fallback"
                );
                Ok(FallbackOutcome::Degraded(registration))
            }
            None => {
                warn!(
                    connection = %key.connection_id,
                    reason,
                    "All transports exhausted, manual refresh required"
                );
                self.close(key).await?;
                Ok(FallbackOutcome::Exhausted)
            }
        }
    }

    /// Cancel any local push stream and delete the registration
    pub async fn close(&self, key: &ConnectionKey) -> Result<bool> {
        self.cancel_push(&key.connection_id);
        self.registry.remove(key).await
    }

    /// Client acknowledgement; stale or repeated cursors are no-ops
    pub async fn ack(&self, key: &ConnectionKey, cursor: u64) -> Result<ConnectionRegistration> {
        self.registry.observe(key, Some(cursor)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::EventLog;
    use huddle_common::config::EventLogConfig;
    use huddle_common::store::MemoryStore;
    use std::time::Duration;

    fn negotiator(handshake_secs: u64) -> Negotiator {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(EventLog::new(store.clone(), &EventLogConfig::default(), "node-a"));
        let registry = Arc::new(ConnectionRegistry::new(store, events, Duration::from_secs(60)));
        let config = TransportConfig {
            handshake_timeout_secs: handshake_secs,
            ..TransportConfig::default()
        };
        Negotiator::new(registry, config, CancellationToken::new())
    }

    fn ids() -> (TenantId, UserId) {
        (TenantId::new("acme"), UserId::new("alice"))
    }

    #[tokio::test]
    async fn test_attach_completes_handshake() {
        let negotiator = negotiator(10);
        let (tenant, user) = ids();
        let reg = negotiator.open(&tenant, &user, Capabilities::default()).await.unwrap();
        assert_eq!(reg.state, ConnectionState::Negotiating);

        let attachment = negotiator.attach_push(&reg.key()).await.unwrap();
        assert_eq!(attachment.registration.state, ConnectionState::Pushing);
        assert_eq!(negotiator.local_push_streams(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_deadline_falls_back_to_long_polling() {
        let negotiator = negotiator(10);
        let (tenant, user) = ids();
        let reg = negotiator.open(&tenant, &user, Capabilities::default()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        // Let the deadline task finish its store update
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let current = negotiator.registry().require(&reg.key()).await.unwrap();
        assert_eq!(current.state, ConnectionState::LongPolling);
        let late = negotiator.attach_push(&reg.key()).await;
        assert!(matches!(late, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_fallback_cascade_ends_exhausted() {
        let negotiator = negotiator(10);
        let (tenant, user) = ids();
        let reg = negotiator.open(&tenant, &user, Capabilities::default()).await.unwrap();
        let key = reg.key();
        let attachment = negotiator.attach_push(&key).await.unwrap();

        let first = negotiator.fallback(&key, "stream blocked").await.unwrap();
        assert!(matches!(
            first,
            FallbackOutcome::Degraded(ref r) if r.state == ConnectionState::LongPolling
        ));
        assert!(attachment.token.is_cancelled());

        let second = negotiator.fallback(&key, "proxy timeout").await.unwrap();
        assert!(matches!(
            second,
            FallbackOutcome::Degraded(ref r) if r.state == ConnectionState::ShortPolling
        ));

        let last = negotiator.fallback(&key, "nothing works").await.unwrap();
        assert_eq!(last, FallbackOutcome::Exhausted);
        assert!(negotiator.registry().get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reattach_replaces_previous_stream() {
        let negotiator = negotiator(10);
        let (tenant, user) = ids();
        let reg = negotiator.open(&tenant, &user, Capabilities::default()).await.unwrap();

        let first = negotiator.attach_push(&reg.key()).await.unwrap();
        let second = negotiator.attach_push(&reg.key()).await.unwrap();
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());

        // Releasing the stale stream must not drop the live one
        assert!(!negotiator.release_push(&reg.connection_id, &first));
        assert_eq!(negotiator.local_push_streams(), 1);
        assert!(negotiator.release_push(&reg.connection_id, &second));
        assert_eq!(negotiator.local_push_streams(), 0);
    }

    #[tokio::test]
    async fn test_close_cancels_and_removes() {
        let negotiator = negotiator(10);
        let (tenant, user) = ids();
        let reg = negotiator.open(&tenant, &user, Capabilities::default()).await.unwrap();
        let attachment = negotiator.attach_push(&reg.key()).await.unwrap();

        assert!(negotiator.close(&reg.key()).await.unwrap());
        assert!(attachment.token.is_cancelled());
        assert!(!negotiator.close(&reg.key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_redundant_acks_are_harmless() {
        let negotiator = negotiator(10);
        let (tenant, user) = ids();
        let caps = Capabilities {
            supports_push: false,
            supports_long_poll: true,
        };
        let reg = negotiator.open(&tenant, &user, caps).await.unwrap();
        let key = reg.key();

        assert_eq!(negotiator.ack(&key, 7).await.unwrap().cursor, 7);
        assert_eq!(negotiator.ack(&key, 7).await.unwrap().cursor, 7);
        assert_eq!(negotiator.ack(&key, 3).await.unwrap().cursor, 7);
    }
}
