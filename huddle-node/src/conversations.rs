//! AI-assisted conversation sessions
//!
//! Every mutation is one atomic store update. Expiry and context version only
//! move forward. Completed and Expired conversations are soft-deleted: they
//! reject mutation and linger for a retention window before the TTL sweeper
//! removes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use huddle_common::events::{CollabEvent, ConversationStatus};
use huddle_common::ids::{is_valid_segment, ProductId, TenantId, UserId};
use huddle_common::store::{self, keys, StateStore};
use huddle_common::time::add_ttl;
use huddle_common::{Error, Result};

use crate::eventlog::EventLog;

/// How long finished conversations stay readable
const TERMINAL_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub status: ConversationStatus,
    pub participants: BTreeSet<UserId>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub context_version: u64,
    pub message_count: u64,
}

impl Conversation {
    fn ensure_mutable(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "conversation {} is {:?}",
                self.id, self.status
            )));
        }
        Ok(())
    }
}

/// Message appended to a conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostedMessage {
    pub message_id: Uuid,
    pub conversation: Conversation,
}

pub struct ConversationService {
    store: Arc<dyn StateStore>,
    events: Arc<EventLog>,
    ttl: Duration,
}

fn not_found(id: Uuid) -> Error {
    Error::NotFound(format!("conversation {id}"))
}

impl ConversationService {
    pub fn new(store: Arc<dyn StateStore>, events: Arc<EventLog>, ttl: Duration) -> Self {
        Self { store, events, ttl }
    }

    pub async fn start(
        &self,
        tenant: &TenantId,
        product: &ProductId,
        creator: &UserId,
    ) -> Result<Conversation> {
        if !is_valid_segment(product.as_str()) {
            return Err(Error::InvalidInput("product id must be a non-empty path segment".into()));
        }
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            tenant_id: tenant.clone(),
            product_id: product.clone(),
            status: ConversationStatus::Active,
            participants: BTreeSet::from([creator.clone()]),
            created_by: creator.clone(),
            created_at: now,
            expires_at: add_ttl(now, self.ttl),
            context_version: 0,
            message_count: 0,
        };
        store::insert_typed(
            self.store.as_ref(),
            &keys::conversation_key(tenant, conversation.id),
            &conversation,
            None,
        )
        .await?;
        store::register_tenant(self.store.as_ref(), tenant).await?;

        info!(
            tenant = %tenant,
            conversation = %conversation.id,
            product = %product,
            "Conversation started"
        );
        Ok(conversation)
    }

    pub async fn get(&self, tenant: &TenantId, id: Uuid) -> Result<Option<Conversation>> {
        Ok(
            store::get_typed::<Conversation>(self.store.as_ref(), &keys::conversation_key(tenant, id))
                .await?
                .map(|doc| doc.value),
        )
    }

    /// Apply `f` to a live (non-terminal) conversation in one atomic update
    async fn mutate<F>(
        &self,
        tenant: &TenantId,
        id: Uuid,
        ttl: Option<Duration>,
        mut f: F,
    ) -> Result<Conversation>
    where
        F: FnMut(&mut Conversation) -> Result<()> + Send,
    {
        let doc = store::update_typed(
            self.store.as_ref(),
            &keys::conversation_key(tenant, id),
            ttl,
            |current: Option<Conversation>| {
                let mut conversation = current.ok_or_else(|| not_found(id))?;
                conversation.ensure_mutable()?;
                f(&mut conversation)?;
                Ok(conversation)
            },
        )
        .await?;
        Ok(doc.value)
    }

    /// Add a participant; joining twice is a no-op
    pub async fn join(&self, tenant: &TenantId, id: Uuid, user: &UserId) -> Result<Conversation> {
        let mut added = false;
        let conversation = self
            .mutate(tenant, id, None, |c| {
                added = c.participants.insert(user.clone());
                Ok(())
            })
            .await?;

        if added {
            self.events
                .notify(
                    tenant,
                    conversation.participants.iter(),
                    &CollabEvent::ParticipantJoined {
                        conversation_id: id,
                        user_id: user.clone(),
                    },
                )
                .await;
        }
        Ok(conversation)
    }

    /// Remove a participant; the leaver is notified along with those who remain
    pub async fn leave(&self, tenant: &TenantId, id: Uuid, user: &UserId) -> Result<Conversation> {
        let mut removed = false;
        let conversation = self
            .mutate(tenant, id, None, |c| {
                removed = c.participants.remove(user);
                Ok(())
            })
            .await?;

        if removed {
            let audience: Vec<&UserId> = conversation
                .participants
                .iter()
                .chain(std::iter::once(user))
                .collect();
            self.events
                .notify(
                    tenant,
                    audience,
                    &CollabEvent::ParticipantLeft {
                        conversation_id: id,
                        user_id: user.clone(),
                    },
                )
                .await;
        }
        Ok(conversation)
    }

    /// Append a chat message; bumps the context version and notifies participants
    pub async fn append_message(
        &self,
        tenant: &TenantId,
        id: Uuid,
        author: &UserId,
        body: &str,
    ) -> Result<PostedMessage> {
        if body.trim().is_empty() {
            return Err(Error::Validation("message body must not be empty".into()));
        }
        let conversation = self
            .mutate(tenant, id, None, |c| {
                if !c.participants.contains(author) {
                    return Err(Error::Validation(format!(
                        "{author} is not a participant of {id}"
                    )));
                }
                c.message_count = c.message_count.saturating_add(1);
                c.context_version = c.context_version.saturating_add(1);
                Ok(())
            })
            .await?;

        let message_id = Uuid::new_v4();
        self.events
            .notify(
                tenant,
                conversation.participants.iter(),
                &CollabEvent::ChatMessage {
                    conversation_id: id,
                    message_id,
                    author_id: author.clone(),
                    body: body.to_string(),
                },
            )
            .await;
        Ok(PostedMessage {
            message_id,
            conversation,
        })
    }

    /// Strictly increase the context version
    pub async fn bump_context_version(&self, tenant: &TenantId, id: Uuid) -> Result<u64> {
        let conversation = self
            .mutate(tenant, id, None, |c| {
                c.context_version = c.context_version.saturating_add(1);
                Ok(())
            })
            .await?;

        self.events
            .notify(
                tenant,
                conversation.participants.iter(),
                &CollabEvent::ContextVersionBumped {
                    conversation_id: id,
                    context_version: conversation.context_version,
                },
            )
            .await;
        Ok(conversation.context_version)
    }

    /// Move expiry forward to `until`; earlier values leave it unchanged
    pub async fn extend(
        &self,
        tenant: &TenantId,
        id: Uuid,
        until: DateTime<Utc>,
    ) -> Result<Conversation> {
        let mut moved = false;
        let conversation = self
            .mutate(tenant, id, None, |c| {
                moved = until > c.expires_at;
                if moved {
                    c.expires_at = until;
                }
                Ok(())
            })
            .await?;

        if moved {
            self.events
                .notify(
                    tenant,
                    conversation.participants.iter(),
                    &CollabEvent::ConversationExtended {
                        conversation_id: id,
                        expires_at: conversation.expires_at,
                    },
                )
                .await;
        }
        Ok(conversation)
    }

    /// Explicit lifecycle change (pause, resume, complete)
    pub async fn set_status(
        &self,
        tenant: &TenantId,
        id: Uuid,
        next: ConversationStatus,
    ) -> Result<Conversation> {
        let mut previous = None;
        let ttl = next.is_terminal().then_some(TERMINAL_RETENTION);
        let conversation = self
            .mutate(tenant, id, ttl, |c| {
                if !c.status.can_transition_to(next) {
                    return Err(Error::Conflict(format!(
                        "cannot move conversation from {:?} to {:?}",
                        c.status, next
                    )));
                }
                previous = Some(c.status);
                c.status = next;
                Ok(())
            })
            .await?;

        if let Some(old_status) = previous {
            self.events
                .notify(
                    tenant,
                    conversation.participants.iter(),
                    &CollabEvent::ConversationStatusChanged {
                        conversation_id: id,
                        old_status,
                        new_status: next,
                    },
                )
                .await;
        }
        Ok(conversation)
    }

    /// Expire every Active/Paused conversation past its expiry; returns how many
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize> {
        let tenants = store::registered_tenants(self.store.as_ref()).await?;

        let mut expired = 0;
        for tenant in tenants {
            let conversations = store::scan_typed::<Conversation>(
                self.store.as_ref(),
                &keys::conversation_prefix(&tenant),
            )
            .await?;

            for (_, doc) in conversations {
                let c = doc.value;
                if c.status.is_terminal() || c.expires_at > now {
                    continue;
                }
                match self.expire_one(&tenant, c.id, now).await {
                    Ok(true) => expired += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Could not expire conversation {}: {}", c.id, e),
                }
            }
        }
        if expired > 0 {
            info!("Expired {} overdue conversations", expired);
        }
        Ok(expired)
    }

    async fn expire_one(&self, tenant: &TenantId, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut previous = None;
        let result = self
            .mutate(tenant, id, Some(TERMINAL_RETENTION), |c| {
                // Re-checked inside the update: an extension may have landed
                if c.expires_at > now {
                    return Err(Error::Conflict("extended meanwhile".into()));
                }
                previous = Some(c.status);
                c.status = ConversationStatus::Expired;
                Ok(())
            })
            .await;

        let conversation = match result {
            Ok(c) => c,
            Err(Error::Conflict(_)) | Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if let Some(old_status) = previous {
            self.events
                .notify(
                    tenant,
                    conversation.participants.iter(),
                    &CollabEvent::ConversationStatusChanged {
                        conversation_id: id,
                        old_status,
                        new_status: ConversationStatus::Expired,
                    },
                )
                .await;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::ReadOutcome;
    use huddle_common::config::EventLogConfig;
    use huddle_common::events::Topic;
    use huddle_common::store::MemoryStore;
    use proptest::prelude::*;

    fn service() -> (ConversationService, Arc<EventLog>) {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(EventLog::new(store.clone(), &EventLogConfig::default(), "node-a"));
        (
            ConversationService::new(store, events.clone(), Duration::from_secs(3600)),
            events,
        )
    }

    fn tenant() -> TenantId {
        TenantId::new("acme")
    }

    async fn event_types(events: &EventLog, user: &str) -> Vec<String> {
        let topic = Topic::new(tenant(), UserId::new(user));
        match events.read_since(&topic, 0, 100).await.unwrap() {
            ReadOutcome::Events { events, .. } => events.into_iter().map(|e| e.event_type).collect(),
            ReadOutcome::Resync { .. } => panic!("unexpected resync"),
        }
    }

    #[tokio::test]
    async fn test_message_reaches_every_participant() {
        let (conversations, events) = service();
        let c = conversations
            .start(&tenant(), &ProductId::new("p1"), &UserId::new("alice"))
            .await
            .unwrap();
        conversations.join(&tenant(), c.id, &UserId::new("bob")).await.unwrap();

        let posted = conversations
            .append_message(&tenant(), c.id, &UserId::new("alice"), "hello")
            .await
            .unwrap();
        assert_eq!(posted.conversation.context_version, 1);
        assert_eq!(posted.conversation.message_count, 1);

        assert_eq!(
            event_types(&events, "alice").await,
            vec!["ParticipantJoined", "ChatMessage"]
        );
        assert_eq!(
            event_types(&events, "bob").await,
            vec!["ParticipantJoined", "ChatMessage"]
        );
    }

    #[tokio::test]
    async fn test_non_participant_cannot_post() {
        let (conversations, _) = service();
        let c = conversations
            .start(&tenant(), &ProductId::new("p1"), &UserId::new("alice"))
            .await
            .unwrap();
        let result = conversations
            .append_message(&tenant(), c.id, &UserId::new("mallory"), "hi")
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        let unchanged = conversations.get(&tenant(), c.id).await.unwrap().unwrap();
        assert_eq!(unchanged.message_count, 0);
    }

    #[tokio::test]
    async fn test_extend_never_moves_backwards() {
        let (conversations, _) = service();
        let c = conversations
            .start(&tenant(), &ProductId::new("p1"), &UserId::new("alice"))
            .await
            .unwrap();
        let later = c.expires_at + chrono::Duration::hours(1);
        let extended = conversations.extend(&tenant(), c.id, later).await.unwrap();
        assert_eq!(extended.expires_at, later);

        let earlier = c.expires_at - chrono::Duration::hours(1);
        let unchanged = conversations.extend(&tenant(), c.id, earlier).await.unwrap();
        assert_eq!(unchanged.expires_at, later);
    }

    #[tokio::test]
    async fn test_completed_conversation_rejects_mutation() {
        let (conversations, _) = service();
        let c = conversations
            .start(&tenant(), &ProductId::new("p1"), &UserId::new("alice"))
            .await
            .unwrap();
        conversations
            .set_status(&tenant(), c.id, ConversationStatus::Completed)
            .await
            .unwrap();
        assert!(matches!(
            conversations.join(&tenant(), c.id, &UserId::new("bob")).await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            conversations
                .set_status(&tenant(), c.id, ConversationStatus::Active)
                .await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_expire_overdue() {
        let (conversations, events) = service();
        let c = conversations
            .start(&tenant(), &ProductId::new("p1"), &UserId::new("alice"))
            .await
            .unwrap();
        assert_eq!(conversations.expire_overdue(Utc::now()).await.unwrap(), 0);

        let future = c.expires_at + chrono::Duration::seconds(1);
        assert_eq!(conversations.expire_overdue(future).await.unwrap(), 1);
        let expired = conversations.get(&tenant(), c.id).await.unwrap().unwrap();
        assert_eq!(expired.status, ConversationStatus::Expired);
        assert_eq!(
            event_types(&events, "alice").await,
            vec!["ConversationStatusChanged"]
        );

        // Second pass finds nothing
        assert_eq!(conversations.expire_overdue(future).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_context_version_is_strictly_increasing() {
        let (conversations, _) = service();
        let c = conversations
            .start(&tenant(), &ProductId::new("p1"), &UserId::new("alice"))
            .await
            .unwrap();
        let v1 = conversations.bump_context_version(&tenant(), c.id).await.unwrap();
        let v2 = conversations.bump_context_version(&tenant(), c.id).await.unwrap();
        assert!(v2 > v1);
    }

    proptest! {
        #[test]
        fn prop_expiry_is_non_decreasing(offsets in proptest::collection::vec(-7200i64..7200, 1..20)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let (conversations, _) = service();
                let c = conversations
                    .start(&tenant(), &ProductId::new("p1"), &UserId::new("alice"))
                    .await
                    .unwrap();
                let mut last = c.expires_at;
                for offset in offsets {
                    let until = c.expires_at + chrono::Duration::seconds(offset);
                    let next = conversations.extend(&tenant(), c.id, until).await.unwrap();
                    prop_assert!(next.expires_at >= last);
                    last = next.expires_at;
                }
                Ok(())
            })?;
        }
    }
}
