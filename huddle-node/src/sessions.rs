//! Browser sessions
//!
//! Created by the login hook, refreshed on every authenticated request,
//! removed on logout or when the TTL lapses. A session's tenant never changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use huddle_common::ids::{is_valid_segment, TenantId, UserId};
use huddle_common::store::{self, keys, StateStore};
use huddle_common::time::add_ttl;
use huddle_common::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub preferences: Map<String, Value>,
}

pub struct SessionService {
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

impl SessionService {
    pub fn new(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn create(
        &self,
        tenant: TenantId,
        user: UserId,
        preferences: Map<String, Value>,
    ) -> Result<Session> {
        if !is_valid_segment(tenant.as_str()) || !is_valid_segment(user.as_str()) {
            return Err(Error::InvalidInput("tenant and user ids must be non-empty path segments".into()));
        }
        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4().simple().to_string(),
            tenant_id: tenant,
            user_id: user,
            issued_at: now,
            expires_at: add_ttl(now, self.ttl),
            last_activity: now,
            preferences,
        };
        store::insert_typed(
            self.store.as_ref(),
            &keys::session_key(&session.session_id),
            &session,
            Some(self.ttl),
        )
        .await?;
        store::register_tenant(self.store.as_ref(), &session.tenant_id).await?;

        info!(
            tenant = %session.tenant_id,
            user = %session.user_id,
            "Session created"
        );
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(store::get_typed::<Session>(self.store.as_ref(), &keys::session_key(session_id))
            .await?
            .map(|doc| doc.value))
    }

    /// Refresh last-activity and slide the expiry; `NotFound` once expired
    pub async fn touch(&self, session_id: &str) -> Result<Session> {
        let ttl = self.ttl;
        let doc = store::update_typed(
            self.store.as_ref(),
            &keys::session_key(session_id),
            Some(ttl),
            |current: Option<Session>| {
                let mut session = current.ok_or_else(|| Error::NotFound("session".into()))?;
                let now = Utc::now();
                session.last_activity = now;
                session.expires_at = add_ttl(now, ttl);
                Ok(session)
            },
        )
        .await?;
        Ok(doc.value)
    }

    pub async fn set_preference(&self, session_id: &str, key: &str, value: Value) -> Result<Session> {
        let doc = store::update_typed(
            self.store.as_ref(),
            &keys::session_key(session_id),
            None,
            |current: Option<Session>| {
                let mut session = current.ok_or_else(|| Error::NotFound("session".into()))?;
                session.preferences.insert(key.to_string(), value.clone());
                Ok(session)
            },
        )
        .await?;
        Ok(doc.value)
    }

    /// Logout; returns whether a live session was removed
    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        self.store.delete(&keys::session_key(session_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_common::store::MemoryStore;
    use serde_json::json;

    fn service(ttl: Duration) -> SessionService {
        SessionService::new(Arc::new(MemoryStore::new()), ttl)
    }

    #[tokio::test]
    async fn test_create_touch_delete() {
        let sessions = service(Duration::from_secs(60));
        let created = sessions
            .create(TenantId::new("acme"), UserId::new("alice"), Map::new())
            .await
            .unwrap();

        let touched = sessions.touch(&created.session_id).await.unwrap();
        assert_eq!(touched.tenant_id, created.tenant_id);
        assert!(touched.last_activity >= created.last_activity);
        assert!(touched.expires_at >= created.expires_at);

        assert!(sessions.delete(&created.session_id).await.unwrap());
        assert!(matches!(
            sessions.touch(&created.session_id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_session_is_gone() {
        let sessions = service(Duration::from_millis(20));
        let created = sessions
            .create(TenantId::new("acme"), UserId::new("alice"), Map::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(sessions.get(&created.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_preferences_persist() {
        let sessions = service(Duration::from_secs(60));
        let created = sessions
            .create(TenantId::new("acme"), UserId::new("alice"), Map::new())
            .await
            .unwrap();
        sessions
            .set_preference(&created.session_id, "theme", json!("dark"))
            .await
            .unwrap();
        let read = sessions.get(&created.session_id).await.unwrap().unwrap();
        assert_eq!(read.preferences["theme"], json!("dark"));
    }

    #[tokio::test]
    async fn test_rejects_bad_identifiers() {
        let sessions = service(Duration::from_secs(60));
        assert!(matches!(
            sessions
                .create(TenantId::new("a/b"), UserId::new("alice"), Map::new())
                .await,
            Err(Error::InvalidInput(_))
        ));
    }
}
