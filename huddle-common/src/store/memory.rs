//! In-process store backend
//!
//! Single mutex over all state, so every operation is trivially atomic. Used
//! for single-node deployments and tests; several nodes in one process can
//! share one `Arc<MemoryStore>` and still fan out through [`LogStore::tail`].

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{LogSlice, LogStore, Mutator, StateStore, TailEntry, Versioned};
use crate::events::{Event, NewEvent, Topic};
use crate::time::{expiry_from_ttl, now, now_ms};
use crate::{Error, Result};

/// Global append order kept for tailing nodes
const DEFAULT_TAIL_RETENTION: usize = 10_000;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    version: u64,
    expires_at: Option<i64>,
}

impl Entry {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at.map_or(true, |at| at > now_ms)
    }

    fn to_versioned(&self) -> Versioned {
        Versioned {
            value: self.value.clone(),
            version: self.version,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, Default)]
struct TopicLog {
    events: VecDeque<Event>,
    head: u64,
}

#[derive(Debug, Default)]
struct Inner {
    kv: BTreeMap<String, Entry>,
    logs: HashMap<Topic, TopicLog>,
    tail: VecDeque<TailEntry>,
    next_seq: u64,
}

impl Inner {
    fn live(&self, key: &str, now_ms: i64) -> Option<&Entry> {
        self.kv.get(key).filter(|e| e.is_live(now_ms))
    }

    /// Version continues from a physically present (possibly expired) entry
    fn write(&mut self, key: &str, value: Value, expires_at: Option<i64>) -> Versioned {
        let version = self.kv.get(key).map_or(1, |e| e.version + 1);
        let entry = Entry {
            value,
            version,
            expires_at,
        };
        let out = entry.to_versioned();
        self.kv.insert(key.to_string(), entry);
        out
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    tail_retention: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_tail_retention(DEFAULT_TAIL_RETENTION)
    }

    pub fn with_tail_retention(tail_retention: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            tail_retention: tail_retention.max(1),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<Versioned> {
        let mut inner = self.inner.lock().await;
        Ok(inner.write(key, value, expiry_from_ttl(ttl)))
    }

    async fn insert(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<Versioned> {
        let mut inner = self.inner.lock().await;
        if inner.live(key, now_ms()).is_some() {
            return Err(Error::Conflict(format!("key already exists: {key}")));
        }
        Ok(inner.write(key, value, expiry_from_ttl(ttl)))
    }

    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let inner = self.inner.lock().await;
        Ok(inner.live(key, now_ms()).map(Entry::to_versioned))
    }

    async fn update(
        &self,
        key: &str,
        ttl: Option<Duration>,
        mutator: &mut Mutator<'_>,
    ) -> Result<Versioned> {
        let mut inner = self.inner.lock().await;
        let current = inner.live(key, now_ms()).cloned();
        let next = mutator(current.as_ref().map(|e| &e.value))?;
        let expires_at = match ttl {
            Some(ttl) => expiry_from_ttl(Some(ttl)),
            None => current.and_then(|e| e.expires_at),
        };
        Ok(inner.write(key, next, expires_at))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let removed = inner.kv.remove(key);
        Ok(removed.is_some_and(|e| e.is_live(now_ms())))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let inner = self.inner.lock().await;
        let now = now_ms();
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, e)| (k.clone(), e.to_versioned()))
            .collect())
    }

    async fn sweep_expired(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let now = now_ms();
        let before = inner.kv.len();
        inner.kv.retain(|_, e| e.is_live(now));
        Ok((before - inner.kv.len()) as u64)
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn append(
        &self,
        topic: &Topic,
        event: NewEvent,
        origin_node: &str,
        capacity: usize,
    ) -> Result<Event> {
        let mut inner = self.inner.lock().await;
        let log = inner.logs.entry(topic.clone()).or_default();
        log.head += 1;
        let stored = Event {
            id: log.head,
            event_type: event.event_type,
            payload: event.payload,
            origin_node: origin_node.to_string(),
            timestamp: now(),
        };
        log.events.push_back(stored.clone());
        while log.events.len() > capacity.max(1) {
            log.events.pop_front();
        }

        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.tail.push_back(TailEntry {
            seq,
            topic: topic.clone(),
            event: stored.clone(),
        });
        while inner.tail.len() > self.tail_retention {
            inner.tail.pop_front();
        }
        Ok(stored)
    }

    async fn read_since(&self, topic: &Topic, cursor: u64, limit: usize) -> Result<LogSlice> {
        let inner = self.inner.lock().await;
        let Some(log) = inner.logs.get(topic) else {
            return Ok(LogSlice::default());
        };
        Ok(LogSlice {
            events: log
                .events
                .iter()
                .filter(|e| e.id > cursor)
                .take(limit)
                .cloned()
                .collect(),
            oldest_id: log.events.front().map(|e| e.id),
            head_id: log.head,
        })
    }

    async fn tail(&self, after_seq: u64, limit: usize) -> Result<Vec<TailEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tail
            .iter()
            .filter(|e| e.seq > after_seq)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn tail_head(&self) -> Result<u64> {
        Ok(self.inner.lock().await.next_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{TenantId, UserId};
    use serde_json::json;
    use std::sync::Arc;

    fn topic(user: &str) -> Topic {
        Topic::new(TenantId::new("acme"), UserId::new(user))
    }

    #[tokio::test]
    async fn test_put_get_versions() {
        let store = MemoryStore::new();
        assert_eq!(store.put("k", json!(1), None).await.unwrap().version, 1);
        assert_eq!(store.put("k", json!(2), None).await.unwrap().version, 2);
        let doc = store.get("k").await.unwrap().unwrap();
        assert_eq!(doc.value, json!(2));
        assert_eq!(doc.expires_at, None);
    }

    #[tokio::test]
    async fn test_insert_conflicts_on_live_key() {
        let store = MemoryStore::new();
        store.insert("k", json!("a"), None).await.unwrap();
        assert!(matches!(
            store.insert("k", json!("b"), None).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_key_is_absent_and_reinsertable() {
        let store = MemoryStore::new();
        store
            .put("k", json!(1), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.scan_prefix("k").await.unwrap().is_empty());
        assert!(!store.delete("k").await.unwrap());

        store.put("k", json!(1), Some(Duration::from_millis(20))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.insert("k", json!(2), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().value, json!(2));
    }

    #[tokio::test]
    async fn test_update_keeps_expiry_without_ttl() {
        let store = MemoryStore::new();
        let first = store
            .put("k", json!(1), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let updated = store
            .update("k", None, &mut |_cur: Option<&Value>| -> Result<Value> { Ok(json!(2)) })
            .await
            .unwrap();
        assert_eq!(updated.expires_at, first.expires_at);

        let refreshed = store
            .update("k", Some(Duration::from_secs(120)), &mut |_cur: Option<&Value>| -> Result<Value> { Ok(json!(3)) })
            .await
            .unwrap();
        assert!(refreshed.expires_at > first.expires_at);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let store = MemoryStore::new();
        store.put("a", json!(1), Some(Duration::from_millis(10))).await.unwrap();
        store.put("b", json!(1), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert!(store.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_scan_prefix_does_not_leak_siblings() {
        let store = MemoryStore::new();
        store.put("t/acme/x", json!(1), None).await.unwrap();
        store.put("t/acme/y", json!(2), None).await.unwrap();
        store.put("t/acme2/x", json!(3), None).await.unwrap();
        let keys: Vec<_> = store
            .scan_prefix("t/acme/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["t/acme/x", "t/acme/y"]);
    }

    #[tokio::test]
    async fn test_concurrent_updates_lose_nothing() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update("n", None, &mut |cur: Option<&Value>| -> Result<Value> {
                        Ok(json!(cur.and_then(Value::as_u64).unwrap_or(0) + 1))
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get("n").await.unwrap().unwrap().value, json!(20));
    }

    #[tokio::test]
    async fn test_append_assigns_ids_and_trims() {
        let store = MemoryStore::new();
        let t = topic("alice");
        for i in 1..=5u64 {
            let e = store
                .append(&t, NewEvent::new("Ping", json!({ "n": i })), "node-a", 3)
                .await
                .unwrap();
            assert_eq!(e.id, i);
        }
        let slice = store.read_since(&t, 0, 100).await.unwrap();
        assert_eq!(slice.oldest_id, Some(3));
        assert_eq!(slice.head_id, 5);
        assert_eq!(
            slice.events.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
    }

    #[tokio::test]
    async fn test_logs_are_independent_per_topic() {
        let store = MemoryStore::new();
        store.append(&topic("a"), NewEvent::new("X", json!({})), "n", 10).await.unwrap();
        let e = store.append(&topic("b"), NewEvent::new("X", json!({})), "n", 10).await.unwrap();
        assert_eq!(e.id, 1);

        let other_tenant = Topic::new(TenantId::new("globex"), UserId::new("a"));
        assert!(store.read_since(&other_tenant, 0, 10).await.unwrap().events.is_empty());
    }

    #[tokio::test]
    async fn test_tail_follows_global_order() {
        let store = MemoryStore::new();
        store.append(&topic("a"), NewEvent::new("X", json!({})), "n1", 10).await.unwrap();
        store.append(&topic("b"), NewEvent::new("Y", json!({})), "n2", 10).await.unwrap();
        assert_eq!(store.tail_head().await.unwrap(), 2);

        let entries = store.tail(1, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].topic, topic("b"));
        assert_eq!(entries[0].event.origin_node, "n2");
    }

    #[tokio::test]
    async fn test_concurrent_appends_get_unique_ids() {
        let store = Arc::new(MemoryStore::new());
        let t = topic("alice");
        let mut handles = Vec::new();
        for _ in 0..25 {
            let store = Arc::clone(&store);
            let t = t.clone();
            handles.push(tokio::spawn(async move {
                store.append(&t, NewEvent::new("X", json!({})), "n", 100).await.unwrap().id
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=25).collect::<Vec<_>>());
    }
}
