//! Shared State Store
//!
//! The only source of truth shared by huddle nodes. Two traits:
//! - [`StateStore`]: TTL-capable key/value documents with atomic per-key
//!   read-modify-write
//! - [`LogStore`]: bounded per-(tenant, user) event logs with atomic append
//!   and a global append order for cross-node fan-out
//!
//! Backends: [`MemoryStore`] (single process) and [`SqliteStore`] (shared by
//! every node on a host). [`ResilientStore`] bounds and retries any backend.
//! Every operation is fallible; callers degrade rather than block.

pub mod keys;
mod memory;
mod resilient;
#[cfg(feature = "sqlx")]
mod sqlite;

pub use memory::MemoryStore;
pub use resilient::{ResilientStore, RetryPolicy};
#[cfg(feature = "sqlx")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::events::{Event, NewEvent, Topic};
use crate::ids::TenantId;
use crate::Result;

/// Stored document with its write version
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub value: Value,
    /// Starts at 1, incremented on every write
    pub version: u64,
    /// Absolute expiry in ms since the epoch; `None` never expires
    pub expires_at: Option<i64>,
}

/// Read-modify-write callback for [`StateStore::update`]
///
/// Receives the live value (`None` when absent or expired) and returns the
/// value to store. Returning an error aborts the update with no write. May be
/// invoked more than once when the backend retries a lost race.
pub type Mutator<'a> = dyn FnMut(Option<&Value>) -> Result<Value> + Send + 'a;

/// TTL-capable versioned key/value store
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Unconditional write; `ttl: None` never expires
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<Versioned>;

    /// Create-if-absent; `Error::Conflict` when a live value exists
    async fn insert(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<Versioned>;

    /// Live value, or `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Atomic read-modify-write, last writer wins
    ///
    /// `ttl: Some` restarts the expiry clock; `None` keeps the current expiry.
    async fn update(
        &self,
        key: &str,
        ttl: Option<Duration>,
        mutator: &mut Mutator<'_>,
    ) -> Result<Versioned>;

    /// Returns whether a live value was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All live entries whose key starts with `prefix`, in key order
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;

    /// Physically remove expired entries; returns how many were removed
    async fn sweep_expired(&self) -> Result<u64>;
}

/// Slice of one user's log
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogSlice {
    /// Events with id > cursor, ascending, at most `limit`
    pub events: Vec<Event>,
    /// Smallest id still retained (`None` for an empty log)
    pub oldest_id: Option<u64>,
    /// Last id ever assigned in this log (0 if none)
    pub head_id: u64,
}

/// One entry of the global append order
#[derive(Debug, Clone, PartialEq)]
pub struct TailEntry {
    pub seq: u64,
    pub topic: Topic,
    pub event: Event,
}

/// Bounded per-user event logs
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Atomically assign the next id, store the event and evict beyond `capacity`
    ///
    /// Concurrent appends to the same topic are linearized by the backend.
    async fn append(
        &self,
        topic: &Topic,
        event: NewEvent,
        origin_node: &str,
        capacity: usize,
    ) -> Result<Event>;

    /// Events with id > `cursor`, plus retention bounds
    async fn read_since(&self, topic: &Topic, cursor: u64, limit: usize) -> Result<LogSlice>;

    /// Last id ever assigned in `topic` (0 if none)
    async fn head(&self, topic: &Topic) -> Result<u64> {
        Ok(self.read_since(topic, u64::MAX, 0).await?.head_id)
    }

    /// Appends across all topics with global sequence > `after_seq`, ascending
    async fn tail(&self, after_seq: u64, limit: usize) -> Result<Vec<TailEntry>>;

    /// Current highest global sequence
    async fn tail_head(&self) -> Result<u64>;
}

/// Both faces of one backend, shared by every service of a node
#[derive(Clone)]
pub struct Stores {
    pub state: Arc<dyn StateStore>,
    pub log: Arc<dyn LogStore>,
}

impl Stores {
    pub fn new<S: StateStore + LogStore + 'static>(store: S) -> Self {
        Self::from_arc(Arc::new(store))
    }

    pub fn from_arc<S: StateStore + LogStore + 'static>(store: Arc<S>) -> Self {
        Self {
            state: store.clone(),
            log: store,
        }
    }

    /// Fresh in-process store without the retry layer
    pub fn memory() -> Self {
        Self::new(MemoryStore::new())
    }
}

/// Typed view of a [`Versioned`] document
#[derive(Debug, Clone, PartialEq)]
pub struct Typed<T> {
    pub value: T,
    pub version: u64,
    pub expires_at: Option<i64>,
}

impl<T: DeserializeOwned> Typed<T> {
    fn decode(doc: Versioned) -> Result<Self> {
        Ok(Self {
            value: serde_json::from_value(doc.value)?,
            version: doc.version,
            expires_at: doc.expires_at,
        })
    }
}

pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<Typed<T>>> {
    store.get(key).await?.map(Typed::decode).transpose()
}

pub async fn put_typed<T: Serialize + Sync>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<u64> {
    let doc = store.put(key, serde_json::to_value(value)?, ttl).await?;
    Ok(doc.version)
}

pub async fn insert_typed<T: Serialize + Sync>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<u64> {
    let doc = store.insert(key, serde_json::to_value(value)?, ttl).await?;
    Ok(doc.version)
}

/// Typed read-modify-write; see [`StateStore::update`]
pub async fn update_typed<T, F>(
    store: &dyn StateStore,
    key: &str,
    ttl: Option<Duration>,
    mut f: F,
) -> Result<Typed<T>>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnMut(Option<T>) -> Result<T> + Send,
{
    let mut mutator = |current: Option<&Value>| -> Result<Value> {
        let current = current
            .map(|v| serde_json::from_value::<T>(v.clone()))
            .transpose()?;
        Ok(serde_json::to_value(f(current)?)?)
    };
    let doc = store.update(key, ttl, &mut mutator).await?;
    Typed::decode(doc)
}

/// Typed prefix scan; undecodable documents are skipped with a warning
pub async fn scan_typed<T: DeserializeOwned>(
    store: &dyn StateStore,
    prefix: &str,
) -> Result<Vec<(String, Typed<T>)>> {
    let entries = store.scan_prefix(prefix).await?;
    let mut out = Vec::with_capacity(entries.len());
    for (key, doc) in entries {
        match Typed::decode(doc) {
            Ok(typed) => out.push((key, typed)),
            Err(e) => warn!("Skipping undecodable document {}: {}", key, e),
        }
    }
    Ok(out)
}

/// Record that a tenant has state, so background sweepers can find it
pub async fn register_tenant(store: &dyn StateStore, tenant: &TenantId) -> Result<()> {
    store
        .put(&keys::tenant_registry_key(tenant), Value::Bool(true), None)
        .await?;
    Ok(())
}

/// Every tenant recorded by [`register_tenant`]
pub async fn registered_tenants(store: &dyn StateStore) -> Result<Vec<TenantId>> {
    Ok(store
        .scan_prefix(keys::TENANT_REGISTRY_PREFIX)
        .await?
        .into_iter()
        .filter_map(|(key, _)| {
            key.strip_prefix(keys::TENANT_REGISTRY_PREFIX)
                .map(TenantId::new)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        hits: u64,
    }

    #[tokio::test]
    async fn test_update_typed_creates_and_increments() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            update_typed(&store, "c", None, |cur: Option<Counter>| {
                let mut c = cur.unwrap_or(Counter { hits: 0 });
                c.hits += 1;
                Ok(c)
            })
            .await
            .unwrap();
        }
        let doc = get_typed::<Counter>(&store, "c").await.unwrap().unwrap();
        assert_eq!(doc.value.hits, 3);
        assert_eq!(doc.version, 3);
    }

    #[tokio::test]
    async fn test_update_typed_error_leaves_value_untouched() {
        let store = MemoryStore::new();
        put_typed(&store, "c", &Counter { hits: 5 }, None).await.unwrap();

        let result = update_typed(&store, "c", None, |_cur: Option<Counter>| {
            Err::<Counter, _>(Error::Validation("nope".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::Validation(_))));

        let doc = get_typed::<Counter>(&store, "c").await.unwrap().unwrap();
        assert_eq!(doc.value.hits, 5);
        assert_eq!(doc.version, 1);
    }

    #[tokio::test]
    async fn test_scan_typed_skips_garbage() {
        let store = MemoryStore::new();
        put_typed(&store, "p/a", &Counter { hits: 1 }, None).await.unwrap();
        store
            .put("p/b", serde_json::json!("not a counter"), None)
            .await
            .unwrap();
        let found = scan_typed::<Counter>(&store, "p/").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "p/a");
    }
}
