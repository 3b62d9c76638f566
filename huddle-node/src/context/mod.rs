//! Context Retrieval & Eviction Engine
//!
//! Conversation fragments with embeddings, partitioned by (tenant, product).
//! Queries rank by a blended score and touch every hit. Eviction is soft:
//! pruned fragments stay queryable at a penalty until their grace period
//! ends, then garbage collection deletes them. Touch, evict and collect may
//! run concurrently on any node; each fragment change is one atomic update.

pub mod embedder;
pub mod scoring;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_common::config::ContextConfig;
use huddle_common::ids::{is_valid_segment, ProductId, TenantId};
use huddle_common::store::{self, keys, StateStore};
use huddle_common::{Error, Result};

pub use embedder::{Embedder, HashingEmbedder};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextFragment {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    /// Where the fragment came from (conversation turn, document section)
    pub source_ref: String,
    #[serde(default)]
    pub text: Option<String>,
    pub embedding: Vec<f32>,
    /// Blended score at the last query that returned it
    #[serde(default)]
    pub relevance: f64,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub access_count: u64,
    #[serde(default)]
    pub pruned: bool,
    #[serde(default)]
    pub pruned_at: Option<DateTime<Utc>>,
}

impl ContextFragment {
    /// Pruned and past the grace period: invisible and collectable
    fn is_expired(&self, grace: Duration, now: DateTime<Utc>) -> bool {
        match (self.pruned, self.pruned_at) {
            (true, Some(at)) => elapsed(at, now) >= grace,
            (true, None) => true,
            (false, _) => false,
        }
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// Input to [`ContextEngine::index`]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFragment {
    pub source_ref: String,
    #[serde(default)]
    pub text: Option<String>,
    /// Embedded from `text` when absent
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum QueryInput {
    Vector { vector: Vec<f32> },
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextQuery {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub input: QueryInput,
    pub k: usize,
    /// Overrides the configured threshold
    pub min_similarity: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredFragment {
    pub fragment: ContextFragment,
    pub similarity: f32,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionReport {
    pub live_before: usize,
    pub pruned: Vec<Uuid>,
    pub live_after: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub pruned: usize,
    pub collected: usize,
}

pub struct ContextEngine {
    store: Arc<dyn StateStore>,
    embedder: Arc<dyn Embedder>,
    config: ContextConfig,
}

impl ContextEngine {
    pub fn new(store: Arc<dyn StateStore>, embedder: Arc<dyn Embedder>, config: ContextConfig) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    /// Engine with the built-in hashing embedder
    pub fn with_hashing(store: Arc<dyn StateStore>, config: ContextConfig) -> Self {
        let embedder = Arc::new(HashingEmbedder::new(config.embedding_dim));
        Self::new(store, embedder, config)
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.config.grace_period_secs)
    }

    fn half_life(&self) -> Duration {
        Duration::from_secs(self.config.recency_half_life_secs)
    }

    pub async fn index(
        &self,
        tenant: &TenantId,
        product: &ProductId,
        fragment: NewFragment,
    ) -> Result<ContextFragment> {
        if !is_valid_segment(product.as_str()) {
            return Err(Error::InvalidInput("product id must be a non-empty path segment".into()));
        }
        let embedding = match (fragment.embedding, fragment.text.as_deref()) {
            (Some(vector), _) => vector,
            (None, Some(text)) => self.embedder.embed(text),
            (None, None) => {
                return Err(Error::InvalidInput(
                    "fragment needs an embedding or text".into(),
                ))
            }
        };
        if embedding.is_empty() || embedding.iter().any(|x| !x.is_finite()) {
            return Err(Error::InvalidInput("embedding must be non-empty and finite".into()));
        }

        let now = Utc::now();
        let fragment = ContextFragment {
            id: Uuid::new_v4(),
            tenant_id: tenant.clone(),
            product_id: product.clone(),
            source_ref: fragment.source_ref,
            text: fragment.text,
            embedding,
            relevance: 0.0,
            created_at: now,
            last_access: now,
            access_count: 0,
            pruned: false,
            pruned_at: None,
        };
        store::insert_typed(
            self.store.as_ref(),
            &keys::fragment_key(tenant, product, fragment.id),
            &fragment,
            None,
        )
        .await?;
        store::register_tenant(self.store.as_ref(), tenant).await?;
        debug!(tenant = %tenant, product = %product, fragment = %fragment.id, "Fragment indexed");
        Ok(fragment)
    }

    /// Top-k fragments above the similarity threshold
    ///
    /// A query that exceeds its time budget returns an empty result.
    pub async fn query(&self, query: ContextQuery) -> Result<Vec<ScoredFragment>> {
        let budget = Duration::from_millis(self.config.query_timeout_ms);
        let ranked = match tokio::time::timeout(budget, self.rank(&query)).await {
            Ok(ranked) => ranked?,
            Err(_) => {
                warn!(
                    tenant = %query.tenant_id,
                    product = %query.product_id,
                    budget_ms = self.config.query_timeout_ms,
                    "Context query timed out, returning no fragments"
                );
                return Ok(Vec::new());
            }
        };

        let mut hits = Vec::with_capacity(ranked.len());
        for mut hit in ranked {
            let id = hit.fragment.id;
            match self
                .record_hit(&query.tenant_id, &query.product_id, id, Some(hit.score))
                .await
            {
                Ok(touched) => hit.fragment = touched,
                // Collected meanwhile, or the store hiccuped; still a valid hit
                Err(e) => {
                    debug!(fragment = %id, "Touch after query failed: {}", e);
                    hit.fragment.relevance = hit.score;
                }
            }
            hits.push(hit);
        }
        Ok(hits)
    }

    async fn rank(&self, query: &ContextQuery) -> Result<Vec<ScoredFragment>> {
        let vector = match &query.input {
            QueryInput::Vector { vector } => vector.clone(),
            QueryInput::Text { text } => self.embedder.embed(text),
        };
        let threshold = query.min_similarity.unwrap_or(self.config.min_similarity);
        let now = Utc::now();
        let grace = self.grace();
        let half_life = self.half_life();

        let fragments = store::scan_typed::<ContextFragment>(
            self.store.as_ref(),
            &keys::fragment_prefix(&query.tenant_id, &query.product_id),
        )
        .await?;

        let mut scored: Vec<ScoredFragment> = fragments
            .into_iter()
            .map(|(_, doc)| doc.value)
            .filter(|f| !f.is_expired(grace, now))
            .filter_map(|fragment| {
                let similarity = scoring::cosine(&vector, &fragment.embedding)?;
                if similarity < threshold {
                    return None;
                }
                let age = elapsed(fragment.last_access, now);
                let mut score =
                    scoring::blended_score(similarity, age, half_life, fragment.access_count);
                if fragment.pruned {
                    score *= f64::from(self.config.pruned_penalty);
                }
                Some(ScoredFragment {
                    fragment,
                    similarity,
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.fragment.last_access.cmp(&a.fragment.last_access))
        });
        scored.truncate(query.k);
        Ok(scored)
    }

    /// Count a retrieval hit
    ///
    /// A pruned fragment still inside its grace period is restored.
    pub async fn touch(&self, tenant: &TenantId, product: &ProductId, id: Uuid) -> Result<ContextFragment> {
        self.record_hit(tenant, product, id, None).await
    }

    async fn record_hit(
        &self,
        tenant: &TenantId,
        product: &ProductId,
        id: Uuid,
        relevance: Option<f64>,
    ) -> Result<ContextFragment> {
        let grace = self.grace();
        let doc = store::update_typed(
            self.store.as_ref(),
            &keys::fragment_key(tenant, product, id),
            None,
            |current: Option<ContextFragment>| {
                let now = Utc::now();
                let mut fragment =
                    current.ok_or_else(|| Error::NotFound(format!("fragment {id}")))?;
                if fragment.is_expired(grace, now) {
                    return Err(Error::NotFound(format!("fragment {id}")));
                }
                fragment.access_count = fragment.access_count.saturating_add(1);
                fragment.last_access = now;
                fragment.pruned = false;
                fragment.pruned_at = None;
                if let Some(relevance) = relevance {
                    fragment.relevance = relevance;
                }
                Ok(fragment)
            },
        )
        .await?;
        Ok(doc.value)
    }

    pub async fn get(&self, tenant: &TenantId, product: &ProductId, id: Uuid) -> Result<Option<ContextFragment>> {
        Ok(
            store::get_typed::<ContextFragment>(self.store.as_ref(), &keys::fragment_key(tenant, product, id))
                .await?
                .map(|doc| doc.value),
        )
    }

    /// Prune the lowest-value fragments until at most `target` stay live
    ///
    /// The newest fragment is never pruned. Fragments holding the scope's
    /// highest access count go only once no lower-count fragment is left
    /// live. Running again finds nothing to do.
    pub async fn evict(&self, tenant: &TenantId, product: &ProductId, target: usize) -> Result<EvictionReport> {
        let now = Utc::now();
        let live: Vec<ContextFragment> = store::scan_typed::<ContextFragment>(
            self.store.as_ref(),
            &keys::fragment_prefix(tenant, product),
        )
        .await?
        .into_iter()
        .map(|(_, doc)| doc.value)
        .filter(|f| !f.pruned)
        .collect();

        let mut report = EvictionReport {
            live_before: live.len(),
            pruned: Vec::new(),
            live_after: live.len(),
        };
        if live.len() <= target {
            return Ok(report);
        }

        let max_access = live.iter().map(|f| f.access_count).max().unwrap_or(0);
        let newest = live
            .iter()
            .max_by_key(|f| (f.created_at, f.id))
            .map(|f| f.id);

        // Lower-count fragments first, then the tied most-accessed ones
        let mut candidates: Vec<(bool, f64, &ContextFragment)> = live
            .iter()
            .filter(|f| Some(f.id) != newest)
            .map(|f| {
                let staleness = elapsed(f.last_access, now);
                (
                    f.access_count == max_access,
                    scoring::pruning_score(staleness, f.access_count),
                    f,
                )
            })
            .collect();
        candidates.sort_by(|(ta, a, fa), (tb, b, fb)| {
            ta.cmp(tb)
                .then_with(|| b.partial_cmp(a).unwrap_or(Ordering::Equal))
                .then_with(|| fa.created_at.cmp(&fb.created_at))
        });

        let excess = live.len() - target;
        for (_, _, fragment) in candidates.into_iter().take(excess) {
            match self.prune(tenant, product, fragment.id, now).await {
                Ok(true) => report.pruned.push(fragment.id),
                Ok(false) => {}
                Err(Error::NotFound(_)) => {}
                Err(e) => warn!(fragment = %fragment.id, "Prune failed: {}", e),
            }
        }
        report.live_after = report.live_before - report.pruned.len();

        if !report.pruned.is_empty() {
            info!(
                tenant = %tenant,
                product = %product,
                pruned = report.pruned.len(),
                live = report.live_after,
                target,
                "Context scope evicted"
            );
        }
        Ok(report)
    }

    /// `Ok(false)` when another node pruned it first
    async fn prune(&self, tenant: &TenantId, product: &ProductId, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut changed = false;
        store::update_typed(
            self.store.as_ref(),
            &keys::fragment_key(tenant, product, id),
            None,
            |current: Option<ContextFragment>| {
                let mut fragment =
                    current.ok_or_else(|| Error::NotFound(format!("fragment {id}")))?;
                if !fragment.pruned {
                    fragment.pruned = true;
                    fragment.pruned_at = Some(now);
                    changed = true;
                }
                Ok(fragment)
            },
        )
        .await?;
        Ok(changed)
    }

    /// Delete pruned fragments whose grace period has passed
    pub async fn collect_garbage(&self, tenant: &TenantId) -> Result<usize> {
        let grace = self.grace();
        let now = Utc::now();
        let expired: Vec<String> = store::scan_typed::<ContextFragment>(
            self.store.as_ref(),
            &keys::context_prefix(tenant),
        )
        .await?
        .into_iter()
        .filter(|(_, doc)| doc.value.is_expired(grace, now))
        .map(|(key, _)| key)
        .collect();

        let mut collected = 0;
        for key in expired {
            // Skip fragments a touch restored since the scan
            let still_expired = store::get_typed::<ContextFragment>(self.store.as_ref(), &key)
                .await?
                .is_some_and(|doc| doc.value.is_expired(grace, now));
            if still_expired && self.store.delete(&key).await? {
                collected += 1;
            }
        }
        if collected > 0 {
            info!(tenant = %tenant, collected, "Collected pruned context fragments");
        }
        Ok(collected)
    }

    /// Live fragment count per product scope
    pub async fn scopes(&self, tenant: &TenantId) -> Result<BTreeMap<ProductId, usize>> {
        let mut scopes = BTreeMap::new();
        for (key, doc) in store::scan_typed::<ContextFragment>(
            self.store.as_ref(),
            &keys::context_prefix(tenant),
        )
        .await?
        {
            let Some(product) = keys::product_of_fragment_key(tenant, &key) else {
                continue;
            };
            let live = scopes.entry(ProductId::new(product)).or_insert(0);
            if !doc.value.pruned {
                *live += 1;
            }
        }
        Ok(scopes)
    }

    /// One pass of the background loop: evict oversized scopes, then collect
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let budget = self.config.max_fragments_per_scope;
        let mut report = MaintenanceReport::default();
        for tenant in store::registered_tenants(self.store.as_ref()).await? {
            for (product, live) in self.scopes(&tenant).await? {
                if live > budget {
                    report.pruned += self.evict(&tenant, &product, budget).await?.pruned.len();
                }
            }
            report.collected += self.collect_garbage(&tenant).await?;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_common::store::MemoryStore;

    fn engine(config: ContextConfig) -> ContextEngine {
        ContextEngine::with_hashing(Arc::new(MemoryStore::new()), config)
    }

    fn scope() -> (TenantId, ProductId) {
        (TenantId::new("acme"), ProductId::new("billing"))
    }

    fn vector(x: f32, y: f32) -> NewFragment {
        NewFragment {
            source_ref: format!("turn-{x}-{y}"),
            text: None,
            embedding: Some(vec![x, y]),
        }
    }

    /// Index with distinct creation times
    async fn add(engine: &ContextEngine, x: f32, y: f32) -> ContextFragment {
        let (tenant, product) = scope();
        let fragment = engine.index(&tenant, &product, vector(x, y)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        fragment
    }

    fn query(x: f32, y: f32, k: usize) -> ContextQuery {
        let (tenant_id, product_id) = scope();
        ContextQuery {
            tenant_id,
            product_id,
            input: QueryInput::Vector { vector: vec![x, y] },
            k,
            min_similarity: None,
        }
    }

    #[tokio::test]
    async fn test_query_ranks_and_touches() {
        let engine = engine(ContextConfig::default());
        let (tenant, product) = scope();
        let close = engine.index(&tenant, &product, vector(1.0, 0.1)).await.unwrap();
        let far = engine.index(&tenant, &product, vector(0.6, 0.8)).await.unwrap();
        engine.index(&tenant, &product, vector(-1.0, 0.0)).await.unwrap();

        let hits = engine.query(query(1.0, 0.0, 5)).await.unwrap();
        let ids: Vec<Uuid> = hits.iter().map(|h| h.fragment.id).collect();
        // The opposite vector is below the threshold
        assert_eq!(ids, vec![close.id, far.id]);
        assert!(hits.iter().all(|h| h.fragment.access_count == 1));
        assert!(hits[0].fragment.relevance > 0.0);

        let top = engine.query(query(1.0, 0.0, 1)).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].fragment.access_count, 2);
    }

    #[tokio::test]
    async fn test_text_queries_use_embedder() {
        let engine = engine(ContextConfig::default());
        let (tenant, product) = scope();
        let fragment = NewFragment {
            source_ref: "turn-1".into(),
            text: Some("invoices are exported nightly as csv".into()),
            embedding: None,
        };
        let indexed = engine.index(&tenant, &product, fragment).await.unwrap();

        let hits = engine
            .query(ContextQuery {
                tenant_id: tenant,
                product_id: product,
                input: QueryInput::Text {
                    text: "invoices exported nightly".into(),
                },
                k: 3,
                min_similarity: Some(0.1),
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].fragment.id, indexed.id);
    }

    #[tokio::test]
    async fn test_index_requires_embedding_or_text() {
        let engine = engine(ContextConfig::default());
        let (tenant, product) = scope();
        let result = engine.index(&tenant, &product, NewFragment::default()).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_evict_protects_newest_and_most_accessed() {
        let engine = engine(ContextConfig::default());
        let (tenant, product) = scope();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(add(&engine, 1.0, i as f32).await.id);
        }
        // Make the oldest fragment the most used
        for _ in 0..3 {
            engine.touch(&tenant, &product, ids[0]).await.unwrap();
        }

        let report = engine.evict(&tenant, &product, 2).await.unwrap();
        assert_eq!(report.live_before, 5);
        assert_eq!(report.pruned.len(), 3);
        assert_eq!(report.live_after, 2);
        assert!(!report.pruned.contains(&ids[0]));
        assert!(!report.pruned.contains(&ids[4]));

        // Idempotent
        let again = engine.evict(&tenant, &product, 2).await.unwrap();
        assert!(again.pruned.is_empty());
    }

    #[tokio::test]
    async fn test_evict_untouched_scope_down_to_target() {
        let engine = engine(ContextConfig::default());
        let (tenant, product) = scope();
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(add(&engine, 1.0, i as f32).await.id);
        }
        // Every fragment ties at zero accesses
        let report = engine.evict(&tenant, &product, 3).await.unwrap();
        assert_eq!(report.live_before, 10);
        assert_eq!(report.pruned.len(), 7);
        assert_eq!(report.live_after, 3);
        assert!(!report.pruned.contains(&ids[9]));
        // Stalest first
        assert!(report.pruned.contains(&ids[0]));
        assert_eq!(engine.scopes(&tenant).await.unwrap()[&product], 3);

        assert!(engine.evict(&tenant, &product, 3).await.unwrap().pruned.is_empty());
    }

    #[tokio::test]
    async fn test_evict_keeps_most_accessed_while_others_remain() {
        let engine = engine(ContextConfig::default());
        let (tenant, product) = scope();
        let popular = add(&engine, 1.0, 0.0).await;
        let plain = add(&engine, 1.0, 1.0).await;
        let newest = add(&engine, 1.0, 2.0).await;
        engine.touch(&tenant, &product, popular.id).await.unwrap();

        let report = engine.evict(&tenant, &product, 2).await.unwrap();
        assert_eq!(report.pruned, vec![plain.id]);

        // Only the newest may survive a target of one
        let report = engine.evict(&tenant, &product, 1).await.unwrap();
        assert_eq!(report.pruned, vec![popular.id]);
        let survivor = engine.get(&tenant, &product, newest.id).await.unwrap().unwrap();
        assert!(!survivor.pruned);
    }

    #[tokio::test]
    async fn test_pruned_fragments_stay_queryable_with_penalty() {
        let engine = engine(ContextConfig::default());
        let (tenant, product) = scope();
        let victim = add(&engine, 1.0, 0.0).await;
        let keeper = add(&engine, 1.0, 0.0).await;
        engine.touch(&tenant, &product, keeper.id).await.unwrap();

        let report = engine.evict(&tenant, &product, 1).await.unwrap();
        assert_eq!(report.pruned, vec![victim.id]);

        let hits = engine.query(query(1.0, 0.0, 5)).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].fragment.id, keeper.id);

        // The hit restored it
        let restored = engine.get(&tenant, &product, victim.id).await.unwrap().unwrap();
        assert!(!restored.pruned);
    }

    #[tokio::test]
    async fn test_garbage_collection_after_grace() {
        let config = ContextConfig {
            grace_period_secs: 0,
            ..ContextConfig::default()
        };
        let engine = engine(config);
        let (tenant, product) = scope();
        let victim = add(&engine, 1.0, 0.0).await;
        let keeper = add(&engine, 0.0, 1.0).await;
        engine.touch(&tenant, &product, keeper.id).await.unwrap();
        engine.evict(&tenant, &product, 1).await.unwrap();

        // Past grace: invisible to queries and touches
        assert!(engine.query(query(1.0, 0.0, 5)).await.unwrap().is_empty());
        assert!(matches!(
            engine.touch(&tenant, &product, victim.id).await,
            Err(Error::NotFound(_))
        ));

        assert_eq!(engine.collect_garbage(&tenant).await.unwrap(), 1);
        assert!(engine.get(&tenant, &product, victim.id).await.unwrap().is_none());
        assert_eq!(engine.scopes(&tenant).await.unwrap()[&product], 1);
    }

    #[tokio::test]
    async fn test_maintenance_enforces_scope_budget() {
        let config = ContextConfig {
            max_fragments_per_scope: 2,
            ..ContextConfig::default()
        };
        let engine = engine(config);
        let (tenant, product) = scope();
        let first = add(&engine, 1.0, 0.0).await;
        for i in 1..4 {
            add(&engine, 1.0, i as f32).await;
        }
        engine.touch(&tenant, &product, first.id).await.unwrap();

        let report = engine.run_maintenance().await.unwrap();
        assert_eq!(report.pruned, 2);
        assert_eq!(engine.scopes(&tenant).await.unwrap()[&product], 2);
    }
}
