//! Context retrieval endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use std::collections::BTreeMap;

use huddle_common::ids::ProductId;

use super::auth::Caller;
use super::error::{ApiError, ApiResult};
use super::parse_uuid;
use crate::context::{
    ContextFragment, ContextQuery, EvictionReport, NewFragment, QueryInput, ScoredFragment,
};
use crate::AppState;

/// Default number of fragments returned by a query
const DEFAULT_K: usize = 5;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRequest {
    pub product_id: ProductId,
    #[serde(flatten)]
    pub fragment: NewFragment,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub product_id: ProductId,
    #[serde(flatten)]
    pub input: QueryInput,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub min_similarity: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictRequest {
    pub product_id: ProductId,
    pub target_size: usize,
}

/// POST /context/index
pub async fn index_fragment(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<IndexRequest>,
) -> ApiResult<(StatusCode, Json<ContextFragment>)> {
    let fragment = state
        .context
        .index(&caller.tenant_id, &body.product_id, body.fragment)
        .await?;
    Ok((StatusCode::CREATED, Json(fragment)))
}

/// POST /context/query
pub async fn query(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<QueryRequest>,
) -> ApiResult<Json<Vec<ScoredFragment>>> {
    let k = body.k.unwrap_or(DEFAULT_K);
    if k == 0 {
        return Err(ApiError::BadRequest("k must be at least 1".into()));
    }
    let hits = state
        .context
        .query(ContextQuery {
            tenant_id: caller.tenant_id,
            product_id: body.product_id,
            input: body.input,
            k,
            min_similarity: body.min_similarity,
        })
        .await?;
    Ok(Json(hits))
}

/// POST /context/evict
pub async fn evict(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<EvictRequest>,
) -> ApiResult<Json<EvictionReport>> {
    let report = state
        .context
        .evict(&caller.tenant_id, &body.product_id, body.target_size)
        .await?;
    Ok(Json(report))
}

/// GET /context/:product/fragments/:id
pub async fn get_fragment(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((product, id)): Path<(String, String)>,
) -> ApiResult<Json<ContextFragment>> {
    let id = parse_uuid(&id, "fragment")?;
    let product = ProductId::new(product);
    state
        .context
        .get(&caller.tenant_id, &product, id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("fragment {id}")))
}

/// POST /context/:product/fragments/:id/touch
pub async fn touch_fragment(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((product, id)): Path<(String, String)>,
) -> ApiResult<Json<ContextFragment>> {
    let id = parse_uuid(&id, "fragment")?;
    let fragment = state
        .context
        .touch(&caller.tenant_id, &ProductId::new(product), id)
        .await?;
    Ok(Json(fragment))
}

/// GET /context/scopes: live fragment count per product
pub async fn scopes(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Json<BTreeMap<ProductId, usize>>> {
    Ok(Json(state.context.scopes(&caller.tenant_id).await?))
}

pub fn context_routes() -> Router<AppState> {
    Router::new()
        .route("/context/index", post(index_fragment))
        .route("/context/query", post(query))
        .route("/context/evict", post(evict))
        .route("/context/scopes", get(scopes))
        .route("/context/:product/fragments/:id", get(get_fragment))
        .route("/context/:product/fragments/:id/touch", post(touch_fragment))
}
