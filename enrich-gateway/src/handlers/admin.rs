use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use enrich_common::types::{DlqMessage, DlqState};

use crate::api::{GatewayError, ReplayBatchPayload, ReplayReport};
use crate::breaker::BreakerSnapshot;
use crate::cache::CacheStats;
use crate::context::AppContext;
use crate::store::AggregateSnapshot;

pub async fn circuit_breakers(State(context): State<AppContext>) -> Json<Vec<BreakerSnapshot>> {
    Json(context.breakers.snapshot())
}

pub async fn reset_breaker(
    State(context): State<AppContext>,
    Path(provider): Path<String>,
) -> Result<StatusCode, GatewayError> {
    context
        .breakers
        .reset(&provider)
        .map_err(|_| GatewayError::ProviderNotFound(provider))?;
    tracing::info!("circuit breaker reset by operator");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cache_stats(State(context): State<AppContext>) -> Json<CacheStats> {
    Json(context.cache.stats())
}

#[derive(Debug, Default, Deserialize)]
pub struct DlqListQuery {
    pub state: Option<DlqState>,
    pub subject_key: Option<String>,
}

pub async fn list_dlq(
    State(context): State<AppContext>,
    Query(query): Query<DlqListQuery>,
) -> Json<Vec<DlqMessage>> {
    let messages = match query.subject_key {
        Some(subject_key) => context.dlq.for_subject(&subject_key),
        None => context.dlq.list(query.state.unwrap_or(DlqState::Active)),
    };
    Json(messages)
}

pub async fn replay(
    State(context): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReplayReport>, GatewayError> {
    let report = context.waterfall.replay(id).await?;
    Ok(Json(report))
}

pub async fn replay_batch(
    State(context): State<AppContext>,
    Json(filter): Json<ReplayBatchPayload>,
) -> Result<Json<Vec<ReplayReport>>, GatewayError> {
    let reports = context.waterfall.replay_batch(&filter).await?;
    Ok(Json(reports))
}

pub async fn aggregate(State(context): State<AppContext>) -> Json<AggregateSnapshot> {
    Json(context.store.rebuild_aggregate())
}
