//! Handlers for `/metrics` endpoints.

use axum::{
  Json,
  extract::{Query, State},
};
use effector_core::{
  metric::{EventMetric, OutboxStats},
  store::DispatchStore,
};
use serde::Deserialize;

use crate::{ApiState, error::ApiError};

const DEFAULT_TOP: usize = 10;

#[derive(Debug, Deserialize)]
pub struct TopParams {
  pub limit: Option<usize>,
}

/// `GET /metrics/top[?limit=]`: most frequent events, default 10.
pub async fn top<S: DispatchStore + 'static>(
  State(state): State<ApiState<S>>,
  Query(params): Query<TopParams>,
) -> Result<Json<Vec<EventMetric>>, ApiError> {
  let metrics = state
    .metrics
    .top_events(params.limit.unwrap_or(DEFAULT_TOP))
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(metrics))
}

/// `GET /metrics/outbox`
pub async fn outbox<S: DispatchStore + 'static>(
  State(state): State<ApiState<S>>,
) -> Result<Json<OutboxStats>, ApiError> {
  let stats = state
    .metrics
    .outbox_stats()
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(stats))
}
