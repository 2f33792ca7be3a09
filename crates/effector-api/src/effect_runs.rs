//! Handlers for `/effect-runs` endpoints.

use axum::{
  Json,
  extract::{Path, Query, State},
};
use effector_core::{
  effect_run::{EffectRun, EffectRunQuery, EffectRunStatus},
  store::DispatchStore,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::{ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct SearchParams {
  pub status:      Option<EffectRunStatus>,
  pub effect_type: Option<String>,
  pub limit:       Option<usize>,
}

/// `GET /effect-runs[?status=&effect_type=&limit=]`
pub async fn search<S: DispatchStore + 'static>(
  State(state): State<ApiState<S>>,
  Query(params): Query<SearchParams>,
) -> Result<Json<Vec<EffectRun>>, ApiError> {
  let query = EffectRunQuery {
    status:      params.status,
    effect_type: params.effect_type,
    limit:       params.limit,
  };
  let runs = state
    .store
    .search_effect_runs(&query)
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(runs))
}

/// `POST /effect-runs/{id}/rerun`: reset one failed run and reopen its
/// outbox entry. 409 while the entry is being processed.
pub async fn rerun<S: DispatchStore + 'static>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<EffectRun>, ApiError> {
  let run = state
    .store
    .rerun_effect(id)
    .await
    .map_err(ApiError::from_store)?;
  info!(
    run_id = %id,
    event_id = %run.event_id,
    effect_type = %run.effect_type,
    "effect run queued for re-run"
  );
  state.wake.notify_waiters();
  Ok(Json(run))
}
