//! Handlers for `/outbox` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/outbox` | Optional `?status=pending\|processing\|completed\|failed&limit=&offset=` |
//! | `GET`  | `/outbox/dead-letters` | Shorthand for `?status=failed` |
//! | `POST` | `/outbox/{id}/replay` | Dead letter back to `pending`; 409 if not `failed` |

use axum::{
  Json,
  extract::{Path, Query, State},
};
use effector_core::{
  outbox::{OutboxEntry, OutboxQuery, OutboxStatus},
  store::DispatchStore,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::{ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct ListParams {
  pub status: Option<OutboxStatus>,
  pub limit:  Option<usize>,
  pub offset: Option<usize>,
}

/// `GET /outbox`
pub async fn list<S: DispatchStore + 'static>(
  State(state): State<ApiState<S>>,
  Query(params): Query<ListParams>,
) -> Result<Json<Vec<OutboxEntry>>, ApiError> {
  let query = OutboxQuery {
    status: params.status,
    limit:  params.limit,
    offset: params.offset,
  };
  let entries = state
    .store
    .list_outbox(&query)
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
  pub limit:  Option<usize>,
  pub offset: Option<usize>,
}

/// `GET /outbox/dead-letters`
pub async fn dead_letters<S: DispatchStore + 'static>(
  State(state): State<ApiState<S>>,
  Query(params): Query<PageParams>,
) -> Result<Json<Vec<OutboxEntry>>, ApiError> {
  let query = OutboxQuery {
    status: Some(OutboxStatus::Failed),
    limit:  params.limit,
    offset: params.offset,
  };
  let entries = state
    .store
    .list_outbox(&query)
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(entries))
}

/// `POST /outbox/{id}/replay`
pub async fn replay<S: DispatchStore + 'static>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<OutboxEntry>, ApiError> {
  let entry = state
    .store
    .replay_dead_letter(id)
    .await
    .map_err(ApiError::from_store)?;
  info!(entry_id = %id, event_id = %entry.event_id, "dead letter replayed");
  state.wake.notify_waiters();
  Ok(Json(entry))
}
