//! Handlers for `/events` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/events` | Optional `?event_name=&entity_type=&entity_id=&limit=&offset=` |
//! | `POST` | `/events` | Body: a `NewEvent`. 422 on an unknown or inactive action |
//! | `GET`  | `/events/{id}` | Event with its outbox entry and effect runs |

use axum::{
  Json,
  extract::{Path, Query, State},
  http::StatusCode,
  response::IntoResponse,
};
use effector_core::{
  effect_run::EffectRun,
  event::{NewEvent, SystemEvent},
  outbox::OutboxEntry,
  store::{DispatchStore, EventQuery},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ApiState, error::ApiError};

// ─── List ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListParams {
  pub event_name:  Option<String>,
  pub entity_type: Option<String>,
  pub entity_id:   Option<String>,
  pub limit:       Option<usize>,
  pub offset:      Option<usize>,
}

/// `GET /events`
pub async fn list<S: DispatchStore + 'static>(
  State(state): State<ApiState<S>>,
  Query(params): Query<ListParams>,
) -> Result<Json<Vec<SystemEvent>>, ApiError> {
  let query = EventQuery {
    event_name:  params.event_name,
    entity_type: params.entity_type,
    entity_id:   params.entity_id,
    limit:       params.limit,
    offset:      params.offset,
  };
  let events = state
    .store
    .list_events(&query)
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(events))
}

// ─── Create ──────────────────────────────────────────────────────────────────

/// `POST /events`
pub async fn create<S: DispatchStore + 'static>(
  State(state): State<ApiState<S>>,
  Json(body): Json<NewEvent>,
) -> Result<impl IntoResponse, ApiError> {
  let event = state
    .recorder
    .record(body)
    .await
    .map_err(ApiError::from_store)?;
  Ok((StatusCode::CREATED, Json(event)))
}

// ─── Get one ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct EventDetail {
  pub event:       SystemEvent,
  pub outbox:      Option<OutboxEntry>,
  pub effect_runs: Vec<EffectRun>,
}

/// `GET /events/{id}`
pub async fn get_one<S: DispatchStore + 'static>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<EventDetail>, ApiError> {
  let event = state
    .store
    .get_event(id)
    .await
    .map_err(ApiError::from_store)?
    .ok_or_else(|| ApiError::NotFound(format!("event {id} not found")))?;
  let outbox = state
    .store
    .get_outbox_for_event(id)
    .await
    .map_err(ApiError::from_store)?;
  let effect_runs = state
    .store
    .list_effect_runs(id)
    .await
    .map_err(ApiError::from_store)?;

  Ok(Json(EventDetail {
    event,
    outbox,
    effect_runs,
  }))
}
