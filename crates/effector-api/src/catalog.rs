//! Read-only views of the impact matrix.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/catalog/actions` | |
//! | `GET`  | `/catalog/actions/{name}/effects` | Fan-out preview in execution order; 404 if unregistered |
//! | `GET`  | `/catalog/effect-types` | |
//! | `GET`  | `/catalog/mappings` | |

use axum::{
  Json,
  extract::{Path, State},
};
use effector_core::{
  catalog::{ActionDefinition, EffectTypeDefinition, ImpactMapping, ResolvedEffect},
  store::DispatchStore,
};

use crate::{ApiState, error::ApiError};

/// `GET /catalog/actions`
pub async fn actions<S: DispatchStore + 'static>(
  State(state): State<ApiState<S>>,
) -> Result<Json<Vec<ActionDefinition>>, ApiError> {
  let actions = state
    .store
    .list_actions()
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(actions))
}

/// `GET /catalog/effect-types`
pub async fn effect_types<S: DispatchStore + 'static>(
  State(state): State<ApiState<S>>,
) -> Result<Json<Vec<EffectTypeDefinition>>, ApiError> {
  let effect_types = state
    .store
    .list_effect_types()
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(effect_types))
}

/// `GET /catalog/mappings`
pub async fn mappings<S: DispatchStore + 'static>(
  State(state): State<ApiState<S>>,
) -> Result<Json<Vec<ImpactMapping>>, ApiError> {
  let mappings = state
    .store
    .list_mappings()
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(mappings))
}

/// `GET /catalog/actions/{name}/effects`
pub async fn effects_for<S: DispatchStore + 'static>(
  State(state): State<ApiState<S>>,
  Path(name): Path<String>,
) -> Result<Json<Vec<ResolvedEffect>>, ApiError> {
  let known = state
    .store
    .list_actions()
    .await
    .map_err(ApiError::from_store)?
    .iter()
    .any(|a| a.action_name == name);
  if !known {
    return Err(ApiError::NotFound(format!("action {name:?} not found")));
  }

  let effects = state
    .store
    .resolve_effects(name)
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(effects))
}
