//! API error type and [`axum::response::IntoResponse`] implementation.

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use effector_core::{Error as CoreError, store::StoreError};
use serde_json::json;
use thiserror::Error;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("not found: {0}")]
  NotFound(String),

  #[error("bad request: {0}")]
  BadRequest(String),

  /// Well-formed input naming something the catalog does not know.
  #[error("unprocessable: {0}")]
  Unprocessable(String),

  /// The target exists but is not in a state that allows the operation.
  #[error("conflict: {0}")]
  Conflict(String),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ApiError {
  /// Classify a backend error by the domain error it carries, if any.
  pub fn from_store<E: StoreError>(e: E) -> Self {
    let classified = e.as_core().and_then(|core| {
      let message = core.to_string();
      match core {
        CoreError::InvalidInput(_) => Some(ApiError::BadRequest(message)),
        CoreError::UnknownAction(_)
        | CoreError::UnknownEffectType(_)
        | CoreError::MappingNotFound { .. } => Some(ApiError::Unprocessable(message)),
        CoreError::EventNotFound(_)
        | CoreError::OutboxEntryNotFound(_)
        | CoreError::EffectRunNotFound(_) => Some(ApiError::NotFound(message)),
        CoreError::InvalidTransition { .. }
        | CoreError::UnfinishedEffects { .. }
        | CoreError::ClaimLost { .. } => Some(ApiError::Conflict(message)),
        _ => None,
      }
    });
    classified.unwrap_or_else(|| ApiError::Store(Box::new(e)))
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, message) = match &self {
      ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
      ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
      ApiError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
      ApiError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
      ApiError::Store(e) => {
        tracing::error!(error = %e, "store error while handling request");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
      }
    };
    (status, Json(json!({ "error": message }))).into_response()
  }
}
