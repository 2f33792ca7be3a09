//! JSON REST API for Effector.
//!
//! Exposes an axum [`Router`] for event ingress, outbox and effect-run
//! monitoring, operator actions (dead-letter replay, effect re-run), catalog
//! coverage, and metrics. Auth, TLS, and transport concerns are the caller's
//! responsibility.
//!
//! # Mounting
//!
//! ```rust,ignore
//! let state = ApiState::new(store.clone(), wake.clone());
//! .nest("/api", effector_api::api_router(state))
//! ```

pub mod catalog;
pub mod effect_runs;
pub mod error;
pub mod events;
pub mod metrics;
pub mod outbox;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use effector_core::store::DispatchStore;
use effector_dispatch::{EventRecorder, MetricsAggregator};
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;

pub use error::ApiError;

// ─── State ───────────────────────────────────────────────────────────────────

/// Shared state threaded through all handlers.
pub struct ApiState<S> {
  pub store:    Arc<S>,
  pub recorder: EventRecorder<S>,
  pub metrics:  MetricsAggregator<S>,
  /// Fired after operator actions that make an entry claimable again.
  pub wake:     Arc<Notify>,
}

impl<S> Clone for ApiState<S> {
  fn clone(&self) -> Self {
    Self {
      store:    self.store.clone(),
      recorder: self.recorder.clone(),
      metrics:  self.metrics.clone(),
      wake:     self.wake.clone(),
    }
  }
}

impl<S: DispatchStore + 'static> ApiState<S> {
  /// `wake` should be the signal the dispatcher workers listen on.
  pub fn new(store: Arc<S>, wake: Arc<Notify>) -> Self {
    Self {
      recorder: EventRecorder::new(store.clone(), wake.clone()),
      metrics: MetricsAggregator::new(store.clone()),
      store,
      wake,
    }
  }
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// Build a fully-materialised API router.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S: DispatchStore + 'static>(state: ApiState<S>) -> Router<()> {
  Router::new()
    // Events
    .route("/events", get(events::list::<S>).post(events::create::<S>))
    .route("/events/{id}", get(events::get_one::<S>))
    // Outbox
    .route("/outbox", get(outbox::list::<S>))
    .route("/outbox/dead-letters", get(outbox::dead_letters::<S>))
    .route("/outbox/{id}/replay", post(outbox::replay::<S>))
    // Effect runs
    .route("/effect-runs", get(effect_runs::search::<S>))
    .route("/effect-runs/{id}/rerun", post(effect_runs::rerun::<S>))
    // Catalog
    .route("/catalog/actions", get(catalog::actions::<S>))
    .route("/catalog/actions/{name}/effects", get(catalog::effects_for::<S>))
    .route("/catalog/effect-types", get(catalog::effect_types::<S>))
    .route("/catalog/mappings", get(catalog::mappings::<S>))
    // Metrics
    .route("/metrics/top", get(metrics::top::<S>))
    .route("/metrics/outbox", get(metrics::outbox::<S>))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

#[cfg(test)]
mod tests;
