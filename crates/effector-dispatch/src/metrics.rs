//! Per-event-name counters for dashboards.

use std::sync::Arc;

use effector_core::{
  metric::{EventMetric, OutboxStats},
  store::DispatchStore,
};
use tokio::task::JoinHandle;
use tracing::warn;

/// Thin wrapper over the store's metric operations.
///
/// Increments are fire-and-forget: a failed counter update is logged and
/// dropped, never surfaced to the caller recording the event.
pub struct MetricsAggregator<S> {
  store: Arc<S>,
}

impl<S> Clone for MetricsAggregator<S> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
    }
  }
}

impl<S: DispatchStore + 'static> MetricsAggregator<S> {
  pub fn new(store: Arc<S>) -> Self { Self { store } }

  /// Bump the counter for `event_name` in the background.
  ///
  /// The returned handle may be dropped; it exists so callers that care
  /// (tests, mostly) can wait for the write.
  pub fn increment(&self, event_name: impl Into<String>) -> JoinHandle<()> {
    let store = self.store.clone();
    let event_name = event_name.into();
    tokio::spawn(async move {
      if let Err(e) = store.increment_metric(event_name.clone()).await {
        warn!(error = %e, event_name = %event_name, "failed to increment event metric");
      }
    })
  }

  pub async fn top_events(&self, limit: usize) -> Result<Vec<EventMetric>, S::Error> {
    self.store.top_events(limit).await
  }

  pub async fn outbox_stats(&self) -> Result<OutboxStats, S::Error> {
    self.store.outbox_stats().await
  }
}
