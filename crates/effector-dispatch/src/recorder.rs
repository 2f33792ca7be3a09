//! Ingress: turning a business action into a durable event and outbox entry.

use std::sync::Arc;

use effector_core::{
  event::{NewEvent, SystemEvent},
  store::DispatchStore,
};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::metrics::MetricsAggregator;

/// Records business actions, counts them, and nudges idle dispatcher
/// workers.
///
/// The wake signal is only a latency optimisation. A worker that misses it
/// still finds the entry on its next poll.
pub struct EventRecorder<S> {
  store:   Arc<S>,
  metrics: MetricsAggregator<S>,
  wake:    Arc<Notify>,
}

impl<S> Clone for EventRecorder<S> {
  fn clone(&self) -> Self {
    Self {
      store:   self.store.clone(),
      metrics: self.metrics.clone(),
      wake:    self.wake.clone(),
    }
  }
}

impl<S: DispatchStore + 'static> EventRecorder<S> {
  pub fn new(store: Arc<S>, wake: Arc<Notify>) -> Self {
    Self {
      metrics: MetricsAggregator::new(store.clone()),
      store,
      wake,
    }
  }

  /// Persist `input` as a [`SystemEvent`] plus a `pending` outbox entry.
  ///
  /// Blank identifiers are rejected before the store is touched; an unknown
  /// or inactive action is rejected by the store with nothing written. Each
  /// recorded event bumps its name's counter exactly once, whatever later
  /// becomes of its dispatch.
  pub async fn record(&self, input: NewEvent) -> Result<SystemEvent, S::Error> {
    input.validate()?;

    let event = match self.store.record_event(input).await {
      Ok(event) => event,
      Err(e) => {
        debug!(error = %e, "event rejected");
        return Err(e);
      }
    };

    info!(
      event_id = %event.id,
      event_name = %event.event_name,
      entity_type = %event.entity_type,
      entity_id = %event.entity_id,
      "event recorded"
    );
    self.metrics.increment(event.event_name.clone());
    self.wake.notify_waiters();
    Ok(event)
  }

  /// The signal fired after every successful write.
  pub fn wake_signal(&self) -> Arc<Notify> { self.wake.clone() }
}
