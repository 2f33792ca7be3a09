//! The outbox worker.
//!
//! One cycle claims a batch of outbox entries and processes each in its own
//! task: resolve the impact matrix, fan out effect runs, execute the
//! unfinished runs in priority order, then complete the entry. Any storage
//! failure along the way releases the entry back to `pending` behind a
//! backoff, or dead-letters it once the retry budget is spent.
//!
//! Every write after the claim carries this worker's id. If the claim
//! expired and another worker took over, the store answers `ClaimLost` and
//! this worker walks away without touching the entry again.
//!
//! Handlers run in their own tasks. A panicking handler fails its run like
//! any other handler error; the entry and its sibling runs carry on.

use std::sync::Arc;

use effector_core::{
  effect_run::EffectOutcome,
  event::SystemEvent,
  outbox::{Claim, ClaimRequest, FailedCycle, OutboxStatus},
  store::{DispatchStore, StoreError as _},
};
use tokio::{
  sync::{Notify, watch},
  task::{JoinError, JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{config::DispatcherConfig, handler::HandlerRegistry};

// ─── Reports ─────────────────────────────────────────────────────────────────

/// What a single claim cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
  pub claimed:       usize,
  pub completed:     usize,
  pub requeued:      usize,
  pub dead_lettered: usize,
  /// Entries dropped because the claim moved to another worker, or because
  /// the failure could not be recorded. Claim expiry brings them back.
  pub abandoned:     usize,
}

impl CycleReport {
  fn absorb(&mut self, outcome: EntryOutcome) {
    match outcome {
      EntryOutcome::Completed => self.completed += 1,
      EntryOutcome::Requeued => self.requeued += 1,
      EntryOutcome::DeadLettered => self.dead_lettered += 1,
      EntryOutcome::Abandoned => self.abandoned += 1,
    }
  }

  fn merge(&mut self, other: CycleReport) {
    self.claimed += other.claimed;
    self.completed += other.completed;
    self.requeued += other.requeued;
    self.dead_lettered += other.dead_lettered;
    self.abandoned += other.abandoned;
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
  Completed,
  Requeued,
  DeadLettered,
  Abandoned,
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

pub struct Dispatcher<S> {
  store:     Arc<S>,
  handlers:  Arc<HandlerRegistry>,
  config:    DispatcherConfig,
  wake:      Arc<Notify>,
  worker_id: String,
}

impl<S> Clone for Dispatcher<S> {
  fn clone(&self) -> Self {
    Self {
      store:     self.store.clone(),
      handlers:  self.handlers.clone(),
      config:    self.config.clone(),
      wake:      self.wake.clone(),
      worker_id: self.worker_id.clone(),
    }
  }
}

impl<S: DispatchStore + 'static> Dispatcher<S> {
  pub fn new(store: Arc<S>, handlers: HandlerRegistry, config: DispatcherConfig) -> Self {
    Self {
      store,
      handlers: Arc::new(handlers),
      config,
      wake: Arc::new(Notify::new()),
      worker_id: format!("worker-{}", Uuid::new_v4().simple()),
    }
  }

  /// Share a wake signal with an [`crate::EventRecorder`].
  pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
    self.wake = wake;
    self
  }

  /// Claim owner recorded on outbox entries. Must be unique among all
  /// workers sharing a database.
  pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
    self.worker_id = worker_id.into();
    self
  }

  pub fn worker_id(&self) -> &str { &self.worker_id }

  pub fn config(&self) -> &DispatcherConfig { &self.config }

  // ── Loops ─────────────────────────────────────────────────────────────────

  /// Start `count` worker loops, each with a distinct worker id derived from
  /// this dispatcher's.
  pub fn spawn_workers(
    &self,
    count: usize,
    shutdown: watch::Receiver<bool>,
  ) -> Vec<JoinHandle<()>> {
    (0..count)
      .map(|i| {
        let worker = self
          .clone()
          .with_worker_id(format!("{}-{i}", self.worker_id));
        tokio::spawn(worker.run(shutdown.clone()))
      })
      .collect()
  }

  /// Poll the outbox until `shutdown` flips to `true` (or its sender is
  /// dropped). Entries already claimed always run to completion.
  ///
  /// Up to `batch_size` entries are in flight at once. A freed slot is
  /// refilled right away, so a slow entry never holds back unrelated ones.
  /// Empty polls back off from `poll_interval` to `max_poll_interval`; any
  /// claimed work, finished entry or wake signal resets the interval.
  pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
    info!(worker = %self.worker_id, "dispatcher worker started");
    let base = self.config.poll_interval();
    let max = self.config.max_poll_interval();
    let mut idle = base;
    let mut in_flight: JoinSet<EntryOutcome> = JoinSet::new();

    loop {
      if *shutdown.borrow() {
        break;
      }
      while let Some(done) = in_flight.try_join_next() {
        self.reap(done);
      }

      let free = self.config.batch_size.saturating_sub(in_flight.len());
      if free > 0 {
        match self.claim(free).await {
          Ok(claims) if !claims.is_empty() => {
            debug!(worker = %self.worker_id, claimed = claims.len(), "claimed outbox entries");
            for claim in claims {
              in_flight.spawn(self.clone().supervise(claim));
            }
            idle = base;
            continue;
          }
          Ok(_) => {}
          Err(e) => warn!(worker = %self.worker_id, error = %e, "claim cycle failed"),
        }
      }

      let woken = tokio::select! {
        changed = shutdown.changed() => {
          if changed.is_err() {
            break;
          }
          false
        }
        Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
          self.reap(done);
          true
        }
        _ = self.wake.notified() => true,
        _ = tokio::time::sleep(idle) => false,
      };
      idle = if woken { base } else { (idle * 2).min(max) };
    }

    while let Some(done) = in_flight.join_next().await {
      self.reap(done);
    }
    info!(worker = %self.worker_id, "dispatcher worker stopped");
  }

  /// Run cycles back to back until one claims nothing.
  pub async fn run_until_idle(&self) -> Result<CycleReport, S::Error> {
    let mut total = CycleReport::default();
    loop {
      let report = self.run_once().await?;
      total.merge(report);
      if report.claimed == 0 {
        return Ok(total);
      }
    }
  }

  /// Claim one batch and process every claimed entry concurrently, waiting
  /// for all of them.
  ///
  /// Only the claim itself can fail this call; per-entry failures are
  /// recorded on the entries and counted in the report.
  pub async fn run_once(&self) -> Result<CycleReport, S::Error> {
    let claims = self.claim(self.config.batch_size).await?;

    let mut report = CycleReport {
      claimed: claims.len(),
      ..Default::default()
    };
    if claims.is_empty() {
      return Ok(report);
    }
    debug!(worker = %self.worker_id, claimed = claims.len(), "claimed outbox entries");

    let tasks: Vec<_> = claims
      .into_iter()
      .map(|claim| tokio::spawn(self.clone().supervise(claim)))
      .collect();

    for task in tasks {
      match task.await {
        Ok(outcome) => report.absorb(outcome),
        Err(e) => {
          self.reap(Err(e));
          report.absorb(EntryOutcome::Abandoned);
        }
      }
    }

    Ok(report)
  }

  async fn claim(&self, batch_size: usize) -> Result<Vec<Claim>, S::Error> {
    self
      .store
      .claim_batch(ClaimRequest {
        owner: self.worker_id.clone(),
        batch_size,
        visibility_timeout: self.config.visibility_timeout(),
        max_retries: self.config.max_retries,
      })
      .await
  }

  fn reap(&self, done: Result<EntryOutcome, JoinError>) {
    if let Err(e) = done {
      error!(
        worker = %self.worker_id,
        error = %e,
        "entry supervisor failed; entry returns after claim expiry"
      );
    }
  }

  // ── Per-entry processing ──────────────────────────────────────────────────

  /// Process `claim` in a child task. A panic inside the dispatch path
  /// itself counts as an infrastructure failure of the entry.
  async fn supervise(self, claim: Claim) -> EntryOutcome {
    let entry_id = claim.entry.id;
    let retry_count = claim.entry.retry_count;
    let this = self.clone();
    match tokio::spawn(async move { this.process(claim).await }).await {
      Ok(outcome) => outcome,
      Err(join_err) => {
        self
          .release(entry_id, retry_count, format!("dispatch task failed: {join_err}"))
          .await
      }
    }
  }

  async fn process(&self, claim: Claim) -> EntryOutcome {
    let entry_id = claim.entry.id;
    let retry_count = claim.entry.retry_count;

    match self.execute(&claim).await {
      Ok(()) => {
        debug!(
          worker = %self.worker_id,
          %entry_id,
          event_id = %claim.event.id,
          "outbox entry completed"
        );
        EntryOutcome::Completed
      }
      Err(e) if e.is_claim_lost() => {
        debug!(worker = %self.worker_id, %entry_id, "claim lost; abandoning entry");
        EntryOutcome::Abandoned
      }
      Err(e) => self.release(entry_id, retry_count, e.to_string()).await,
    }
  }

  /// Resolve, fan out, execute, complete. Returns the first storage error.
  async fn execute(&self, claim: &Claim) -> Result<(), S::Error> {
    let entry_id = claim.entry.id;
    let event = &claim.event;

    let effects = self.store.resolve_effects(event.event_name.clone()).await?;
    self
      .store
      .ensure_effect_runs(entry_id, self.worker_id.clone(), effects)
      .await?;

    // Runs left over from an earlier resolution are executed too, so a
    // mapping deactivated mid-retry cannot strand a run as `pending`.
    let runs = self.store.list_effect_runs(event.id).await?;
    for run in runs.into_iter().filter(|r| !r.status.is_terminal()) {
      self
        .store
        .renew_claim(entry_id, self.worker_id.clone(), self.config.visibility_timeout())
        .await?;
      self
        .store
        .start_effect_run(entry_id, self.worker_id.clone(), run.id)
        .await?;

      let outcome = self.invoke(&run.effect_type, event).await;
      if let EffectOutcome::Failed(reason) = &outcome {
        warn!(
          worker = %self.worker_id,
          event_id = %event.id,
          effect_type = %run.effect_type,
          error = %reason,
          "effect failed"
        );
      }

      self
        .store
        .finish_effect_run(entry_id, self.worker_id.clone(), run.id, outcome)
        .await?;
    }

    self
      .store
      .complete_entry(entry_id, self.worker_id.clone())
      .await?;
    Ok(())
  }

  async fn invoke(&self, effect_type: &str, event: &SystemEvent) -> EffectOutcome {
    let Some(handler) = self.handlers.get(effect_type) else {
      return EffectOutcome::Failed(
        effector_core::Error::HandlerNotRegistered(effect_type.to_owned()).to_string(),
      );
    };

    let timeout = self.config.handler_timeout();
    let event = event.clone();
    let mut task = tokio::spawn(async move { handler.handle(&event).await });
    match tokio::time::timeout(timeout, &mut task).await {
      Ok(Ok(Ok(()))) => EffectOutcome::Succeeded,
      Ok(Ok(Err(e))) => EffectOutcome::Failed(e.to_string()),
      Ok(Err(join_err)) => EffectOutcome::Failed(describe_handler_crash(join_err)),
      Err(_) => {
        task.abort();
        EffectOutcome::Failed(format!("handler timed out after {timeout:?}"))
      }
    }
  }

  /// Record a failed cycle: requeue behind a backoff, or dead-letter.
  async fn release(&self, entry_id: Uuid, retry_count: u32, error: String) -> EntryOutcome {
    let backoff = self.config.backoff(retry_count);
    let failure = FailedCycle {
      entry_id,
      owner: self.worker_id.clone(),
      error: error.clone(),
      max_retries: self.config.max_retries,
      backoff,
    };

    match self.store.release_failed(failure).await {
      Ok(entry) if entry.status == OutboxStatus::Failed => {
        error!(
          worker = %self.worker_id,
          %entry_id,
          event_id = %entry.event_id,
          retry_count = entry.retry_count,
          error = %error,
          "outbox entry dead-lettered"
        );
        EntryOutcome::DeadLettered
      }
      Ok(entry) => {
        warn!(
          worker = %self.worker_id,
          %entry_id,
          event_id = %entry.event_id,
          retry_count = entry.retry_count,
          ?backoff,
          error = %error,
          "outbox entry requeued"
        );
        EntryOutcome::Requeued
      }
      Err(e) if e.is_claim_lost() => {
        debug!(worker = %self.worker_id, %entry_id, "claim lost before failure was recorded");
        EntryOutcome::Abandoned
      }
      Err(e) => {
        error!(
          worker = %self.worker_id,
          %entry_id,
          error = %e,
          cause = %error,
          "could not record dispatch failure; entry returns after claim expiry"
        );
        EntryOutcome::Abandoned
      }
    }
  }
}

fn describe_handler_crash(err: JoinError) -> String {
  match err.try_into_panic() {
    Ok(payload) => {
      let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());
      format!("handler panicked: {message}")
    }
    Err(err) => format!("handler task cancelled: {err}"),
  }
}
