//! The `DispatchStore` trait and supporting query types.
//!
//! The trait is implemented by storage backends (e.g.
//! `effector-store-sqlite`). The dispatcher and the API depend on this
//! abstraction, not on any concrete backend.
//!
//! Backends must provide two atomicity guarantees: an event and its outbox
//! entry are written together or not at all, and a claim is a conditional
//! update that at most one worker can win.

use std::{future::Future, time::Duration};

use uuid::Uuid;

use crate::{
  Error,
  catalog::{ActionDefinition, EffectTypeDefinition, ImpactMapping, ResolvedEffect},
  effect_run::{EffectOutcome, EffectRun, EffectRunQuery},
  event::{NewEvent, SystemEvent},
  metric::{EventMetric, OutboxStats},
  outbox::{Claim, ClaimRequest, FailedCycle, OutboxEntry, OutboxQuery},
};

// ─── Query type ──────────────────────────────────────────────────────────────

/// Parameters for [`DispatchStore::list_events`]. Newest events first.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
  pub event_name:  Option<String>,
  pub entity_type: Option<String>,
  pub entity_id:   Option<String>,
  pub limit:       Option<usize>,
  pub offset:      Option<usize>,
}

// ─── Error classification ────────────────────────────────────────────────────

/// Backend errors that can expose the domain error they wrap, so generic
/// callers can tell a lost claim or an unknown action from an I/O failure.
/// Every backend error can also carry a plain domain error, which lets
/// callers reject input before reaching the backend.
pub trait StoreError: std::error::Error + From<Error> + Send + Sync + 'static {
  fn as_core(&self) -> Option<&Error>;

  fn is_claim_lost(&self) -> bool {
    matches!(self.as_core(), Some(Error::ClaimLost { .. }))
  }
}

impl StoreError for Error {
  fn as_core(&self) -> Option<&Error> { Some(self) }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over an Effector persistence backend.
///
/// `SystemEvent` rows are append-only. Outbox entries and effect runs are
/// written only by the worker holding the entry's claim; every such write
/// takes the claim `owner` and fails with [`Error::ClaimLost`] when the
/// claim has passed to someone else.
///
/// All methods return `Send` futures so the trait can be used from spawned
/// tokio tasks.
pub trait DispatchStore: Send + Sync {
  type Error: StoreError;

  // ── Catalog administration ────────────────────────────────────────────

  /// Insert an action, or update `is_active` / `description` of an
  /// existing one. `module` and `entity_type` never change once created.
  fn register_action(
    &self,
    action: ActionDefinition,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Insert an effect type, or update `is_active` / `description` of an
  /// existing one. `category` never changes once created.
  fn register_effect_type(
    &self,
    effect_type: EffectTypeDefinition,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Insert or update a mapping. Both ends must already be registered.
  fn register_mapping(
    &self,
    mapping: ImpactMapping,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn set_action_active(
    &self,
    action_name: String,
    active: bool,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn set_effect_type_active(
    &self,
    effect_type: String,
    active: bool,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn set_mapping_active(
    &self,
    action_name: String,
    effect_type: String,
    active: bool,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  // ── Catalog reads ─────────────────────────────────────────────────────

  fn list_actions(
    &self,
  ) -> impl Future<Output = Result<Vec<ActionDefinition>, Self::Error>> + Send + '_;

  fn list_effect_types(
    &self,
  ) -> impl Future<Output = Result<Vec<EffectTypeDefinition>, Self::Error>> + Send + '_;

  fn list_mappings(
    &self,
  ) -> impl Future<Output = Result<Vec<ImpactMapping>, Self::Error>> + Send + '_;

  /// The effects an occurrence of `action_name` fans out to, in execution
  /// order. See [`crate::catalog::resolve_effects`] for the rules.
  fn resolve_effects(
    &self,
    action_name: String,
  ) -> impl Future<Output = Result<Vec<ResolvedEffect>, Self::Error>> + Send + '_;

  // ── Events ────────────────────────────────────────────────────────────

  /// Atomically append a [`SystemEvent`] and its `pending` outbox entry.
  ///
  /// Fails with [`Error::UnknownAction`] if the action is not registered or
  /// not active, in which case nothing is written.
  fn record_event(
    &self,
    input: NewEvent,
  ) -> impl Future<Output = Result<SystemEvent, Self::Error>> + Send + '_;

  fn get_event(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<SystemEvent>, Self::Error>> + Send + '_;

  fn list_events<'a>(
    &'a self,
    query: &'a EventQuery,
  ) -> impl Future<Output = Result<Vec<SystemEvent>, Self::Error>> + Send + 'a;

  // ── Outbox: claim holder writes ───────────────────────────────────────

  /// Atomically claim up to `batch_size` claimable entries for `owner`.
  ///
  /// Claimable means `pending` and past `available_at`, or `processing`
  /// with an expired visibility deadline. Reclaiming an expired entry
  /// increments its `retry_count`; if that reaches `max_retries` the entry
  /// is marked `failed` and not returned.
  fn claim_batch(
    &self,
    request: ClaimRequest,
  ) -> impl Future<Output = Result<Vec<Claim>, Self::Error>> + Send + '_;

  /// Push the visibility deadline of a held claim to `now + visibility`.
  fn renew_claim(
    &self,
    entry_id: Uuid,
    owner: String,
    visibility: Duration,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Mark a claimed entry `completed`.
  ///
  /// Fails with [`Error::UnfinishedEffects`] while any of the event's effect
  /// runs is still `pending` or `processing`.
  fn complete_entry(
    &self,
    entry_id: Uuid,
    owner: String,
  ) -> impl Future<Output = Result<OutboxEntry, Self::Error>> + Send + '_;

  /// Record a failed dispatch cycle: increment `retry_count` and either
  /// requeue the entry behind `backoff` or, once `max_retries` is reached,
  /// mark it `failed`.
  fn release_failed(
    &self,
    failure: FailedCycle,
  ) -> impl Future<Output = Result<OutboxEntry, Self::Error>> + Send + '_;

  // ── Effect runs: claim holder writes ──────────────────────────────────

  /// Ensure exactly one effect run exists per resolved effect type for the
  /// event. Existing runs are left untouched.
  fn ensure_effect_runs(
    &self,
    entry_id: Uuid,
    owner: String,
    effects: Vec<ResolvedEffect>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Transition a run to `processing` and count the attempt.
  fn start_effect_run(
    &self,
    entry_id: Uuid,
    owner: String,
    run_id: Uuid,
  ) -> impl Future<Output = Result<EffectRun, Self::Error>> + Send + '_;

  /// Record a handler outcome on a `processing` run.
  fn finish_effect_run(
    &self,
    entry_id: Uuid,
    owner: String,
    run_id: Uuid,
    outcome: EffectOutcome,
  ) -> impl Future<Output = Result<EffectRun, Self::Error>> + Send + '_;

  // ── Operator actions ──────────────────────────────────────────────────

  /// Move a dead-lettered entry back to `pending`. `retry_count` is kept.
  fn replay_dead_letter(
    &self,
    entry_id: Uuid,
  ) -> impl Future<Output = Result<OutboxEntry, Self::Error>> + Send + '_;

  /// Reset a `failed` effect run to `pending` and reopen its entry so the
  /// dispatcher executes that effect again. Rejected while the entry is
  /// being processed.
  fn rerun_effect(
    &self,
    run_id: Uuid,
  ) -> impl Future<Output = Result<EffectRun, Self::Error>> + Send + '_;

  // ── Monitoring reads ──────────────────────────────────────────────────

  fn get_outbox_entry(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<OutboxEntry>, Self::Error>> + Send + '_;

  fn get_outbox_for_event(
    &self,
    event_id: Uuid,
  ) -> impl Future<Output = Result<Option<OutboxEntry>, Self::Error>> + Send + '_;

  fn list_outbox<'a>(
    &'a self,
    query: &'a OutboxQuery,
  ) -> impl Future<Output = Result<Vec<OutboxEntry>, Self::Error>> + Send + 'a;

  /// All runs for an event in execution order: `(priority, effect_type)`.
  fn list_effect_runs(
    &self,
    event_id: Uuid,
  ) -> impl Future<Output = Result<Vec<EffectRun>, Self::Error>> + Send + '_;

  fn search_effect_runs<'a>(
    &'a self,
    query: &'a EffectRunQuery,
  ) -> impl Future<Output = Result<Vec<EffectRun>, Self::Error>> + Send + 'a;

  // ── Metrics ───────────────────────────────────────────────────────────

  fn increment_metric(
    &self,
    event_name: String,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Most frequent events, descending by count then ascending by name.
  fn top_events(
    &self,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<EventMetric>, Self::Error>> + Send + '_;

  fn outbox_stats(
    &self,
  ) -> impl Future<Output = Result<OutboxStats, Self::Error>> + Send + '_;
}
