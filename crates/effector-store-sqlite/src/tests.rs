//! Integration tests for `SqliteStore` against an in-memory database.

use std::time::Duration;

use effector_core::{
  Error as CoreError,
  catalog::{ActionDefinition, EffectTypeDefinition, ImpactMapping},
  effect_run::{EffectOutcome, EffectRunQuery, EffectRunStatus},
  event::NewEvent,
  outbox::{Claim, ClaimRequest, FailedCycle, OutboxQuery, OutboxStatus},
  store::{DispatchStore, EventQuery, StoreError as _},
};
use uuid::Uuid;

use crate::{Error, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn action(name: &str) -> ActionDefinition {
  ActionDefinition {
    action_name: name.into(),
    module:      "hr".into(),
    entity_type: "employee".into(),
    is_active:   true,
    description: None,
  }
}

fn effect(name: &str) -> EffectTypeDefinition {
  EffectTypeDefinition {
    effect_type: name.into(),
    category:    "notification".into(),
    is_active:   true,
    description: None,
  }
}

fn mapping(action: &str, effect: &str, priority: i32) -> ImpactMapping {
  ImpactMapping {
    action_name: action.into(),
    effect_type: effect.into(),
    priority,
    is_active: true,
  }
}

/// `employee.updated` → `notify_manager` (1), `recalc_payroll` (2);
/// `trip.approved` with no mappings.
async fn seeded() -> SqliteStore {
  let s = store().await;
  s.register_action(action("employee.updated")).await.unwrap();
  s.register_action(action("trip.approved")).await.unwrap();
  s.register_effect_type(effect("notify_manager")).await.unwrap();
  s.register_effect_type(effect("recalc_payroll")).await.unwrap();
  s.register_mapping(mapping("employee.updated", "notify_manager", 1))
    .await
    .unwrap();
  s.register_mapping(mapping("employee.updated", "recalc_payroll", 2))
    .await
    .unwrap();
  s
}

fn employee_updated() -> NewEvent {
  NewEvent::new("employee.updated", "employee", "42", "hr")
    .with_payload(serde_json::json!({ "field": "salary" }))
}

fn claim_request(owner: &str) -> ClaimRequest {
  ClaimRequest {
    owner:              owner.into(),
    batch_size:         10,
    visibility_timeout: Duration::from_secs(60),
    max_retries:        3,
  }
}

async fn claim_one(s: &SqliteStore, owner: &str) -> Claim {
  let mut claims = s.claim_batch(claim_request(owner)).await.unwrap();
  assert_eq!(claims.len(), 1, "expected exactly one claimable entry");
  claims.remove(0)
}

fn core_err(e: &Error) -> &CoreError {
  e.as_core().expect("core error")
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn resolve_orders_by_priority() {
  let s = store().await;
  s.register_action(action("employee.updated")).await.unwrap();
  for name in ["third", "first", "second"] {
    s.register_effect_type(effect(name)).await.unwrap();
  }
  s.register_mapping(mapping("employee.updated", "third", 3)).await.unwrap();
  s.register_mapping(mapping("employee.updated", "first", 1)).await.unwrap();
  s.register_mapping(mapping("employee.updated", "second", 2)).await.unwrap();

  for _ in 0..3 {
    let resolved = s.resolve_effects("employee.updated".into()).await.unwrap();
    let order: Vec<_> = resolved.iter().map(|r| r.effect_type.as_str()).collect();
    assert_eq!(order, ["first", "second", "third"]);
  }
}

#[tokio::test]
async fn resolve_skips_inactive_action_and_effect_type() {
  let s = seeded().await;

  s.set_effect_type_active("notify_manager".into(), false).await.unwrap();
  let resolved = s.resolve_effects("employee.updated".into()).await.unwrap();
  assert_eq!(resolved.len(), 1);
  assert_eq!(resolved[0].effect_type, "recalc_payroll");

  s.set_action_active("employee.updated".into(), false).await.unwrap();
  assert!(s.resolve_effects("employee.updated".into()).await.unwrap().is_empty());
}

#[tokio::test]
async fn resolve_skips_inactive_mapping() {
  let s = seeded().await;
  s.set_mapping_active("employee.updated".into(), "recalc_payroll".into(), false)
    .await
    .unwrap();

  let resolved = s.resolve_effects("employee.updated".into()).await.unwrap();
  assert_eq!(resolved.len(), 1);
  assert_eq!(resolved[0].effect_type, "notify_manager");
}

#[tokio::test]
async fn mapping_requires_registered_ends() {
  let s = seeded().await;

  let err = s
    .register_mapping(mapping("employee.deleted", "notify_manager", 1))
    .await
    .unwrap_err();
  assert!(matches!(core_err(&err), CoreError::UnknownAction(_)));

  let err = s
    .register_mapping(mapping("employee.updated", "send_fax", 1))
    .await
    .unwrap_err();
  assert!(matches!(core_err(&err), CoreError::UnknownEffectType(_)));
}

#[tokio::test]
async fn reregistering_action_only_updates_mutable_fields() {
  let s = seeded().await;

  let mut changed = action("employee.updated");
  changed.module = "payroll".into();
  changed.is_active = false;
  changed.description = Some("retired".into());
  s.register_action(changed).await.unwrap();

  let actions = s.list_actions().await.unwrap();
  let stored = actions
    .iter()
    .find(|a| a.action_name == "employee.updated")
    .unwrap();
  assert_eq!(stored.module, "hr");
  assert!(!stored.is_active);
  assert_eq!(stored.description.as_deref(), Some("retired"));
}

#[tokio::test]
async fn set_active_on_unknown_rows_fails() {
  let s = seeded().await;
  let err = s.set_action_active("nope".into(), true).await.unwrap_err();
  assert!(matches!(core_err(&err), CoreError::UnknownAction(_)));

  let err = s
    .set_mapping_active("trip.approved".into(), "notify_manager".into(), true)
    .await
    .unwrap_err();
  assert!(matches!(core_err(&err), CoreError::MappingNotFound { .. }));
}

// ─── Recording ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn record_event_writes_event_and_pending_outbox_entry() {
  let s = seeded().await;
  let event = s.record_event(employee_updated()).await.unwrap();

  let fetched = s.get_event(event.id).await.unwrap().unwrap();
  assert_eq!(fetched, event);
  assert_eq!(fetched.payload["field"], "salary");

  let entry = s.get_outbox_for_event(event.id).await.unwrap().unwrap();
  assert_eq!(entry.status, OutboxStatus::Pending);
  assert_eq!(entry.retry_count, 0);
  assert!(entry.claimed_by.is_none());
  assert!(entry.processed_at.is_none());
}

#[tokio::test]
async fn unknown_action_writes_nothing() {
  let s = seeded().await;
  let err = s
    .record_event(NewEvent::new("employee.deleted", "employee", "42", "hr"))
    .await
    .unwrap_err();
  assert!(matches!(core_err(&err), CoreError::UnknownAction(_)));

  assert!(s.list_events(&EventQuery::default()).await.unwrap().is_empty());
  assert!(s.list_outbox(&OutboxQuery::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn inactive_action_is_rejected() {
  let s = seeded().await;
  s.set_action_active("employee.updated".into(), false).await.unwrap();
  let err = s.record_event(employee_updated()).await.unwrap_err();
  assert!(matches!(core_err(&err), CoreError::UnknownAction(_)));
}

#[tokio::test]
async fn list_events_filters_by_name() {
  let s = seeded().await;
  s.record_event(employee_updated()).await.unwrap();
  s.record_event(NewEvent::new("trip.approved", "trip", "7", "travel"))
    .await
    .unwrap();

  let query = EventQuery {
    event_name: Some("trip.approved".into()),
    ..Default::default()
  };
  let events = s.list_events(&query).await.unwrap();
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].entity_id, "7");
}

#[tokio::test]
async fn oversized_limits_saturate_instead_of_wrapping() {
  let s = seeded().await;
  s.record_event(employee_updated()).await.unwrap();
  s.increment_metric("employee.updated".into()).await.unwrap();

  let all = EventQuery {
    limit: Some(usize::MAX),
    ..Default::default()
  };
  assert_eq!(s.list_events(&all).await.unwrap().len(), 1);

  let past_the_end = EventQuery {
    offset: Some(usize::MAX),
    ..Default::default()
  };
  assert!(s.list_events(&past_the_end).await.unwrap().is_empty());

  let outbox_past_the_end = OutboxQuery {
    offset: Some(usize::MAX),
    ..Default::default()
  };
  assert!(s.list_outbox(&outbox_past_the_end).await.unwrap().is_empty());

  assert_eq!(s.top_events(usize::MAX).await.unwrap().len(), 1);
}

// ─── Claiming ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn claim_moves_entry_to_processing() {
  let s = seeded().await;
  let event = s.record_event(employee_updated()).await.unwrap();

  let claim = claim_one(&s, "w1").await;
  assert_eq!(claim.event.id, event.id);
  assert_eq!(claim.entry.status, OutboxStatus::Processing);
  assert_eq!(claim.entry.claimed_by.as_deref(), Some("w1"));
  assert!(claim.entry.claimed_until.is_some());

  // Nothing left for a second worker.
  assert!(s.claim_batch(claim_request("w2")).await.unwrap().is_empty());
}

#[tokio::test]
async fn claim_respects_batch_size() {
  let s = seeded().await;
  for _ in 0..5 {
    s.record_event(employee_updated()).await.unwrap();
  }
  let mut req = claim_request("w1");
  req.batch_size = 2;
  assert_eq!(s.claim_batch(req.clone()).await.unwrap().len(), 2);
  assert_eq!(s.claim_batch(req.clone()).await.unwrap().len(), 2);
  assert_eq!(s.claim_batch(req).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_claims_have_a_single_winner() {
  let s = seeded().await;
  s.record_event(employee_updated()).await.unwrap();

  let mut handles = Vec::new();
  for i in 0..16 {
    let s = s.clone();
    handles.push(tokio::spawn(async move {
      s.claim_batch(claim_request(&format!("w{i}"))).await.unwrap().len()
    }));
  }

  let mut total = 0;
  for h in handles {
    total += h.await.unwrap();
  }
  assert_eq!(total, 1);
}

#[tokio::test]
async fn claims_across_connections_have_a_single_winner() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("effector.db");

  let first = SqliteStore::open(&path).await.unwrap();
  first.register_action(action("employee.updated")).await.unwrap();
  first.record_event(employee_updated()).await.unwrap();

  let mut stores = vec![first];
  for _ in 0..3 {
    stores.push(SqliteStore::open(&path).await.unwrap());
  }

  let mut handles = Vec::new();
  for (i, s) in stores.into_iter().enumerate() {
    handles.push(tokio::spawn(async move {
      s.claim_batch(claim_request(&format!("proc-{i}"))).await.unwrap().len()
    }));
  }

  let mut total = 0;
  for h in handles {
    total += h.await.unwrap();
  }
  assert_eq!(total, 1);
}

#[tokio::test]
async fn expired_claim_is_reclaimed_with_retry_increment() {
  let s = seeded().await;
  let event = s.record_event(employee_updated()).await.unwrap();

  let mut req = claim_request("crashed");
  req.visibility_timeout = Duration::ZERO;
  assert_eq!(s.claim_batch(req).await.unwrap().len(), 1);

  tokio::time::sleep(Duration::from_millis(5)).await;

  let claim = claim_one(&s, "rescuer").await;
  assert_eq!(claim.event.id, event.id);
  assert_eq!(claim.entry.retry_count, 1);
  assert_eq!(claim.entry.claimed_by.as_deref(), Some("rescuer"));
  assert_eq!(claim.entry.last_error.as_deref(), Some("claim expired"));
}

#[tokio::test]
async fn expired_claim_at_budget_is_dead_lettered() {
  let s = seeded().await;
  let event = s.record_event(employee_updated()).await.unwrap();

  let mut req = claim_request("crashed");
  req.visibility_timeout = Duration::ZERO;
  req.max_retries = 1;
  assert_eq!(s.claim_batch(req.clone()).await.unwrap().len(), 1);

  tokio::time::sleep(Duration::from_millis(5)).await;
  assert!(s.claim_batch(req).await.unwrap().is_empty());

  let entry = s.get_outbox_for_event(event.id).await.unwrap().unwrap();
  assert_eq!(entry.status, OutboxStatus::Failed);
  assert_eq!(entry.retry_count, 1);
  assert!(entry.processed_at.is_some());
}

#[tokio::test]
async fn stale_owner_loses_claim() {
  let s = seeded().await;
  s.record_event(employee_updated()).await.unwrap();
  let claim = claim_one(&s, "w1").await;

  let err = s
    .renew_claim(claim.entry.id, "w2".into(), Duration::from_secs(60))
    .await
    .unwrap_err();
  assert!(err.is_claim_lost());

  let err = s.complete_entry(claim.entry.id, "w2".into()).await.unwrap_err();
  assert!(err.is_claim_lost());

  s.renew_claim(claim.entry.id, "w1".into(), Duration::from_secs(60))
    .await
    .unwrap();
}

// ─── Effect runs & roll-up ───────────────────────────────────────────────────

#[tokio::test]
async fn ensure_effect_runs_is_idempotent() {
  let s = seeded().await;
  let event = s.record_event(employee_updated()).await.unwrap();
  let claim = claim_one(&s, "w1").await;
  let resolved = s.resolve_effects(event.event_name.clone()).await.unwrap();

  s.ensure_effect_runs(claim.entry.id, "w1".into(), resolved.clone())
    .await
    .unwrap();
  let first = s.list_effect_runs(event.id).await.unwrap();

  s.ensure_effect_runs(claim.entry.id, "w1".into(), resolved)
    .await
    .unwrap();
  let second = s.list_effect_runs(event.id).await.unwrap();

  assert_eq!(first.len(), 2);
  assert_eq!(first, second);
  assert_eq!(first[0].effect_type, "notify_manager");
  assert_eq!(first[1].effect_type, "recalc_payroll");
  assert!(first.iter().all(|r| r.status == EffectRunStatus::Pending));
}

#[tokio::test]
async fn complete_requires_every_run_terminal() {
  let s = seeded().await;
  let event = s.record_event(employee_updated()).await.unwrap();
  let claim = claim_one(&s, "w1").await;
  let entry_id = claim.entry.id;
  let resolved = s.resolve_effects(event.event_name.clone()).await.unwrap();
  s.ensure_effect_runs(entry_id, "w1".into(), resolved).await.unwrap();

  let runs = s.list_effect_runs(event.id).await.unwrap();

  s.start_effect_run(entry_id, "w1".into(), runs[0].id).await.unwrap();
  s.finish_effect_run(entry_id, "w1".into(), runs[0].id, EffectOutcome::Succeeded)
    .await
    .unwrap();

  let err = s.complete_entry(entry_id, "w1".into()).await.unwrap_err();
  assert!(matches!(
    core_err(&err),
    CoreError::UnfinishedEffects { unfinished: 1, .. }
  ));

  let started = s.start_effect_run(entry_id, "w1".into(), runs[1].id).await.unwrap();
  assert_eq!(started.status, EffectRunStatus::Processing);
  assert_eq!(started.attempts, 1);

  let failed = s
    .finish_effect_run(
      entry_id,
      "w1".into(),
      runs[1].id,
      EffectOutcome::Failed("payroll offline".into()),
    )
    .await
    .unwrap();
  assert_eq!(failed.status, EffectRunStatus::Failed);
  assert_eq!(failed.error_message.as_deref(), Some("payroll offline"));
  assert!(failed.completed_at.is_some());

  let entry = s.complete_entry(entry_id, "w1".into()).await.unwrap();
  assert_eq!(entry.status, OutboxStatus::Completed);
  assert!(entry.processed_at.is_some());
  assert!(entry.claimed_by.is_none());
}

#[tokio::test]
async fn finishing_a_pending_run_is_an_invalid_transition() {
  let s = seeded().await;
  let event = s.record_event(employee_updated()).await.unwrap();
  let claim = claim_one(&s, "w1").await;
  let resolved = s.resolve_effects(event.event_name.clone()).await.unwrap();
  s.ensure_effect_runs(claim.entry.id, "w1".into(), resolved).await.unwrap();
  let runs = s.list_effect_runs(event.id).await.unwrap();

  let err = s
    .finish_effect_run(claim.entry.id, "w1".into(), runs[0].id, EffectOutcome::Succeeded)
    .await
    .unwrap_err();
  assert!(matches!(core_err(&err), CoreError::InvalidTransition { .. }));
}

// ─── Failure bookkeeping ─────────────────────────────────────────────────────

fn failure(entry_id: Uuid, owner: &str, max_retries: u32, backoff: Duration) -> FailedCycle {
  FailedCycle {
    entry_id,
    owner: owner.into(),
    error: "database unavailable".into(),
    max_retries,
    backoff,
  }
}

#[tokio::test]
async fn failed_cycle_requeues_behind_backoff() {
  let s = seeded().await;
  s.record_event(employee_updated()).await.unwrap();
  let claim = claim_one(&s, "w1").await;

  let entry = s
    .release_failed(failure(claim.entry.id, "w1", 3, Duration::from_secs(3600)))
    .await
    .unwrap();
  assert_eq!(entry.status, OutboxStatus::Pending);
  assert_eq!(entry.retry_count, 1);
  assert_eq!(entry.last_error.as_deref(), Some("database unavailable"));
  assert!(entry.available_at > claim.entry.available_at);

  // Still backing off.
  assert!(s.claim_batch(claim_request("w2")).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_cycle_at_last_retry_dead_letters() {
  let s = seeded().await;
  s.record_event(employee_updated()).await.unwrap();

  // Burn retries until retry_count = max - 1.
  for expected in 1..3 {
    let claim = claim_one(&s, "w1").await;
    let entry = s
      .release_failed(failure(claim.entry.id, "w1", 3, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(entry.status, OutboxStatus::Pending);
    assert_eq!(entry.retry_count, expected);
  }

  let claim = claim_one(&s, "w1").await;
  assert_eq!(claim.entry.retry_count, 2);
  let entry = s
    .release_failed(failure(claim.entry.id, "w1", 3, Duration::ZERO))
    .await
    .unwrap();
  assert_eq!(entry.status, OutboxStatus::Failed);
  assert_eq!(entry.retry_count, 3);

  let dead = s
    .list_outbox(&OutboxQuery {
      status: Some(OutboxStatus::Failed),
      ..Default::default()
    })
    .await
    .unwrap();
  assert_eq!(dead.len(), 1);
}

#[tokio::test]
async fn replay_dead_letter_keeps_retry_count() {
  let s = seeded().await;
  s.record_event(employee_updated()).await.unwrap();
  let claim = claim_one(&s, "w1").await;
  s.release_failed(failure(claim.entry.id, "w1", 1, Duration::ZERO))
    .await
    .unwrap();

  let replayed = s.replay_dead_letter(claim.entry.id).await.unwrap();
  assert_eq!(replayed.status, OutboxStatus::Pending);
  assert_eq!(replayed.retry_count, 1);
  assert!(replayed.processed_at.is_none());

  let err = s.replay_dead_letter(claim.entry.id).await.unwrap_err();
  assert!(matches!(core_err(&err), CoreError::InvalidTransition { .. }));

  let err = s.replay_dead_letter(Uuid::new_v4()).await.unwrap_err();
  assert!(matches!(core_err(&err), CoreError::OutboxEntryNotFound(_)));
}

#[tokio::test]
async fn rerun_effect_reopens_completed_entry() {
  let s = seeded().await;
  let event = s.record_event(employee_updated()).await.unwrap();
  let claim = claim_one(&s, "w1").await;
  let entry_id = claim.entry.id;
  let resolved = s.resolve_effects(event.event_name.clone()).await.unwrap();
  s.ensure_effect_runs(entry_id, "w1".into(), resolved).await.unwrap();

  let runs = s.list_effect_runs(event.id).await.unwrap();

  // A run that has not failed cannot be re-run.
  let err = s.rerun_effect(runs[0].id).await.unwrap_err();
  assert!(matches!(core_err(&err), CoreError::InvalidTransition { .. }));

  for (run, outcome) in runs.iter().zip([
    EffectOutcome::Succeeded,
    EffectOutcome::Failed("timeout".into()),
  ]) {
    s.start_effect_run(entry_id, "w1".into(), run.id).await.unwrap();
    s.finish_effect_run(entry_id, "w1".into(), run.id, outcome).await.unwrap();
  }
  s.complete_entry(entry_id, "w1".into()).await.unwrap();

  let rerun = s.rerun_effect(runs[1].id).await.unwrap();
  assert_eq!(rerun.status, EffectRunStatus::Pending);
  assert!(rerun.error_message.is_none());
  assert_eq!(rerun.attempts, 1);

  let entry = s.get_outbox_entry(entry_id).await.unwrap().unwrap();
  assert_eq!(entry.status, OutboxStatus::Pending);

  let after = s.list_effect_runs(event.id).await.unwrap();
  assert_eq!(after[0].status, EffectRunStatus::Completed);
}

#[tokio::test]
async fn rerun_is_rejected_while_entry_is_claimed() {
  let s = seeded().await;
  let event = s.record_event(employee_updated()).await.unwrap();
  let claim = claim_one(&s, "w1").await;
  let entry_id = claim.entry.id;
  let resolved = s.resolve_effects(event.event_name.clone()).await.unwrap();
  s.ensure_effect_runs(entry_id, "w1".into(), resolved).await.unwrap();
  let runs = s.list_effect_runs(event.id).await.unwrap();
  s.start_effect_run(entry_id, "w1".into(), runs[0].id).await.unwrap();
  s.finish_effect_run(entry_id, "w1".into(), runs[0].id, EffectOutcome::Failed("x".into()))
    .await
    .unwrap();

  let err = s.rerun_effect(runs[0].id).await.unwrap_err();
  assert!(matches!(core_err(&err), CoreError::InvalidTransition { .. }));
}

// ─── Metrics & monitoring ────────────────────────────────────────────────────

#[tokio::test]
async fn top_events_orders_by_count_then_name() {
  let s = store().await;
  for name in ["b", "a", "c", "c", "a", "c"] {
    s.increment_metric(name.into()).await.unwrap();
  }

  let top = s.top_events(2).await.unwrap();
  assert_eq!(top.len(), 2);
  assert_eq!((top[0].event_name.as_str(), top[0].event_count), ("c", 3));
  assert_eq!((top[1].event_name.as_str(), top[1].event_count), ("a", 2));
}

#[tokio::test]
async fn outbox_stats_counts_by_status() {
  let s = seeded().await;
  let event = s.record_event(employee_updated()).await.unwrap();
  s.record_event(employee_updated()).await.unwrap();

  let mut req = claim_request("w1");
  req.batch_size = 1;
  let claim = s.claim_batch(req).await.unwrap().remove(0);
  let resolved = s.resolve_effects(event.event_name.clone()).await.unwrap();
  s.ensure_effect_runs(claim.entry.id, "w1".into(), resolved).await.unwrap();

  let stats = s.outbox_stats().await.unwrap();
  assert_eq!(stats.outbox_pending, 1);
  assert_eq!(stats.outbox_processing, 1);
  assert_eq!(stats.effects_pending, 2);
  assert_eq!(stats.outbox_failed, 0);
}

#[tokio::test]
async fn search_effect_runs_filters_by_status() {
  let s = seeded().await;
  let event = s.record_event(employee_updated()).await.unwrap();
  let claim = claim_one(&s, "w1").await;
  let resolved = s.resolve_effects(event.event_name.clone()).await.unwrap();
  s.ensure_effect_runs(claim.entry.id, "w1".into(), resolved).await.unwrap();
  let runs = s.list_effect_runs(event.id).await.unwrap();
  s.start_effect_run(claim.entry.id, "w1".into(), runs[1].id).await.unwrap();
  s.finish_effect_run(
    claim.entry.id,
    "w1".into(),
    runs[1].id,
    EffectOutcome::Failed("nope".into()),
  )
  .await
  .unwrap();

  let failed = s
    .search_effect_runs(&EffectRunQuery {
      status: Some(EffectRunStatus::Failed),
      ..Default::default()
    })
    .await
    .unwrap();
  assert_eq!(failed.len(), 1);
  assert_eq!(failed[0].effect_type, "recalc_payroll");
}
