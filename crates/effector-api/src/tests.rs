use std::{sync::Arc, time::Duration};

use axum::{
  body::Body,
  http::{Request, StatusCode, header},
};
use effector_core::{
  catalog::{ActionDefinition, EffectTypeDefinition, ImpactMapping},
  outbox::{ClaimRequest, FailedCycle},
  store::DispatchStore,
};
use effector_dispatch::{Dispatcher, DispatcherConfig, EffectError, HandlerRegistry, handler_fn};
use effector_store_sqlite::SqliteStore;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tower::ServiceExt as _;
use uuid::Uuid;

use crate::{ApiState, api_router};

async fn make_state() -> ApiState<SqliteStore> {
  let store = SqliteStore::open_in_memory().await.unwrap();
  store
    .register_action(ActionDefinition {
      action_name: "employee.updated".into(),
      module:      "hr".into(),
      entity_type: "employee".into(),
      is_active:   true,
      description: Some("Employee record changed".into()),
    })
    .await
    .unwrap();
  for (effect_type, priority) in [("recalc_payroll", 2), ("notify_manager", 1)] {
    store
      .register_effect_type(EffectTypeDefinition {
        effect_type: effect_type.into(),
        category:    "notification".into(),
        is_active:   true,
        description: None,
      })
      .await
      .unwrap();
    store
      .register_mapping(ImpactMapping {
        action_name: "employee.updated".into(),
        effect_type: effect_type.into(),
        priority,
        is_active: true,
      })
      .await
      .unwrap();
  }
  ApiState::new(Arc::new(store), Arc::new(Notify::new()))
}

async fn call(
  state: &ApiState<SqliteStore>,
  method: &str,
  uri: &str,
  body: Option<Value>,
) -> (StatusCode, Value) {
  let builder = Request::builder().method(method).uri(uri);
  let req = match body {
    Some(body) => builder
      .header(header::CONTENT_TYPE, "application/json")
      .body(Body::from(body.to_string()))
      .unwrap(),
    None => builder.body(Body::empty()).unwrap(),
  };
  let resp = api_router(state.clone()).oneshot(req).await.unwrap();
  let status = resp.status();
  let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
    .await
    .unwrap();
  let value = if bytes.is_empty() {
    Value::Null
  } else {
    serde_json::from_slice(&bytes).unwrap()
  };
  (status, value)
}

fn employee_updated() -> Value {
  json!({
    "action_name": "employee.updated",
    "entity_type": "employee",
    "entity_id":   "42",
    "module":      "hr",
    "payload":     { "field": "salary" },
  })
}

/// Drain the outbox with `recalc_payroll` failing.
async fn dispatch(state: &ApiState<SqliteStore>) {
  let handlers = HandlerRegistry::new()
    .with("notify_manager", handler_fn(|_| async { Ok(()) }))
    .with(
      "recalc_payroll",
      handler_fn(|_| async { Err(EffectError::new("payroll offline")) }),
    );
  let config = DispatcherConfig {
    backoff_base_ms: 0,
    backoff_max_ms: 0,
    ..Default::default()
  };
  Dispatcher::new(state.store.clone(), handlers, config)
    .run_until_idle()
    .await
    .unwrap();
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn post_event_returns_201_and_queues_outbox_entry() {
  let state = make_state().await;
  let (status, event) = call(&state, "POST", "/events", Some(employee_updated())).await;
  assert_eq!(status, StatusCode::CREATED);
  assert_eq!(event["event_name"], "employee.updated");
  assert_eq!(event["payload"]["field"], "salary");

  let id = event["id"].as_str().unwrap();
  let (status, detail) = call(&state, "GET", &format!("/events/{id}"), None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(detail["outbox"]["status"], "pending");
  assert_eq!(detail["effect_runs"], json!([]));

  let (_, events) = call(&state, "GET", "/events?event_name=employee.updated", None).await;
  assert_eq!(events.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_action_is_422() {
  let state = make_state().await;
  let mut body = employee_updated();
  body["action_name"] = json!("employee.deleted");
  let (status, err) = call(&state, "POST", "/events", Some(body)).await;
  assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
  assert!(err["error"].as_str().unwrap().contains("employee.deleted"));

  let (_, entries) = call(&state, "GET", "/outbox", None).await;
  assert_eq!(entries, json!([]));
}

#[tokio::test]
async fn blank_entity_id_is_400() {
  let state = make_state().await;
  let mut body = employee_updated();
  body["entity_id"] = json!("");
  let (status, _) = call(&state, "POST", "/events", Some(body)).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_event_is_404() {
  let state = make_state().await;
  let (status, _) = call(&state, "GET", &format!("/events/{}", Uuid::new_v4()), None).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}

// ─── Effect runs ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_effect_can_be_rerun_once() {
  let state = make_state().await;
  let (_, event) = call(&state, "POST", "/events", Some(employee_updated())).await;
  dispatch(&state).await;

  let id = event["id"].as_str().unwrap();
  let (_, detail) = call(&state, "GET", &format!("/events/{id}"), None).await;
  assert_eq!(detail["outbox"]["status"], "completed");
  assert_eq!(detail["effect_runs"][0]["effect_type"], "notify_manager");
  assert_eq!(detail["effect_runs"][1]["status"], "failed");

  let (status, failed) = call(&state, "GET", "/effect-runs?status=failed", None).await;
  assert_eq!(status, StatusCode::OK);
  let failed = failed.as_array().unwrap();
  assert_eq!(failed.len(), 1);
  assert_eq!(failed[0]["error_message"], "payroll offline");

  let run_id = failed[0]["id"].as_str().unwrap();
  let (status, run) = call(&state, "POST", &format!("/effect-runs/{run_id}/rerun"), None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(run["status"], "pending");

  let (status, _) = call(&state, "POST", &format!("/effect-runs/{run_id}/rerun"), None).await;
  assert_eq!(status, StatusCode::CONFLICT);

  let (_, detail) = call(&state, "GET", &format!("/events/{id}"), None).await;
  assert_eq!(detail["outbox"]["status"], "pending");
}

// ─── Outbox ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn dead_letter_can_be_replayed() {
  let state = make_state().await;
  call(&state, "POST", "/events", Some(employee_updated())).await;

  // Dead-letter the entry by hand.
  let claim = state
    .store
    .claim_batch(ClaimRequest {
      owner:              "w1".into(),
      batch_size:         1,
      visibility_timeout: Duration::from_secs(60),
      max_retries:        1,
    })
    .await
    .unwrap()
    .remove(0);
  state
    .store
    .release_failed(FailedCycle {
      entry_id:    claim.entry.id,
      owner:       "w1".into(),
      error:       "database unavailable".into(),
      max_retries: 1,
      backoff:     Duration::ZERO,
    })
    .await
    .unwrap();

  let (_, dead) = call(&state, "GET", "/outbox/dead-letters", None).await;
  let dead = dead.as_array().unwrap();
  assert_eq!(dead.len(), 1);
  assert_eq!(dead[0]["last_error"], "database unavailable");

  let id = claim.entry.id;
  let (status, entry) = call(&state, "POST", &format!("/outbox/{id}/replay"), None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(entry["status"], "pending");
  assert_eq!(entry["retry_count"], 1);

  let (status, _) = call(&state, "POST", &format!("/outbox/{id}/replay"), None).await;
  assert_eq!(status, StatusCode::CONFLICT);

  let (status, _) = call(
    &state,
    "POST",
    &format!("/outbox/{}/replay", Uuid::new_v4()),
    None,
  )
  .await;
  assert_eq!(status, StatusCode::NOT_FOUND);

  let (_, pending) = call(&state, "GET", "/outbox?status=pending", None).await;
  assert_eq!(pending.as_array().unwrap().len(), 1);
}

// ─── Catalog & metrics ───────────────────────────────────────────────────────

#[tokio::test]
async fn effects_preview_is_priority_ordered() {
  let state = make_state().await;
  let (status, effects) = call(&state, "GET", "/catalog/actions/employee.updated/effects", None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(effects[0]["effect_type"], "notify_manager");
  assert_eq!(effects[1]["effect_type"], "recalc_payroll");

  let (status, _) = call(&state, "GET", "/catalog/actions/trip.approved/effects", None).await;
  assert_eq!(status, StatusCode::NOT_FOUND);

  let (_, mappings) = call(&state, "GET", "/catalog/mappings", None).await;
  assert_eq!(mappings.as_array().unwrap().len(), 2);
  let (_, actions) = call(&state, "GET", "/catalog/actions", None).await;
  assert_eq!(actions[0]["description"], "Employee record changed");
  let (_, effect_types) = call(&state, "GET", "/catalog/effect-types", None).await;
  assert_eq!(effect_types.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn metrics_report_counts() {
  let state = make_state().await;
  state.store.increment_metric("trip.approved".into()).await.unwrap();
  for id in ["42", "43"] {
    let mut body = employee_updated();
    body["entity_id"] = json!(id);
    let (status, _) = call(&state, "POST", "/events", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
  }

  // Ingress counts in the background.
  let expected = json!([{ "event_name": "employee.updated", "event_count": 2 }]);
  let mut top = Value::Null;
  for _ in 0..200 {
    let (status, body) = call(&state, "GET", "/metrics/top?limit=1", None).await;
    assert_eq!(status, StatusCode::OK);
    top = body;
    if top == expected {
      break;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  assert_eq!(top, expected);

  let (_, stats) = call(&state, "GET", "/metrics/outbox", None).await;
  assert_eq!(stats["outbox_pending"], 2);
  assert_eq!(stats["effects_pending"], 0);
}
