//! Observability read models. Never a source of truth.

use serde::{Deserialize, Serialize};

/// Per-event-name occurrence counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetric {
  pub event_name:  String,
  pub event_count: u64,
}

/// Row counts by status, for dashboard tiles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
  pub outbox_pending:     u64,
  pub outbox_processing:  u64,
  pub outbox_completed:   u64,
  pub outbox_failed:      u64,
  pub effects_pending:    u64,
  pub effects_processing: u64,
  pub effects_completed:  u64,
  pub effects_failed:     u64,
}
