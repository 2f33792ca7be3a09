//! Outbox entries and the claim protocol.
//!
//! Every [`SystemEvent`] has exactly one outbox entry, written in the same
//! transaction. Workers take time-bounded ownership of entries by claiming
//! them; only the current claim holder may advance an entry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::SystemEvent;

// ─── Status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
  Pending,
  Processing,
  Completed,
  /// Retry budget exhausted; waits in the dead-letter view for an operator.
  Failed,
}

impl OutboxStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Completed | Self::Failed)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Processing => "processing",
      Self::Completed => "completed",
      Self::Failed => "failed",
    }
  }
}

impl std::fmt::Display for OutboxStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

// ─── Entry ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
  pub id:            Uuid,
  pub event_id:      Uuid,
  pub status:        OutboxStatus,
  /// Only ever increases over the lifetime of the entry.
  pub retry_count:   u32,
  pub last_error:    Option<String>,
  pub created_at:    DateTime<Utc>,
  /// Set when the entry reaches a terminal state.
  pub processed_at:  Option<DateTime<Utc>>,
  /// Worker currently holding the claim, if any.
  pub claimed_by:    Option<String>,
  /// Visibility deadline; past it the claim counts as abandoned.
  pub claimed_until: Option<DateTime<Utc>>,
  /// Earliest time the entry may be claimed again after a requeue.
  pub available_at:  DateTime<Utc>,
}

// ─── Claiming ────────────────────────────────────────────────────────────────

/// Parameters for [`crate::store::DispatchStore::claim_batch`].
#[derive(Debug, Clone)]
pub struct ClaimRequest {
  pub owner:              String,
  pub batch_size:         usize,
  pub visibility_timeout: Duration,
  /// Reclaiming an abandoned entry counts as a retry; an entry whose
  /// `retry_count` would reach this value is dead-lettered instead.
  pub max_retries:        u32,
}

/// A claimed entry together with the event it dispatches.
#[derive(Debug, Clone)]
pub struct Claim {
  pub entry: OutboxEntry,
  pub event: SystemEvent,
}

/// Input to [`crate::store::DispatchStore::release_failed`].
#[derive(Debug, Clone)]
pub struct FailedCycle {
  pub entry_id:    Uuid,
  pub owner:       String,
  pub error:       String,
  pub max_retries: u32,
  /// Delay before the requeued entry becomes claimable again.
  pub backoff:     Duration,
}

/// Parameters for [`crate::store::DispatchStore::list_outbox`].
#[derive(Debug, Clone, Default)]
pub struct OutboxQuery {
  pub status: Option<OutboxStatus>,
  pub limit:  Option<usize>,
  pub offset: Option<usize>,
}
