//! Effect runs: per-effect execution records created at fan-out time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectRunStatus {
  Pending,
  Processing,
  Completed,
  Failed,
}

impl EffectRunStatus {
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

impl std::fmt::Display for EffectRunStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One row per `(event_id, effect_type)`; reused across retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectRun {
  pub id:            Uuid,
  pub event_id:      Uuid,
  pub effect_type:   String,
  /// Mapping priority at fan-out time; drives execution order.
  pub priority:      i32,
  pub status:        EffectRunStatus,
  /// Number of times a handler has been invoked for this run.
  pub attempts:      u32,
  pub error_message: Option<String>,
  pub created_at:    DateTime<Utc>,
  pub started_at:    Option<DateTime<Utc>>,
  pub completed_at:  Option<DateTime<Utc>>,
}

/// What a handler invocation produced, as recorded on the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectOutcome {
  Succeeded,
  Failed(String),
}

impl EffectOutcome {
  pub fn status(&self) -> EffectRunStatus {
    match self {
      Self::Succeeded => EffectRunStatus::Completed,
      Self::Failed(_) => EffectRunStatus::Failed,
    }
  }
}

/// Parameters for [`crate::store::DispatchStore::search_effect_runs`].
#[derive(Debug, Clone, Default)]
pub struct EffectRunQuery {
  pub status:      Option<EffectRunStatus>,
  pub effect_type: Option<String>,
  pub limit:       Option<usize>,
}
