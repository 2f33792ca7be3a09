//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (microseconds, `Z`
//! suffix) so that lexical comparison in SQL matches chronological order.
//! UUIDs are stored as hyphenated lowercase strings. Payloads are JSON text.

use chrono::{DateTime, SecondsFormat, Utc};
use effector_core::{
  effect_run::{EffectRun, EffectRunStatus},
  event::SystemEvent,
  outbox::{OutboxEntry, OutboxStatus},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ────────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

fn decode_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
  s.as_deref().map(decode_dt).transpose()
}

// ─── Statuses ─────────────────────────────────────────────────────────────────

pub fn decode_outbox_status(s: &str) -> Result<OutboxStatus> {
  match s {
    "pending" => Ok(OutboxStatus::Pending),
    "processing" => Ok(OutboxStatus::Processing),
    "completed" => Ok(OutboxStatus::Completed),
    "failed" => Ok(OutboxStatus::Failed),
    other => Err(Error::Decode {
      column: "outbox.status",
      value:  other.to_owned(),
    }),
  }
}

pub fn decode_run_status(s: &str) -> Result<EffectRunStatus> {
  match s {
    "pending" => Ok(EffectRunStatus::Pending),
    "processing" => Ok(EffectRunStatus::Processing),
    "completed" => Ok(EffectRunStatus::Completed),
    "failed" => Ok(EffectRunStatus::Failed),
    other => Err(Error::Decode {
      column: "effect_runs.status",
      value:  other.to_owned(),
    }),
  }
}

// ─── Column lists ─────────────────────────────────────────────────────────────

pub const EVENT_COLUMNS: &str =
  "e.id, e.event_name, e.entity_type, e.entity_id, e.module, e.occurred_at, e.payload";

pub const OUTBOX_COLUMNS: &str = "o.id, o.event_id, o.status, o.retry_count, o.last_error, \
   o.created_at, o.processed_at, o.claimed_by, o.claimed_until, o.available_at";

pub const RUN_COLUMNS: &str = "r.id, r.event_id, r.effect_type, r.priority, r.status, \
   r.attempts, r.error_message, r.created_at, r.started_at, r.completed_at";

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw values read directly from a `system_events` row.
pub struct RawEvent {
  pub id:          String,
  pub event_name:  String,
  pub entity_type: String,
  pub entity_id:   String,
  pub module:      String,
  pub occurred_at: String,
  pub payload:     String,
}

impl RawEvent {
  /// Read [`EVENT_COLUMNS`] starting at column `at`.
  pub fn from_row(row: &rusqlite::Row<'_>, at: usize) -> rusqlite::Result<Self> {
    Ok(Self {
      id:          row.get(at)?,
      event_name:  row.get(at + 1)?,
      entity_type: row.get(at + 2)?,
      entity_id:   row.get(at + 3)?,
      module:      row.get(at + 4)?,
      occurred_at: row.get(at + 5)?,
      payload:     row.get(at + 6)?,
    })
  }

  pub fn into_event(self) -> Result<SystemEvent> {
    Ok(SystemEvent {
      id:          decode_uuid(&self.id)?,
      event_name:  self.event_name,
      entity_type: self.entity_type,
      entity_id:   self.entity_id,
      module:      self.module,
      occurred_at: decode_dt(&self.occurred_at)?,
      payload:     serde_json::from_str(&self.payload)?,
    })
  }
}

/// Raw values read directly from an `outbox` row.
pub struct RawOutboxEntry {
  pub id:            String,
  pub event_id:      String,
  pub status:        String,
  pub retry_count:   u32,
  pub last_error:    Option<String>,
  pub created_at:    String,
  pub processed_at:  Option<String>,
  pub claimed_by:    Option<String>,
  pub claimed_until: Option<String>,
  pub available_at:  String,
}

impl RawOutboxEntry {
  /// Read [`OUTBOX_COLUMNS`] starting at column `at`.
  pub fn from_row(row: &rusqlite::Row<'_>, at: usize) -> rusqlite::Result<Self> {
    Ok(Self {
      id:            row.get(at)?,
      event_id:      row.get(at + 1)?,
      status:        row.get(at + 2)?,
      retry_count:   row.get(at + 3)?,
      last_error:    row.get(at + 4)?,
      created_at:    row.get(at + 5)?,
      processed_at:  row.get(at + 6)?,
      claimed_by:    row.get(at + 7)?,
      claimed_until: row.get(at + 8)?,
      available_at:  row.get(at + 9)?,
    })
  }

  pub fn into_entry(self) -> Result<OutboxEntry> {
    Ok(OutboxEntry {
      id:            decode_uuid(&self.id)?,
      event_id:      decode_uuid(&self.event_id)?,
      status:        decode_outbox_status(&self.status)?,
      retry_count:   self.retry_count,
      last_error:    self.last_error,
      created_at:    decode_dt(&self.created_at)?,
      processed_at:  decode_opt_dt(self.processed_at)?,
      claimed_by:    self.claimed_by,
      claimed_until: decode_opt_dt(self.claimed_until)?,
      available_at:  decode_dt(&self.available_at)?,
    })
  }
}

/// Raw values read directly from an `effect_runs` row.
pub struct RawEffectRun {
  pub id:            String,
  pub event_id:      String,
  pub effect_type:   String,
  pub priority:      i32,
  pub status:        String,
  pub attempts:      u32,
  pub error_message: Option<String>,
  pub created_at:    String,
  pub started_at:    Option<String>,
  pub completed_at:  Option<String>,
}

impl RawEffectRun {
  /// Read [`RUN_COLUMNS`] starting at column `at`.
  pub fn from_row(row: &rusqlite::Row<'_>, at: usize) -> rusqlite::Result<Self> {
    Ok(Self {
      id:            row.get(at)?,
      event_id:      row.get(at + 1)?,
      effect_type:   row.get(at + 2)?,
      priority:      row.get(at + 3)?,
      status:        row.get(at + 4)?,
      attempts:      row.get(at + 5)?,
      error_message: row.get(at + 6)?,
      created_at:    row.get(at + 7)?,
      started_at:    row.get(at + 8)?,
      completed_at:  row.get(at + 9)?,
    })
  }

  pub fn into_run(self) -> Result<EffectRun> {
    Ok(EffectRun {
      id:            decode_uuid(&self.id)?,
      event_id:      decode_uuid(&self.event_id)?,
      effect_type:   self.effect_type,
      priority:      self.priority,
      status:        decode_run_status(&self.status)?,
      attempts:      self.attempts,
      error_message: self.error_message,
      created_at:    decode_dt(&self.created_at)?,
      started_at:    decode_opt_dt(self.started_at)?,
      completed_at:  decode_opt_dt(self.completed_at)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone as _;

  use super::*;

  #[test]
  fn timestamps_sort_lexically() {
    let early = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
    let late  = early + chrono::Duration::milliseconds(1500);
    assert!(encode_dt(early) < encode_dt(late));
    assert_eq!(encode_dt(early).len(), encode_dt(late).len());
  }

  #[test]
  fn timestamp_roundtrip_keeps_micros() {
    let dt = Utc.timestamp_micros(1_700_000_000_123_456).unwrap();
    assert_eq!(decode_dt(&encode_dt(dt)).unwrap(), dt);
  }

  #[test]
  fn unknown_status_is_a_decode_error() {
    assert!(matches!(
      decode_outbox_status("archived"),
      Err(Error::Decode { column: "outbox.status", .. })
    ));
    assert!(decode_run_status("processing").is_ok());
  }
}
