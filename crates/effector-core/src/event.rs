//! System events, the append-only log of business actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// An immutable fact: an action happened to an entity. Never updated or
/// deleted once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
  pub id:          Uuid,
  /// The action name at the time of occurrence.
  pub event_name:  String,
  pub entity_type: String,
  pub entity_id:   String,
  pub module:      String,
  /// Server-assigned; never changes after creation.
  pub occurred_at: DateTime<Utc>,
  /// Opaque structured data handed to effect handlers.
  pub payload:     serde_json::Value,
}

/// Input to [`crate::store::DispatchStore::record_event`].
/// `id` and `occurred_at` are always assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
  pub action_name: String,
  pub entity_type: String,
  pub entity_id:   String,
  pub module:      String,
  #[serde(default)]
  pub payload:     serde_json::Value,
}

impl NewEvent {
  pub fn new(
    action_name: impl Into<String>,
    entity_type: impl Into<String>,
    entity_id: impl Into<String>,
    module: impl Into<String>,
  ) -> Self {
    Self {
      action_name: action_name.into(),
      entity_type: entity_type.into(),
      entity_id:   entity_id.into(),
      module:      module.into(),
      payload:     serde_json::Value::Null,
    }
  }

  pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
    self.payload = payload;
    self
  }

  /// Reject blank identifiers before anything reaches storage.
  pub fn validate(&self) -> Result<()> {
    for (field, value) in [
      ("action_name", &self.action_name),
      ("entity_type", &self.entity_type),
      ("entity_id", &self.entity_id),
    ] {
      if value.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{field} must not be blank")));
      }
    }
    Ok(())
  }
}
