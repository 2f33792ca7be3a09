//! Error types for `effector-core`.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  /// The action is missing from the registry or has been deactivated.
  #[error("unknown or inactive action: {0:?}")]
  UnknownAction(String),

  #[error("unknown effect type: {0:?}")]
  UnknownEffectType(String),

  #[error("no mapping from {action_name:?} to {effect_type:?}")]
  MappingNotFound { action_name: String, effect_type: String },

  #[error("no handler registered for effect type {0:?}")]
  HandlerNotRegistered(String),

  #[error("event not found: {0}")]
  EventNotFound(Uuid),

  #[error("outbox entry not found: {0}")]
  OutboxEntryNotFound(Uuid),

  #[error("effect run not found: {0}")]
  EffectRunNotFound(Uuid),

  /// The caller no longer owns the claim on this outbox entry; another
  /// worker reclaimed it after the visibility timeout elapsed.
  #[error("claim on outbox entry {entry_id} is no longer held by {owner:?}")]
  ClaimLost { entry_id: Uuid, owner: String },

  #[error("outbox entry {entry_id} still has {unfinished} unfinished effect run(s)")]
  UnfinishedEffects { entry_id: Uuid, unfinished: usize },

  #[error("invalid transition from {from} to {to}")]
  InvalidTransition { from: String, to: String },

  #[error("invalid input: {0}")]
  InvalidInput(String),

  #[error("invalid configuration: {0}")]
  InvalidConfig(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
