//! Effect handlers and the registry that maps `effect_type` keys to them.
//!
//! The dispatcher never knows what an effect does. It looks the handler up
//! by the run's `effect_type`, awaits it under a timeout, and records the
//! outcome. Handlers may be invoked more than once for the same event, so
//! they must be idempotent.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use effector_core::event::SystemEvent;
use thiserror::Error;
use tracing::info;

// ─── Handler trait ───────────────────────────────────────────────────────────

/// A failure reported by a handler. Recorded verbatim on the effect run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EffectError {
  message: String,
}

impl EffectError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }

  pub fn message(&self) -> &str { &self.message }
}

impl From<String> for EffectError {
  fn from(message: String) -> Self { Self { message } }
}

impl From<&str> for EffectError {
  fn from(message: &str) -> Self { Self::new(message) }
}

#[async_trait]
pub trait EffectHandler: Send + Sync {
  async fn handle(&self, event: &SystemEvent) -> Result<(), EffectError>;
}

// ─── Closure adapter ─────────────────────────────────────────────────────────

/// An [`EffectHandler`] backed by an async closure. Build with
/// [`handler_fn`].
pub struct HandlerFn<F> {
  f: F,
}

/// Wrap an async closure as an [`EffectHandler`].
///
/// The closure receives its own copy of the event so the returned future
/// can be `'static`.
///
/// ```rust,ignore
/// registry.register("notify_manager", handler_fn(|event| async move {
///   mailer.send(&event.entity_id).await.map_err(|e| EffectError::new(e.to_string()))
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
  F: Fn(SystemEvent) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), EffectError>> + Send + 'static,
{
  HandlerFn { f }
}

#[async_trait]
impl<F, Fut> EffectHandler for HandlerFn<F>
where
  F: Fn(SystemEvent) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), EffectError>> + Send + 'static,
{
  async fn handle(&self, event: &SystemEvent) -> Result<(), EffectError> {
    (self.f)(event.clone()).await
  }
}

// ─── Log handler ─────────────────────────────────────────────────────────────

/// Logs the event and succeeds. Useful for effect types whose real
/// implementation lives elsewhere, or while wiring up a new mapping.
#[derive(Debug, Clone)]
pub struct LogHandler {
  effect_type: String,
}

impl LogHandler {
  pub fn new(effect_type: impl Into<String>) -> Self {
    Self {
      effect_type: effect_type.into(),
    }
  }
}

#[async_trait]
impl EffectHandler for LogHandler {
  async fn handle(&self, event: &SystemEvent) -> Result<(), EffectError> {
    info!(
      effect_type = %self.effect_type,
      event_id = %event.id,
      event_name = %event.event_name,
      entity_type = %event.entity_type,
      entity_id = %event.entity_id,
      "effect executed"
    );
    Ok(())
  }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Explicit `effect_type` → handler map.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
  handlers: HashMap<String, Arc<dyn EffectHandler>>,
}

impl HandlerRegistry {
  pub fn new() -> Self { Self::default() }

  /// Register `handler` for `effect_type`, replacing any earlier one.
  pub fn register(
    &mut self,
    effect_type: impl Into<String>,
    handler: impl EffectHandler + 'static,
  ) -> &mut Self {
    self.handlers.insert(effect_type.into(), Arc::new(handler));
    self
  }

  /// Builder form of [`HandlerRegistry::register`].
  pub fn with(
    mut self,
    effect_type: impl Into<String>,
    handler: impl EffectHandler + 'static,
  ) -> Self {
    self.register(effect_type, handler);
    self
  }

  pub fn get(&self, effect_type: &str) -> Option<Arc<dyn EffectHandler>> {
    self.handlers.get(effect_type).cloned()
  }

  pub fn contains(&self, effect_type: &str) -> bool {
    self.handlers.contains_key(effect_type)
  }

  /// Registered effect types, sorted.
  pub fn effect_types(&self) -> Vec<&str> {
    let mut keys: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
    keys.sort_unstable();
    keys
  }

  pub fn len(&self) -> usize { self.handlers.len() }

  pub fn is_empty(&self) -> bool { self.handlers.is_empty() }
}

impl fmt::Debug for HandlerRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HandlerRegistry")
      .field("effect_types", &self.effect_types())
      .finish()
  }
}
