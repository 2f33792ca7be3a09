//! Dispatcher tuning knobs.

use std::time::Duration;

use effector_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Timeouts, retry budget and polling cadence for the outbox workers.
///
/// Every field has a default, so a config file only needs to name what it
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
  /// Concurrent worker loops started by the server.
  pub worker_count:          usize,
  /// Maximum entries claimed per cycle.
  pub batch_size:            usize,
  /// How long a claim stays exclusive without being renewed.
  pub visibility_timeout_ms: u64,
  /// Upper bound on a single handler invocation.
  pub handler_timeout_ms:    u64,
  /// Failed cycles (including expired claims) before an entry is
  /// dead-lettered.
  pub max_retries:           u32,
  pub backoff_base_ms:       u64,
  pub backoff_max_ms:        u64,
  /// Idle sleep after an empty claim; doubles up to `max_poll_interval_ms`.
  pub poll_interval_ms:      u64,
  pub max_poll_interval_ms:  u64,
}

impl Default for DispatcherConfig {
  fn default() -> Self {
    Self {
      worker_count:          2,
      batch_size:            16,
      visibility_timeout_ms: 60_000,
      handler_timeout_ms:    30_000,
      max_retries:           5,
      backoff_base_ms:       1_000,
      backoff_max_ms:        60_000,
      poll_interval_ms:      500,
      max_poll_interval_ms:  5_000,
    }
  }
}

impl DispatcherConfig {
  pub fn visibility_timeout(&self) -> Duration {
    Duration::from_millis(self.visibility_timeout_ms)
  }

  pub fn handler_timeout(&self) -> Duration {
    Duration::from_millis(self.handler_timeout_ms)
  }

  pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_ms) }

  pub fn max_poll_interval(&self) -> Duration {
    Duration::from_millis(self.max_poll_interval_ms)
  }

  /// Delay before an entry that has already failed `retry_count` times may
  /// be claimed again: `base * 2^retry_count`, capped at `backoff_max_ms`.
  pub fn backoff(&self, retry_count: u32) -> Duration {
    let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    let millis = self
      .backoff_base_ms
      .saturating_mul(factor)
      .min(self.backoff_max_ms);
    Duration::from_millis(millis)
  }

  /// Reject configurations the dispatcher cannot honour.
  ///
  /// The handler timeout must be strictly below the visibility timeout,
  /// otherwise a slow handler could outlive its lease and let a second
  /// worker start the same effect.
  pub fn validate(&self) -> Result<()> {
    let invalid = |msg: String| Err(Error::InvalidConfig(msg));

    if self.worker_count == 0 {
      return invalid("worker_count must be at least 1".into());
    }
    if self.batch_size == 0 {
      return invalid("batch_size must be at least 1".into());
    }
    if self.max_retries == 0 {
      return invalid("max_retries must be at least 1".into());
    }
    if self.handler_timeout_ms == 0 {
      return invalid("handler_timeout_ms must be positive".into());
    }
    if self.handler_timeout_ms >= self.visibility_timeout_ms {
      return invalid(format!(
        "handler_timeout_ms ({}) must be less than visibility_timeout_ms ({})",
        self.handler_timeout_ms, self.visibility_timeout_ms
      ));
    }
    if self.backoff_base_ms > self.backoff_max_ms {
      return invalid(format!(
        "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
        self.backoff_base_ms, self.backoff_max_ms
      ));
    }
    if self.poll_interval_ms == 0 || self.poll_interval_ms > self.max_poll_interval_ms {
      return invalid(format!(
        "poll_interval_ms must be in 1..={}",
        self.max_poll_interval_ms
      ));
    }
    Ok(())
  }
}
