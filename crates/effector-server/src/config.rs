//! Server configuration: a TOML file layered with `EFFECTOR_*` environment
//! variables.
//!
//! Nested keys use a double underscore in the environment, e.g.
//! `EFFECTOR_DISPATCHER__MAX_RETRIES=8`.

use std::{
  collections::HashSet,
  path::{Path, PathBuf},
};

use anyhow::{Context as _, bail};
use effector_core::catalog::{ActionDefinition, EffectTypeDefinition, ImpactMapping};
use effector_dispatch::DispatcherConfig;
use serde::Deserialize;

/// Runtime server configuration, deserialised from `effector.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  #[serde(default = "default_host")]
  pub host:         String,
  #[serde(default = "default_port")]
  pub port:         u16,
  #[serde(default = "default_store_path")]
  pub store_path:   PathBuf,
  #[serde(default)]
  pub dispatcher:   DispatcherConfig,
  /// Catalog rows upserted at startup.
  #[serde(default)]
  pub actions:      Vec<ActionDefinition>,
  #[serde(default)]
  pub effect_types: Vec<EffectTypeDefinition>,
  #[serde(default)]
  pub mappings:     Vec<ImpactMapping>,
  /// Effect types served by the built-in logging handler.
  #[serde(default)]
  pub log_handlers: Vec<String>,
}

fn default_host() -> String { "127.0.0.1".to_string() }

fn default_port() -> u16 { 8080 }

fn default_store_path() -> PathBuf { PathBuf::from("effector.db") }

impl ServerConfig {
  /// Load `path` (if it exists) and overlay the environment.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path.to_path_buf()).required(false))
      .add_source(
        config::Environment::with_prefix("EFFECTOR")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true),
      )
      .build()
      .context("failed to read config file")?;

    settings
      .try_deserialize()
      .context("failed to deserialise ServerConfig")
  }

  /// Check the dispatcher knobs and that every mapping and log handler
  /// names a catalog entry declared in this file.
  pub fn validate(&self) -> anyhow::Result<()> {
    self.dispatcher.validate()?;

    let actions: HashSet<&str> = self.actions.iter().map(|a| a.action_name.as_str()).collect();
    let effect_types: HashSet<&str> = self
      .effect_types
      .iter()
      .map(|e| e.effect_type.as_str())
      .collect();

    for m in &self.mappings {
      if !actions.contains(m.action_name.as_str()) {
        bail!("mapping references undeclared action {:?}", m.action_name);
      }
      if !effect_types.contains(m.effect_type.as_str()) {
        bail!("mapping references undeclared effect type {:?}", m.effect_type);
      }
    }
    for name in &self.log_handlers {
      if !effect_types.contains(name.as_str()) {
        bail!("log handler for undeclared effect type {name:?}");
      }
    }
    Ok(())
  }
}
