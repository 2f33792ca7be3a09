//! effector-server binary.
//!
//! Reads `effector.toml` (or the path given with `--config`), opens the
//! SQLite store, upserts the configured catalog, starts the dispatcher
//! workers, and serves the JSON API over HTTP until Ctrl-C.

mod config;

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use clap::Parser;
use effector_api::ApiState;
use effector_core::store::DispatchStore;
use effector_dispatch::{Dispatcher, HandlerRegistry, LogHandler};
use effector_store_sqlite::SqliteStore;
use tokio::{
  net::TcpListener,
  sync::{Notify, watch},
};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;

#[derive(Parser)]
#[command(author, version, about = "Effector dispatch server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "effector.toml")]
  config: PathBuf,

  /// Number of dispatcher workers; overrides `dispatcher.worker_count`.
  #[arg(short, long)]
  workers: Option<usize>,

  /// Validate the configuration and exit.
  #[arg(long)]
  check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Load configuration.
  let mut server_cfg = ServerConfig::load(&cli.config)?;
  if let Some(workers) = cli.workers {
    server_cfg.dispatcher.worker_count = workers;
  }
  server_cfg.validate().context("invalid configuration")?;

  if cli.check {
    println!("configuration OK");
    return Ok(());
  }

  // Open SQLite store and seed the catalog.
  let store_path = expand_tilde(&server_cfg.store_path);
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;
  let store = Arc::new(store);
  seed_catalog(store.as_ref(), &server_cfg).await?;

  // Handlers.
  let mut handlers = HandlerRegistry::new();
  for effect_type in &server_cfg.log_handlers {
    handlers.register(effect_type.clone(), LogHandler::new(effect_type.clone()));
  }
  for effect_type in &server_cfg.effect_types {
    if effect_type.is_active && !handlers.contains(&effect_type.effect_type) {
      warn!(
        effect_type = %effect_type.effect_type,
        "no handler registered; runs of this effect type will fail"
      );
    }
  }

  // Dispatcher workers.
  let wake = Arc::new(Notify::new());
  let dispatcher = Dispatcher::new(store.clone(), handlers, server_cfg.dispatcher.clone())
    .with_wake(wake.clone());
  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let workers = dispatcher.spawn_workers(server_cfg.dispatcher.worker_count, shutdown_rx);
  info!(
    workers = server_cfg.dispatcher.worker_count,
    worker_prefix = %dispatcher.worker_id(),
    "dispatcher started"
  );

  // HTTP API.
  let app = effector_api::api_router(ApiState::new(store, wake));
  let address = format!("{}:{}", server_cfg.host, server_cfg.port);

  info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

  // Let in-flight cycles finish.
  let _ = shutdown_tx.send(true);
  for worker in workers {
    if let Err(e) = worker.await {
      warn!(error = %e, "dispatcher worker ended abnormally");
    }
  }
  info!("shutdown complete");

  Ok(())
}

/// Upsert the configured actions, effect types and mappings, in that order.
async fn seed_catalog<S: DispatchStore>(store: &S, cfg: &ServerConfig) -> anyhow::Result<()> {
  for action in &cfg.actions {
    store
      .register_action(action.clone())
      .await
      .with_context(|| format!("failed to register action {:?}", action.action_name))?;
  }
  for effect_type in &cfg.effect_types {
    store
      .register_effect_type(effect_type.clone())
      .await
      .with_context(|| format!("failed to register effect type {:?}", effect_type.effect_type))?;
  }
  for mapping in &cfg.mappings {
    store
      .register_mapping(mapping.clone())
      .await
      .with_context(|| {
        format!(
          "failed to register mapping {:?} -> {:?}",
          mapping.action_name, mapping.effect_type
        )
      })?;
  }
  info!(
    actions = cfg.actions.len(),
    effect_types = cfg.effect_types.len(),
    mappings = cfg.mappings.len(),
    "catalog seeded"
  );
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!(error = %e, "failed to listen for Ctrl-C; shutting down");
  }
  info!("shutdown signal received");
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
