//! The moving parts of Effector: recording events, draining the outbox, and
//! executing effect handlers.
//!
//! Everything here is generic over [`effector_core::store::DispatchStore`],
//! so the same dispatcher runs against SQLite in production and against
//! wrapped stores in tests.
//!
//! # Wiring
//!
//! ```rust,ignore
//! let store = Arc::new(SqliteStore::open("effector.db").await?);
//! let wake = Arc::new(Notify::new());
//! let recorder = EventRecorder::new(store.clone(), wake.clone());
//! let dispatcher = Dispatcher::new(store, handlers, config).with_wake(wake);
//! let workers = dispatcher.spawn_workers(2, shutdown_rx);
//! ```

pub mod config;
pub mod dispatcher;
pub mod handler;
pub mod metrics;
pub mod recorder;

pub use config::DispatcherConfig;
pub use dispatcher::{CycleReport, Dispatcher};
pub use handler::{EffectError, EffectHandler, HandlerRegistry, LogHandler, handler_fn};
pub use metrics::MetricsAggregator;
pub use recorder::EventRecorder;
