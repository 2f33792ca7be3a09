//! SQLite backend for the Effector dispatch engine.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Several processes may share one
//! database file: claims are taken inside `BEGIN IMMEDIATE` transactions with
//! conditional updates, so only one connection can win a given entry.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
