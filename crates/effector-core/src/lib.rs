//! Core types and trait definitions for the Effector dispatch engine.
//!
//! This crate is deliberately free of runtime, HTTP and database
//! dependencies. Storage backends implement [`store::DispatchStore`]; the
//! dispatcher and API crates depend only on that abstraction.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod catalog;
pub mod effect_run;
pub mod error;
pub mod event;
pub mod metric;
pub mod outbox;
pub mod store;

pub use error::{Error, Result};
