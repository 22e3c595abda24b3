//! buildhist - per-builder build status and build record cache
//!
//! Tracks the builds of one builder: allocates build numbers, persists
//! finished build records, serves a bounded in-memory view over them with
//! transparent disk fallback, enforces retention horizons and republishes
//! state transitions to subscribers.

pub mod builder;
pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod record;
pub mod requests;
pub mod retention;

pub use builder::{BuildQuery, BuilderState, BuilderStatus, StatusReceiver};
pub use error::{BuildhistError, BuildhistResult};
pub use record::{Build, BuildRecord, BuildResult};
